//! Foundation module - logging setup shared by the library and its binaries

pub mod logging;
