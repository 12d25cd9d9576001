//! Moving data between the host and device memory

pub mod pipeline;
pub mod staging;

pub use pipeline::{StridedCopy, TransferPipeline, TransferSettings};
pub use staging::StagingBuffer;
