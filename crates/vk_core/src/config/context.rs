//! Device context configuration

use ash::vk;
use serde::{Deserialize, Serialize};

use super::{Config, ConfigError};

/// Settings a [`DeviceContext`](crate::vulkan::DeviceContext) is created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Application name reported to the driver
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Whether to enable validation; `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Present with FIFO (vsync) instead of MAILBOX
    pub limit_frame_rate: bool,
    /// Swapchain extent used when the surface leaves it to the application
    pub default_extent: (u32, u32),
    /// Request a graphics queue
    pub want_graphics: bool,
    /// Request a compute queue
    pub want_compute: bool,
    /// Longest a staged transfer waits on its fence, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Stage every buffer transfer, even into host-visible memory
    pub force_staging: bool,
    /// Default `env_logger` filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl ContextConfig {
    /// Create a configuration with defaults for `app_name`
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            enable_validation: None,
            limit_frame_rate: true,
            default_extent: (1280, 720),
            want_graphics: true,
            want_compute: false,
            fence_timeout_ns: 10_000_000_000,
            force_staging: false,
            log_level: "info".to_string(),
        }
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Choose between FIFO and MAILBOX presentation
    pub fn with_frame_rate_limit(mut self, limit: bool) -> Self {
        self.limit_frame_rate = limit;
        self
    }

    /// Set the fallback swapchain extent
    pub fn with_default_extent(mut self, width: u32, height: u32) -> Self {
        self.default_extent = (width, height);
        self
    }

    /// Choose which queues the device is created with
    pub fn with_queues(mut self, graphics: bool, compute: bool) -> Self {
        self.want_graphics = graphics;
        self.want_compute = compute;
        self
    }

    /// Set the staged transfer fence timeout
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Stage every buffer transfer regardless of memory type
    pub fn with_force_staging(mut self, force: bool) -> Self {
        self.force_staging = force;
        self
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Whether validation is on, resolving `None` by build type
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Packed application version
    pub fn packed_version(&self) -> u32 {
        let (major, minor, patch) = self.application_version;
        vk::make_api_version(0, major, minor, patch)
    }

    /// Fallback extent as a Vulkan extent
    pub fn default_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.default_extent.0,
            height: self.default_extent.1,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application name cannot be empty".to_string()));
        }
        if self.application_name.contains('\0') {
            return Err(ConfigError::Invalid("application name cannot contain NUL".to_string()));
        }
        if !self.want_graphics && !self.want_compute {
            return Err(ConfigError::Invalid("at least one of graphics or compute must be requested".to_string()));
        }
        if self.default_extent.0 == 0 || self.default_extent.1 == 0 {
            return Err(ConfigError::Invalid("default extent must be non-zero".to_string()));
        }
        if self.fence_timeout_ns == 0 {
            return Err(ConfigError::Invalid("fence timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new("vk_core application")
    }
}

impl Config for ContextConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ContextConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_extent(), vk::Extent2D { width: 1280, height: 720 });
        assert!(config.want_graphics);
        assert!(!config.want_compute);
    }

    #[test]
    fn test_builders() {
        let config = ContextConfig::new("demo")
            .with_version(2, 1, 3)
            .with_validation(false)
            .with_frame_rate_limit(false)
            .with_queues(true, true)
            .with_default_extent(640, 480);

        assert!(!config.validation_enabled());
        assert!(!config.limit_frame_rate);
        assert!(config.want_compute);
        assert_eq!(config.packed_version(), vk::make_api_version(0, 2, 1, 3));
        assert_eq!(config.default_extent(), vk::Extent2D { width: 640, height: 480 });
    }

    #[test]
    fn test_validation_follows_build_type_when_unset() {
        let config = ContextConfig::default();
        assert_eq!(config.validation_enabled(), cfg!(debug_assertions));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        assert!(ContextConfig::new("").validate().is_err());
        assert!(ContextConfig::new("a\0b").validate().is_err());
        assert!(ContextConfig::default().with_queues(false, false).validate().is_err());
        assert!(ContextConfig::default().with_default_extent(0, 720).validate().is_err());
        assert!(ContextConfig::default().with_fence_timeout(0).validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ContextConfig = toml::from_str(
            r#"
            application_name = "uploader"
            want_compute = true
            "#,
        )
        .unwrap();

        assert_eq!(config.application_name, "uploader");
        assert!(config.want_compute);
        assert!(config.want_graphics);
        assert_eq!(config.default_extent, (1280, 720));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ContextConfig::new("round trip").with_validation(true).with_log_level("debug");
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ContextConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_unsupported_extension() {
        let result = ContextConfig::load_from_file("config.yaml");
        assert!(matches!(result, Err(ConfigError::Io(_)) | Err(ConfigError::UnsupportedFormat(_))));
        let result = ContextConfig::default().save_to_file("config.yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ContextConfig::load_or_default("definitely/not/here.toml").unwrap();
        assert_eq!(config, ContextConfig::default());
    }
}
