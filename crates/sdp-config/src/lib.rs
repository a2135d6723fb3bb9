//! Configuration plumbing.
//!
//! Config structs implement [`Config`], usually through
//! `#[derive(Config)]`, and are held by a [`ConfigManager`] that validates
//! updates and applies hot-updatable fields on reload.

extern crate self as sdp_config;

mod manager;

pub use manager::ConfigManager;
pub use sdp_config_derive::Config;
pub use toml;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("field `{field}`: expected {expected}")]
    TypeMismatch { field: String, expected: String },

    #[error("field `{field}` = {value} out of range [{}, {}]",
        min.as_deref().unwrap_or("-"), max.as_deref().unwrap_or("-"))]
    OutOfRange {
        field: String,
        value: String,
        min: Option<String>,
        max: Option<String>,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A configuration section.
pub trait Config: Sized + Send + Sync + 'static {
    /// Build from a TOML table; absent keys take their defaults.
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError>;

    /// Copy the hot-updatable fields of `other` into `self`.
    fn hot_update(&mut self, other: &Self);

    /// Render as TOML.
    fn render(&self) -> String;

    fn validate(&self) -> Result<(), ConfigError>;

    /// Parse a TOML document.
    fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let value: toml::Value = s.parse()?;
        let config = Self::from_toml(&value)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Config)]
    struct Inner {
        #[config(default = 3, min = 1, max = 10, hot_updated)]
        depth: u32,
        #[config(default = 0.5)]
        ratio: f64,
    }

    #[derive(Clone, Debug, Config)]
    struct Outer {
        #[config(default = "sdp")]
        name: String,
        #[config(default = true, hot_updated)]
        enabled: bool,
        #[config(default = 64, min = 2)]
        slots: u64,
        #[config(section)]
        inner: Inner,
    }

    #[derive(Clone, Debug, Config)]
    #[config(check = Self::ordered)]
    struct Window {
        #[config(default = 1, hot_updated)]
        lo: u32,
        #[config(default = 8, hot_updated)]
        hi: u32,
    }

    impl Window {
        fn ordered(&self) -> Result<(), ConfigError> {
            if self.lo > self.hi {
                return Err(ConfigError::Invalid("lo above hi".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_struct_check_runs_in_validate() {
        Window::default().validate().unwrap();
        let err = Window::from_toml_str("lo = 9").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let mgr = ConfigManager::new(Window::default());
        assert!(mgr.hot_update(&Window { lo: 20, hi: 10 }).is_err());
        assert_eq!(mgr.get().lo, 1);
        mgr.hot_update(&Window { lo: 2, hi: 10 }).unwrap();
        assert_eq!(mgr.get().hi, 10);
    }

    #[test]
    fn test_defaults() {
        let cfg = Outer::default();
        assert_eq!(cfg.name, "sdp");
        assert!(cfg.enabled);
        assert_eq!(cfg.slots, 64);
        assert_eq!(cfg.inner.depth, 3);
        assert!((cfg.inner.ratio - 0.5).abs() < f64::EPSILON);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_from_toml_partial() {
        let cfg = Outer::from_toml_str("slots = 128\n[inner]\ndepth = 7\n").unwrap();
        assert_eq!(cfg.slots, 128);
        assert_eq!(cfg.inner.depth, 7);
        assert_eq!(cfg.name, "sdp");
    }

    #[test]
    fn test_type_mismatch() {
        let err = Outer::from_toml_str("enabled = 3").unwrap_err();
        assert!(matches!(err, ConfigError::TypeMismatch { ref field, .. } if field == "enabled"));
    }

    #[test]
    fn test_out_of_range() {
        let err = Outer::from_toml_str("[inner]\ndepth = 11").unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref field, .. } if field == "depth"));
        assert!(err.to_string().contains("[-, 10]"));
        assert!(Outer::from_toml_str("slots = 1").is_err());
    }

    #[test]
    fn test_hot_update_only_touches_marked_fields() {
        let mut cfg = Outer::default();
        let mut other = Outer::default();
        other.enabled = false;
        other.slots = 999;
        other.inner.depth = 9;
        other.name = "other".into();
        cfg.hot_update(&other);
        assert!(!cfg.enabled);
        assert_eq!(cfg.inner.depth, 9);
        assert_eq!(cfg.slots, 64);
        assert_eq!(cfg.name, "sdp");
    }

    #[test]
    fn test_render_parses_back() {
        let mut cfg = Outer::default();
        cfg.slots = 4096;
        cfg.inner.ratio = 0.25;
        let rendered = cfg.render();
        assert!(rendered.contains("[inner]"));
        let back = Outer::from_toml_str(&rendered).unwrap();
        assert_eq!(back.slots, 4096);
        assert!((back.inner.ratio - 0.25).abs() < f64::EPSILON);
    }
}
