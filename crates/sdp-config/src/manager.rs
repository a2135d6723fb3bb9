use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError};

/// Holds the live configuration and applies validated updates.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = T::from_toml_str(&content)?;
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn get(&self) -> arc_swap::Guard<Arc<T>> {
        self.config.load()
    }

    pub fn load_full(&self) -> Arc<T> {
        self.config.load_full()
    }

    pub fn update(&self, new_config: T) -> Result<(), ConfigError> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    /// Re-read the backing file and apply its hot-updatable fields.
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.path {
            let content = std::fs::read_to_string(path)?;
            let new_config = T::from_toml_str(&content)?;
            self.hot_update(&new_config)?;
            tracing::info!(?path, "config reloaded");
        }
        Ok(())
    }

    /// Apply the hot-updatable fields of `new_config`; the rest are kept.
    pub fn hot_update(&self, new_config: &T) -> Result<(), ConfigError> {
        let mut current = self.snapshot();
        current.hot_update(new_config);
        current.validate()?;
        self.config.store(Arc::new(current));
        Ok(())
    }

    pub fn snapshot(&self) -> T {
        (*self.config.load_full()).clone()
    }
}
