//! Configuration loading.
//!
//! Sources merge in precedence order: built-in defaults, then configuration
//! files (with `toml-config`), then `TETHER_`-prefixed environment variables,
//! then programmatic overrides.

use std::path::PathBuf;

use figment::Figment;
use figment::providers::{Env, Serialized};

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::schema::TetherConfig;

/// Default configuration file name searched in each search path.
#[cfg(feature = "toml-config")]
const CONFIG_FILE: &str = "tether.toml";

/// Builder-style configuration loader.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    use_env: bool,
    overrides: Option<TetherConfig>,
}

impl ConfigLoader {
    /// Creates a loader with no sources beyond defaults and environment.
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
            explicit_file: None,
            use_env: true,
            overrides: None,
        }
    }

    /// Adds the current directory to the search path.
    pub fn with_current_dir(mut self) -> Self {
        self.search_paths.push(PathBuf::from("."));
        self
    }

    /// Adds the user's configuration directory to the search path.
    pub fn with_user_dir(mut self) -> Self {
        if let Some(dir) = dirs::config_dir() {
            self.search_paths.push(dir.join("tether"));
        }
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Loads a specific configuration file (highest-precedence file source).
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_file = Some(path.into());
        self
    }

    /// Enables environment variables (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Disables environment variables.
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Merges programmatic configuration on top of every other source.
    pub fn merge(mut self, config: TetherConfig) -> Self {
        self.overrides = Some(config);
        self
    }

    /// Loads and validates the configuration.
    pub fn load(self) -> ConfigResult<TetherConfig> {
        let mut figment = Figment::from(Serialized::defaults(TetherConfig::default()));

        #[cfg(feature = "toml-config")]
        {
            use figment::providers::{Format, Toml};
            for dir in &self.search_paths {
                figment = figment.merge(Toml::file(dir.join(CONFIG_FILE)));
            }
            if let Some(file) = &self.explicit_file {
                figment = figment.merge(Toml::file(file));
            }
        }
        #[cfg(not(feature = "toml-config"))]
        if let Some(file) = &self.explicit_file {
            return Err(ConfigError::Invalid(format!(
                "cannot load {}: built without the toml-config feature",
                file.display()
            )));
        }

        if self.use_env {
            // TETHER_GATEWAY__EVENT_BUFFER=512 style nesting.
            figment = figment.merge(Env::prefixed("TETHER_").split("__"));
        }

        if let Some(overrides) = self.overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: TetherConfig = figment.extract()?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token() -> TetherConfig {
        let mut config = TetherConfig::default();
        config.credentials.token = "secret".to_string();
        config
    }

    #[test]
    fn programmatic_overrides_satisfy_validation() {
        let config = ConfigLoader::new()
            .without_env()
            .merge(with_token())
            .load()
            .unwrap();
        assert_eq!(config.credentials.token, "secret");
    }

    #[test]
    fn defaults_alone_fail_validation() {
        let err = ConfigLoader::new().without_env().load().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn toml_file_merges_over_defaults() {
        let dir = std::env::temp_dir().join("tether-loader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[credentials]
token = "from-file"

[gateway]
event_buffer = 64
metadata_ttl = "2m"
"#,
        )
        .unwrap();

        let config = ConfigLoader::new()
            .without_env()
            .search_path(&dir)
            .load()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.credentials.token, "from-file");
        assert_eq!(config.gateway.event_buffer, 64);
        assert_eq!(
            config.gateway.metadata_ttl,
            std::time::Duration::from_secs(120)
        );
    }
}
