//! Configuration loader using figment.
//!
//! # Feature Flags
//!
//! - `toml-config` *(default)*: `gramflow.toml` files
//! - `yaml-config`: `gramflow.yaml` / `gramflow.yml` files
//!
//! Both can be enabled at once; each enabled format is searched.
//!
//! # Configuration Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Profile-specific file (`gramflow.{profile}.toml` / `gramflow.{profile}.yaml`)
//! 3. Main file (`gramflow.toml` / `gramflow.yaml`)
//! 4. Environment variables (`GRAMFLOW_*`)
//! 5. Programmatic overrides passed to [`ConfigLoader::merge`]
//!
//! # Environment Variable Mapping
//!
//! The `GRAMFLOW_` prefix is stripped and `__` separates nested keys:
//!
//! - `GRAMFLOW_DISPATCHER__WORKER_COUNT=8` → `dispatcher.worker_count = 8`
//! - `GRAMFLOW_RATE_LIMIT__MODE=reject` → `rate_limit.mode = "reject"`
//! - `GRAMFLOW_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//!
//! The profile itself comes from `GRAMFLOW_PROFILE`.
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .file("./deploy/gramflow.toml")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::GramflowConfig;

const ENV_PREFIX: &str = "GRAMFLOW_";
const PROFILE_VAR: &str = "GRAMFLOW_PROFILE";

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Parses a profile name; `dev` and `prod` are accepted as aliases.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads `GRAMFLOW_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_VAR)
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layered configuration loader.
pub struct ConfigLoader {
    /// Programmatic overrides, merged last.
    overrides: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    /// Specific file to load instead of searching.
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            overrides: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a search path for configuration files.
    ///
    /// Without explicit paths the current directory and the user config
    /// directory (`~/.config/gramflow` on Linux) are searched.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        if let Ok(cwd) = std::env::current_dir() {
            self.search_path(cwd)
        } else {
            self
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        if let Some(config_dir) = dirs::config_dir() {
            self.search_path(config_dir.join("gramflow"))
        } else {
            self
        }
    }

    /// Loads exactly this file; a missing file is an error.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges `config` over every other source.
    pub fn merge(mut self, config: GramflowConfig) -> Self {
        self.overrides = self.overrides.merge(Serialized::defaults(config));
        self
    }

    /// Loads and returns the configuration.
    pub fn load(self) -> ConfigResult<GramflowConfig> {
        let profile = self.profile.clone();
        let config: GramflowConfig = self.build_figment()?.extract()?;

        debug!(
            profile = %profile,
            workers = config.dispatcher.worker_count,
            queue_capacity = config.dispatcher.queue_capacity,
            logging_level = %config.logging.level,
            "Configuration loaded"
        );

        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(GramflowConfig::default()));

        if let Some(path) = self.config_file.take() {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path));
            }
            info!(path = %path.display(), "Loading configuration file");
            figment = Self::merge_config_file(figment, &path)?;
        } else {
            figment = self.load_config_files(figment);
        }

        if self.load_env {
            trace!(prefix = ENV_PREFIX, "Loading environment variables");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }

        Ok(figment.merge(self.overrides))
    }

    /// Merges a single file, dispatching on its extension.
    fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "toml-config")]
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("gramflow"));
        }
        paths
    }

    /// Searches `search_paths × base_names`. For each candidate the profile
    /// file is merged first, then the base file; the first base file found
    /// ends the search.
    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        base_names: &[&str],
        merge_fn: F,
    ) -> (Figment, bool)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for search_path in search_paths {
            for base_name in base_names {
                let Some((stem, ext)) = base_name.rsplit_once('.') else {
                    continue;
                };

                let profile_path =
                    search_path.join(format!("{stem}.{}.{ext}", self.profile.as_str()));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge_fn(figment, &profile_path);
                }

                let base_path = search_path.join(base_name);
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    return (merge_fn(figment, &base_path), true);
                }
            }
        }
        (figment, false)
    }

    #[allow(unused_mut)]
    fn load_config_files(&self, mut figment: Figment) -> Figment {
        let search_paths = self.resolve_search_paths();
        let mut found = false;

        #[cfg(feature = "toml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["gramflow.toml"],
                |fig, path| fig.merge(Toml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        #[cfg(feature = "yaml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["gramflow.yaml", "gramflow.yml"],
                |fig, path| fig.merge(Yaml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        if !found {
            debug!(paths = ?search_paths, "No configuration file found, using defaults");
        }
        if search_paths.is_empty() {
            warn!("No configuration search path available");
        }
        figment
    }
}

/// Loads from the default locations with environment overrides.
pub fn load_config() -> ConfigResult<GramflowConfig> {
    ConfigLoader::new().load()
}

/// Loads a specific file with environment overrides.
pub fn load_config_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<GramflowConfig> {
    ConfigLoader::new().file(path).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use gramflow_framework::{LimitMode, OverflowPolicy};

    use crate::config::LogLevel;

    #[test]
    fn test_default_config() {
        Jail::expect_with(|jail| {
            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .without_env()
                .load()
                .unwrap();
            assert_eq!(config.dispatcher.worker_count, 4);
            assert_eq!(config.dispatcher.queue_capacity, 1024);
            assert_eq!(config.logging.level.as_str(), "info");
            Ok(())
        });
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(Profile::parse("prod"), Profile::Production);
        assert_eq!(Profile::parse("Development"), Profile::Development);
        assert_eq!(Profile::parse("staging"), Profile::Custom("staging".into()));
    }

    #[test]
    fn test_profile_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env(PROFILE_VAR, "production");
            assert_eq!(Profile::from_env(), Profile::Production);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("GRAMFLOW_DISPATCHER__WORKER_COUNT", "8");
            jail.set_env("GRAMFLOW_DISPATCHER__OVERFLOW", "reject");
            jail.set_env("GRAMFLOW_RATE_LIMIT__MODE", "reject");
            jail.set_env("GRAMFLOW_RATE_LIMIT__RATE", "2.5");
            jail.set_env("GRAMFLOW_LOGGING__LEVEL", "debug");

            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .load()
                .unwrap();
            assert_eq!(config.dispatcher.worker_count, 8);
            assert_eq!(config.dispatcher.overflow, OverflowPolicy::Reject);
            assert_eq!(config.rate_limit.mode, LimitMode::Reject);
            assert_eq!(config.rate_limit.rate, 2.5);
            assert_eq!(config.logging.level, LogLevel::Debug);
            Ok(())
        });
    }

    #[test]
    fn test_programmatic_merge_wins() {
        Jail::expect_with(|jail| {
            jail.set_env("GRAMFLOW_DISPATCHER__WORKER_COUNT", "8");

            let mut overrides = GramflowConfig::default();
            overrides.dispatcher.worker_count = 2;
            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .merge(overrides)
                .load()
                .unwrap();
            assert_eq!(config.dispatcher.worker_count, 2);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new()
            .file("/nonexistent/gramflow.toml")
            .without_env()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        Jail::expect_with(|jail| {
            jail.create_file("gramflow.ini", "workers = 1")?;
            let err = ConfigLoader::new()
                .file("gramflow.ini")
                .without_env()
                .load()
                .unwrap_err();
            assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == "ini"));
            Ok(())
        });
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_toml_file_with_profile_layer() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gramflow.production.toml",
                r#"
                [dispatcher]
                worker_count = 16
                queue_capacity = 4096
                "#,
            )?;
            jail.create_file(
                "gramflow.toml",
                r#"
                [dispatcher]
                worker_count = 2
                shard_by_chat = true
                drain_timeout_ms = 200

                [rate_limit]
                rate = 1.0
                capacity = 5.0

                [rate_limit.overrides."-100200"]
                rate = 0.5
                capacity = 1.0
                "#,
            )?;

            let config = ConfigLoader::new()
                .profile("prod")
                .search_path(jail.directory())
                .without_env()
                .load()
                .unwrap();

            // main file overrides the profile file, which overrides defaults
            assert_eq!(config.dispatcher.worker_count, 2);
            assert_eq!(config.dispatcher.queue_capacity, 4096);
            assert!(config.dispatcher.shard_by_chat);
            assert_eq!(config.dispatcher.drain_timeout_ms, 200);
            assert_eq!(config.rate_limit.capacity, 5.0);
            assert_eq!(config.rate_limit.overrides["-100200"].rate, 0.5);
            Ok(())
        });
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_malformed_value_is_parse_error() {
        Jail::expect_with(|jail| {
            jail.create_file("gramflow.toml", "[dispatcher]\nworker_count = \"many\"\n")?;
            let err = ConfigLoader::new()
                .search_path(jail.directory())
                .without_env()
                .load()
                .unwrap_err();
            assert!(matches!(err, ConfigError::ParseError(_)));
            Ok(())
        });
    }
}
