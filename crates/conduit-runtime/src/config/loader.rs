//! Configuration loader using figment.
//!
//! # Feature Flags
//!
//! - `toml-config` *(default)*: `conduit.toml` and `config.toml`
//! - `yaml-config`: `conduit.yaml`, `conduit.yml`, `config.yaml` and `config.yml`
//!
//! # Precedence (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic merges ([`ConfigLoader::merge`])
//! 3. Profile variant of the config file (`conduit.{profile}.toml`)
//! 4. The config file itself (`conduit.toml`)
//! 5. `CONDUIT_*` environment variables
//!
//! Variables use `__` between nested keys:
//!
//! - `CONDUIT_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `CONDUIT_TRANSPORT__REPLY_TIMEOUT_MS=500` → `transport.reply_timeout_ms = 500`
//! - `CONDUIT_SERVICE__NAMESPACE=billing` → `service.namespace = "billing"`
//!
//! ```rust,ignore
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .file("./deploy/conduit.toml")
//!     .load()?;
//! ```

use std::fmt;
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
use super::schema::ConduitConfig;
use super::validation::validate_config;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CONDUIT_";

/// Selects the profile when none is set on the loader.
pub const PROFILE_VAR: &str = "CONDUIT_PROFILE";

/// A configuration profile name, lowercased.
///
/// `prod` and `dev` are normalized to `production` and `development`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile(String);

impl Profile {
    pub const DEVELOPMENT: &'static str = "development";
    pub const PRODUCTION: &'static str = "production";

    pub fn parse(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        let name = match name.as_str() {
            "prod" => Self::PRODUCTION.to_string(),
            "dev" | "" => Self::DEVELOPMENT.to_string(),
            _ => name,
        };
        Self(name)
    }

    /// Reads [`PROFILE_VAR`], defaulting to development.
    pub fn from_env() -> Self {
        std::env::var(PROFILE_VAR)
            .map(|name| Self::parse(&name))
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_production(&self) -> bool {
        self.0 == Self::PRODUCTION
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self(Self::DEVELOPMENT.to_string())
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File formats compiled into this build, in search order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    #[cfg(feature = "toml-config")]
    Toml,
    #[cfg(feature = "yaml-config")]
    Yaml,
}

impl ConfigFormat {
    const ENABLED: &'static [ConfigFormat] = &[
        #[cfg(feature = "toml-config")]
        ConfigFormat::Toml,
        #[cfg(feature = "yaml-config")]
        ConfigFormat::Yaml,
    ];

    /// Candidate file names, most specific first.
    fn file_names(self) -> &'static [&'static str] {
        match self {
            #[cfg(feature = "toml-config")]
            Self::Toml => &["conduit.toml", "config.toml"],
            #[cfg(feature = "yaml-config")]
            Self::Yaml => &["conduit.yaml", "conduit.yml", "config.yaml", "config.yml"],
        }
    }

    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        Self::ENABLED.iter().copied().find(|format| {
            format
                .file_names()
                .iter()
                .any(|name| name.rsplit_once('.').is_some_and(|(_, e)| e == ext))
        })
    }

    #[allow(unused_variables)]
    fn merge(self, figment: Figment, path: &Path) -> Figment {
        match self {
            #[cfg(feature = "toml-config")]
            Self::Toml => figment.merge(Toml::file(path)),
            #[cfg(feature = "yaml-config")]
            Self::Yaml => figment.merge(Yaml::file(path)),
        }
    }
}

/// One file picked up by discovery.
#[derive(Debug)]
struct Discovered {
    path: PathBuf,
    format: ConfigFormat,
}

/// Layered configuration loader.
pub struct ConfigLoader {
    merged: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    use_env: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            merged: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            explicit_file: None,
            use_env: true,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a directory to search. Without any, the current directory and
    /// `<user config dir>/conduit` are searched.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.search_path(cwd),
            Err(_) => self,
        }
    }

    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.search_path(dir.join("conduit")),
            None => self,
        }
    }

    /// Loads exactly this file instead of searching.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Merges `config` over the defaults, below files and environment.
    pub fn merge(mut self, config: ConduitConfig) -> Self {
        self.merged = self.merged.merge(Serialized::defaults(config));
        self
    }

    /// Loads, then validates, the configuration.
    pub fn load(self) -> ConfigResult<ConduitConfig> {
        let files = self.discover()?;

        let mut figment = Figment::from(Serialized::defaults(ConduitConfig::default()))
            .merge(self.merged);
        for file in &files {
            info!(path = %file.path.display(), "Loading configuration file");
            figment = file.format.merge(figment, &file.path);
        }
        if self.use_env {
            trace!(prefix = ENV_PREFIX, "Loading environment variables");
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }

        let config: ConduitConfig = figment
            .extract()
            .map_err(Box::new)?;
        validate_config(&config)?;

        debug!(
            profile = %self.profile,
            files = files.len(),
            delimiter = %config.bus.delimiter,
            reply_timeout_ms = config.transport.reply_timeout_ms,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Files to merge, lowest precedence first.
    fn discover(&self) -> ConfigResult<Vec<Discovered>> {
        if let Some(path) = &self.explicit_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
            let format = ConfigFormat::from_path(path)
                .ok_or_else(|| ConfigError::UnsupportedFormat(path.clone()))?;
            return Ok(vec![Discovered {
                path: path.clone(),
                format,
            }]);
        }

        let directories = self.directories();
        let found: Vec<_> = ConfigFormat::ENABLED
            .iter()
            .filter_map(|&format| self.discover_format(format, &directories))
            .flatten()
            .collect();
        if found.is_empty() {
            warn!(paths = ?directories, "No configuration file found, using defaults");
        }
        Ok(found)
    }

    /// The first base file of `format`, preceded by its profile variant.
    fn discover_format(
        &self,
        format: ConfigFormat,
        directories: &[PathBuf],
    ) -> Option<Vec<Discovered>> {
        let base = directories
            .iter()
            .flat_map(|dir| format.file_names().iter().map(move |name| dir.join(name)))
            .find(|path| path.exists())?;

        let mut files = Vec::with_capacity(2);
        if let Some(variant) = profile_variant(&base, &self.profile)
            && variant.exists()
        {
            debug!(path = %variant.display(), "Found profile configuration");
            files.push(Discovered {
                path: variant,
                format,
            });
        }
        files.push(Discovered { path: base, format });
        Some(files)
    }

    fn directories(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        std::env::current_dir()
            .ok()
            .into_iter()
            .chain(dirs::config_dir().map(|dir| dir.join("conduit")))
            .collect()
    }
}

/// `conduit.toml` → `conduit.<profile>.toml`.
fn profile_variant(base: &Path, profile: &Profile) -> Option<PathBuf> {
    let stem = base.file_stem()?.to_str()?;
    let ext = base.extension()?.to_str()?;
    Some(base.with_file_name(format!("{stem}.{profile}.{ext}")))
}

/// Loads the configuration from the default locations.
pub fn load_config() -> ConfigResult<ConduitConfig> {
    ConfigLoader::new().load()
}

/// Loads the configuration from `path`, with environment overrides.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<ConduitConfig> {
    ConfigLoader::new().file(path).load()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_default_config() {
        Jail::expect_with(|jail| {
            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .without_env()
                .load()
                .unwrap();

            assert_eq!(config.logging.level, LogLevel::Info);
            assert_eq!(config.bus.delimiter, ".");
            assert_eq!(config.bus.default_priority, 1);
            assert_eq!(config.transport.reply_timeout_ms, 2000);
            assert!(config.service.namespace.is_empty());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("CONDUIT_TRANSPORT__REPLY_TIMEOUT_MS", "500");
            jail.set_env("CONDUIT_LOGGING__LEVEL", "debug");
            jail.set_env("CONDUIT_SERVICE__NAMESPACE", "billing");

            let config = ConfigLoader::new()
                .search_path(jail.directory())
                .load()
                .unwrap();
            assert_eq!(config.transport.reply_timeout_ms, 500);
            assert_eq!(config.logging.level, LogLevel::Debug);
            assert_eq!(config.service.namespace, "billing");
            Ok(())
        });
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_profile_file_under_base_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "conduit.production.toml",
                r#"
                [bus]
                delimiter = "/"
                default_priority = 5
                "#,
            )?;
            jail.create_file(
                "conduit.toml",
                r#"
                [bus]
                default_priority = 10
                "#,
            )?;

            let config = ConfigLoader::new()
                .profile("prod")
                .search_path(jail.directory())
                .without_env()
                .load()
                .unwrap();
            assert_eq!(config.bus.delimiter, "/");
            assert_eq!(config.bus.default_priority, 10);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new()
            .file("/nonexistent/conduit.toml")
            .without_env()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("CONDUIT_TRANSPORT__REPLY_TIMEOUT_MS", "0");
            let err = ConfigLoader::new()
                .search_path(jail.directory())
                .load()
                .unwrap_err();
            assert_eq!(err.field(), Some("transport.reply_timeout_ms"));
            Ok(())
        });
    }

    #[test]
    fn test_profile_names() {
        assert!(Profile::parse("PROD").is_production());
        assert_eq!(Profile::parse("dev"), Profile::default());
        assert_eq!(Profile::parse(" Staging ").as_str(), "staging");
    }
}
