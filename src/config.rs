use crate::release::{InheritOptions, PublishOptions, Retention};
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read configuration file {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse configuration"))]
    Parse { source: toml::de::Error },
}

/// Settings of the release engine, every field optional.
///
/// ```toml
/// [release]
/// retention = 5            # or false to keep every inactive key
/// deactivate_invalid = true
///
/// [publish]
/// check = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub release: ReleaseConfig,
    pub publish: PublishOptions,
}

/// How releases are derived from their predecessor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReleaseConfig {
    pub retention: Retention,
    pub deactivate_invalid: bool,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        let options = InheritOptions::default();
        Self {
            retention: options.retention,
            deactivate_invalid: options.deactivate_invalid,
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).context(ParseSnafu)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), ?config, "loaded configuration");
        Ok(config)
    }

    pub fn inherit_options(&self) -> InheritOptions {
        InheritOptions {
            deactivate_invalid: self.release.deactivate_invalid,
            retention: self.release.retention,
        }
    }

    pub fn publish_options(&self) -> PublishOptions {
        self.publish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.inherit_options(), InheritOptions::default());
        assert!(config.publish_options().check);
    }

    #[test]
    fn every_field() {
        let config = Config::from_toml_str(
            r#"
            [release]
            retention = 3
            deactivate_invalid = false

            [publish]
            check = false
            "#,
        )
        .unwrap();

        let options = config.inherit_options();
        assert_eq!(options.retention, Retention::Releases(3));
        assert!(!options.deactivate_invalid);
        assert!(!config.publish_options().check);
    }

    #[test]
    fn retention_flag() {
        let config = Config::from_toml_str("[release]\nretention = false").unwrap();
        assert_eq!(config.release.retention, Retention::Disabled);
        assert!(config.release.deactivate_invalid);

        let config = Config::from_toml_str("[release]\nretention = true").unwrap();
        assert_eq!(config.release.retention, Retention::Releases(5));
    }

    #[test]
    fn unknown_field() {
        let err = Config::from_toml_str("[release]\nretain = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file() {
        let err = Config::load("/nonexistent/keyrelease.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(
            err.to_string(),
            "failed to read configuration file /nonexistent/keyrelease.toml"
        );
    }
}
