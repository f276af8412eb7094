//! Parsing of the Action's default configuration (`src/defaults.json`).

use serde::Deserialize;
use thiserror::Error;

use crate::error::ErrorKind;

/// Repository-relative path of the configuration file on every release branch.
pub const DEFAULT_CONFIGURATION_PATH: &str = "src/defaults.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error decoding Action default configuration: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("the property \"bundleVersion\" was not set in the Action default configuration")]
    BundleVersionNotSet,
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        // The configuration comes from the source repository, not the operator.
        ErrorKind::Fatal
    }
}

/// The subset of the default configuration this tool depends on.
///
/// Unknown properties are ignored so that new upstream fields never break parsing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionConfiguration {
    #[serde(default)]
    pub bundle_version: String,
}

/// Parse the raw contents of `src/defaults.json`.
pub fn parse(contents: &str) -> Result<ActionConfiguration, ConfigError> {
    let configuration: ActionConfiguration = serde_json::from_str(contents)?;
    if configuration.bundle_version.is_empty() {
        return Err(ConfigError::BundleVersionNotSet);
    }
    Ok(configuration)
}
