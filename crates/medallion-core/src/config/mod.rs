//! Configuration loading shared by the medallion binaries.
//!
//! Config files are YAML with `${VAR}` style environment interpolation
//! applied before parsing.

mod vars;

pub use vars::{InterpolationResult, interpolate};

use serde::de::DeserializeOwned;
use snafu::prelude::*;
use std::path::Path;

use crate::error::{ConfigError, EnvInterpolationSnafu, ReadFileSnafu, YamlParseSnafu};

/// Interpolate environment variables in `text` and parse the result as YAML.
pub fn parse_yaml<T: DeserializeOwned>(text: &str) -> Result<T, ConfigError> {
    let interpolated = interpolate(text);
    ensure!(
        interpolated.is_ok(),
        EnvInterpolationSnafu {
            message: interpolated.errors.join("\n"),
        }
    );
    serde_yaml::from_str(&interpolated.text).context(YamlParseSnafu)
}

/// Read a YAML config file, interpolating environment variables.
pub fn load_yaml_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    parse_yaml(&text)
}
