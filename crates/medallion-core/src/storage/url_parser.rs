//! URL parsing for storage backends.
//!
//! Extracts backend configuration from local filesystem paths and
//! `memory://` URLs.

use object_store::path::Path;
use regex::Regex;
use snafu::prelude::*;
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{LocalConfig, MemoryConfig};

const FILE_URI: &str = r"^file://(?P<path>/.*)$";
const FILE_URL: &str = r"^file:(?P<path>/.*)$";
const MEMORY_URL: &str = r"^memory://(?P<name>[A-Za-z0-9_\-\.]+)(/(?P<key>.*))?$";

static LOCAL_MATCHERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [FILE_URI, FILE_URL]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid file URL pattern"))
        .collect()
});

static MEMORY_MATCHER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MEMORY_URL).expect("valid memory URL pattern"));

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    ///
    /// Accepts `file:///abs`, `file:/abs`, plain filesystem paths (absolute or
    /// relative) and `memory://<name>[/<key>]`.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let trimmed = url.trim();
        ensure!(
            !trimmed.is_empty(),
            InvalidUrlSnafu {
                url: url.to_string()
            }
        );

        if let Some(caps) = MEMORY_MATCHER.captures(trimmed) {
            let name = caps["name"].to_string();
            let key = caps
                .name("key")
                .map(|k| k.as_str().trim_matches('/'))
                .filter(|k| !k.is_empty())
                .map(Path::from);
            return Ok(BackendConfig::Memory(MemoryConfig { name, key }));
        }

        if let Some(caps) = LOCAL_MATCHERS.iter().find_map(|r| r.captures(trimmed)) {
            return Ok(BackendConfig::Local(LocalConfig {
                path: normalize_local(&caps["path"]),
            }));
        }

        if trimmed.contains("://") {
            return InvalidUrlSnafu {
                url: url.to_string(),
            }
            .fail();
        }

        Ok(BackendConfig::Local(LocalConfig {
            path: normalize_local(trimmed),
        }))
    }

    /// Key prefix applied to every path, if the backend has one.
    pub fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::Local(_) => None,
            BackendConfig::Memory(config) => config.key.as_ref(),
        }
    }
}

fn normalize_local(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}
