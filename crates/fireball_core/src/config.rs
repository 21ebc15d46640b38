//! Runtime configuration of the sync subsystem.
//!
//! # Invariants
//! - Every field has a default; JSON documents only override what they name.
//! - The two author tags are non-empty and distinct.

use crate::model::change::{FOREGROUND_AUTHOR, IMPORT_AUTHOR};
use crate::sync::conflict::MergePolicy;
use crate::sync::remote_source::DEFAULT_ENDPOINT;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CURSOR_NAMESPACE: &str = "FireballWatch";
pub const DEFAULT_STORE_FILE_NAME: &str = "FireballWatch.sqlite";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub enum ConfigError {
    Parse(serde_json::Error),
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(err) => write!(f, "sync config is not valid JSON: {err}"),
            Self::Invalid { field, reason } => write!(f, "sync config `{field}` {reason}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// SQLite store file.
    pub store_path: PathBuf,
    /// Parent of the namespaced history cursor directory.
    pub app_support_dir: PathBuf,
    pub cursor_namespace: String,
    pub endpoint: String,
    pub http_timeout_secs: u64,
    pub foreground_author: String,
    pub import_author: String,
    pub merge_policy: MergePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_FILE_NAME),
            app_support_dir: PathBuf::from("."),
            cursor_namespace: DEFAULT_CURSOR_NAMESPACE.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            foreground_author: FOREGROUND_AUTHOR.to_string(),
            import_author: IMPORT_AUTHOR.to_string(),
            merge_policy: MergePolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Default layout under one data directory: store file and cursor
    /// namespace side by side.
    pub fn for_data_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            store_path: dir.join(DEFAULT_STORE_FILE_NAME),
            app_support_dir: dir.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_path.as_os_str().is_empty() {
            return Err(invalid("store_path", "must not be empty"));
        }
        let namespace = self.cursor_namespace.trim();
        if namespace.is_empty() {
            return Err(invalid("cursor_namespace", "must not be empty"));
        }
        if namespace.contains(['/', '\\']) || namespace == "." || namespace == ".." {
            return Err(invalid("cursor_namespace", "must be a single path component"));
        }
        if !(self.endpoint.starts_with("https://") || self.endpoint.starts_with("http://")) {
            return Err(invalid("endpoint", "must be an http(s) URL"));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid("http_timeout_secs", "must be positive"));
        }
        if self.foreground_author.trim().is_empty() {
            return Err(invalid("foreground_author", "must not be empty"));
        }
        if self.import_author.trim().is_empty() {
            return Err(invalid("import_author", "must not be empty"));
        }
        if self.foreground_author == self.import_author {
            return Err(invalid("import_author", "must differ from foreground_author"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason }
}
