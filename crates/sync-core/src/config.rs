//! Synchronizer configuration.
//!
//! Loaded from an optional YAML file; `DIAGRAM_SYNC_READONLY_SCHEMES` in the
//! environment overrides the read-only scheme list.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Environment variable overriding `read_only_schemes` (comma-separated).
pub const READONLY_SCHEMES_ENV: &str = "DIAGRAM_SYNC_READONLY_SCHEMES";

/// Synchronizer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// URI schemes whose documents are never written back to.
    pub read_only_schemes: Vec<String>,
    /// Treat document change events with an empty change set as no-ops.
    pub ignore_empty_changes: bool,
    /// Spaces per nesting level when pretty-printing XML output.
    pub indent: usize,
    /// File-name suffixes selecting the output format.
    pub suffixes: FormatSuffixes,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_only_schemes: vec!["git".to_string(), "conflictResolution".to_string()],
            ignore_empty_changes: true,
            indent: 2,
            suffixes: FormatSuffixes::default(),
        }
    }
}

/// Suffix lists per output format. The longest matching suffix decides;
/// anything unmatched is diagram XML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormatSuffixes {
    pub diagram: Vec<String>,
    pub svg: Vec<String>,
    pub script: Vec<String>,
}

impl Default for FormatSuffixes {
    fn default() -> Self {
        Self {
            diagram: vec![".drawio".to_string(), ".dio".to_string()],
            svg: vec![".svg".to_string()],
            script: vec![".py".to_string()],
        }
    }
}

impl SyncConfig {
    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply overrides from environment variables.
    ///
    /// - `DIAGRAM_SYNC_READONLY_SCHEMES`: comma-separated scheme list
    pub fn apply_env(mut self) -> Self {
        if let Ok(value) = std::env::var(READONLY_SCHEMES_ENV) {
            self.read_only_schemes = parse_scheme_list(&value);
        }
        self
    }
}

fn parse_scheme_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Invalid config: {0}")]
    Parse(String),
}
