use std::path::PathBuf;

use thiserror::Error;

/// Why `resilience.json` could not be turned into usable settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings: {0}")]
    Io(#[from] std::io::Error),
    /// `--config` named a file that is not there.
    #[error("no settings file at {}", .0.display())]
    NotFound(PathBuf),
    #[error("settings are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Parsed fine, but a value is out of range or contradicts another one.
    #[error("{field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl SettingsError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
