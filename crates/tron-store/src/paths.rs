use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tron_core::SessionKey;

use crate::atomic;
use crate::error::StoreError;

/// Lock resource guarding the shared subagent registry file.
pub const REGISTRY_RESOURCE: &str = "subagent-registry";
/// Lock resource guarding the shared credential cooldown ledger.
pub const LEDGER_RESOURCE: &str = "credential-ledger";

const STEM_PREFIX_MAX: usize = 48;

/// Lock resource guarding one session.
pub fn session_resource(key: &SessionKey) -> String {
    format!("session:{key}")
}

/// File stem for an arbitrary key: a readable prefix plus a hash so distinct
/// keys never collide after sanitising.
pub fn stem(key: &str) -> String {
    let prefix: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(STEM_PREFIX_MAX)
        .collect();
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{hex}")
}

/// Where every persisted artifact lives under the data directory.
#[derive(Clone, Debug)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create every directory with owner-only permissions.
    pub fn ensure(&self) -> Result<(), StoreError> {
        for dir in [
            self.sessions_dir(),
            self.locks_dir(),
            self.sentinels_dir(),
            self.subagents_dir(),
            self.credentials_dir(),
            self.logs_dir(),
        ] {
            atomic::ensure_dir(&dir)?;
        }
        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_file(&self, key: &SessionKey) -> PathBuf {
        self.sessions_dir().join(format!("{}.json", stem(key.as_str())))
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn lock_file(&self, resource: &str) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", stem(resource)))
    }

    pub fn sentinels_dir(&self) -> PathBuf {
        self.root.join("sentinels")
    }

    pub fn sentinel_file(&self, key: &SessionKey) -> PathBuf {
        self.sentinels_dir().join(format!("{}.json", stem(key.as_str())))
    }

    pub fn subagents_dir(&self) -> PathBuf {
        self.root.join("subagents")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.subagents_dir().join("registry.json")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.root.join("credentials")
    }

    pub fn cooldown_ledger_file(&self) -> PathBuf {
        self.credentials_dir().join("cooldowns.json")
    }

    /// Default location of the credentials file.
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join("credentials.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn warn_log_file(&self) -> PathBuf {
        self.logs_dir().join("warn.jsonl")
    }

    /// Directories holding atomically written records.
    pub fn record_dirs(&self) -> [PathBuf; 5] {
        [
            self.sessions_dir(),
            self.locks_dir(),
            self.sentinels_dir(),
            self.subagents_dir(),
            self.credentials_dir(),
        ]
    }
}
