//! Credentials and their cooldown state machine.
//!
//! A credential is `active` until a classified failure puts it into
//! `cooldown`; it becomes `active` again once `cooldown_until` has passed.
//! That transition is applied lazily when the credential is next considered
//! for selection, never by a timer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tron_core::errors::FailureKind;

/// Environment variables consulted when no credentials file entry exists.
pub const ENV_CREDENTIALS: &[(&str, &str)] = &[
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("openai", "OPENAI_API_KEY"),
    ("google", "GOOGLE_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
];

const CREDENTIALS_FILE_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read credentials file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed credentials file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported credentials file version {0}")]
    UnsupportedVersion(u32),
    #[error("duplicate credential id: {0}")]
    Duplicate(String),
    #[error("credential {0} has an empty secret")]
    EmptySecret(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    #[default]
    Active,
    Cooldown,
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Cooldown => f.write_str("cooldown"),
        }
    }
}

/// One API credential for one provider. State fields are mutated only by
/// the fallback manager.
#[derive(Clone)]
pub struct Credential {
    pub id: String,
    pub provider: String,
    secret: SecretString,
    pub state: CredentialState,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_failure: Option<FailureKind>,
    /// Last state change, used to order updates shared through the ledger.
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("cooldown_until", &self.cooldown_until)
            .field("failure_count", &self.failure_count)
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, secret: SecretString) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            secret,
            state: CredentialState::Active,
            cooldown_until: None,
            failure_count: 0,
            last_failure: None,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    /// Apply the lazy `cooldown -> active` transition. Returns true if the
    /// credential left cooldown.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == CredentialState::Cooldown && self.cooldown_until.map_or(true, |until| until <= now) {
            self.state = CredentialState::Active;
            self.cooldown_until = None;
            return true;
        }
        false
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            CredentialState::Active => true,
            CredentialState::Cooldown => self.cooldown_until.map_or(true, |until| until <= now),
        }
    }

    pub fn enter_cooldown(&mut self, kind: FailureKind, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = CredentialState::Cooldown;
        self.cooldown_until = Some(until);
        self.last_failure = Some(kind);
        self.updated_at = now;
    }

    /// Record a failure and return the new consecutive failure count.
    pub fn note_failure(&mut self) -> u32 {
        self.failure_count = self.failure_count.saturating_add(1);
        self.failure_count
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.state = CredentialState::Active;
        self.cooldown_until = None;
        self.failure_count = 0;
        self.last_failure = None;
        self.updated_at = now;
    }
}

/// Cooldown durations per failure kind.
#[derive(Clone, Debug)]
pub struct CooldownPolicy {
    pub rate_limit_base: Duration,
    pub auth_base: Duration,
    pub billing_base: Duration,
    pub max: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            rate_limit_base: Duration::from_secs(60),
            auth_base: Duration::from_secs(300),
            billing_base: Duration::from_secs(3_600),
            max: Duration::from_secs(6 * 3_600),
        }
    }
}

impl CooldownPolicy {
    /// Cooldown after the `failures`-th consecutive failure of `kind`.
    ///
    /// Rate limits grow by 5x per failure, auth and billing double. A
    /// provider `retry_after` hint lengthens the cooldown but never shortens
    /// it. Kinds that do not penalize credentials yield zero.
    pub fn duration(&self, kind: FailureKind, failures: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let computed = match kind {
            FailureKind::RateLimit => self.rate_limit_base.saturating_mul(5u32.saturating_pow(exponent)),
            FailureKind::Auth => self.auth_base.saturating_mul(2u32.saturating_pow(exponent)),
            FailureKind::Billing => self.billing_base.saturating_mul(2u32.saturating_pow(exponent)),
            _ => return Duration::ZERO,
        };
        computed.max(retry_after.unwrap_or_default()).min(self.max)
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    version: u32,
    #[serde(default)]
    credentials: Vec<CredentialEntry>,
}

#[derive(Deserialize)]
struct CredentialEntry {
    id: String,
    provider: String,
    secret: String,
}

/// Load credentials from `path` (if given and present) followed by the
/// provider environment variables.
pub fn load_credentials(path: Option<&Path>) -> Result<Vec<Credential>, CredentialError> {
    load_credentials_with(path, |name| std::env::var(name).ok())
}

/// Same as [`load_credentials`] with an injectable environment lookup.
pub fn load_credentials_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<Credential>, CredentialError> {
    let mut credentials: Vec<Credential> = Vec::new();

    if let Some(path) = path {
        match std::fs::read(path) {
            Ok(bytes) => {
                let file: CredentialsFile =
                    serde_json::from_slice(&bytes).map_err(|source| CredentialError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                if file.version != CREDENTIALS_FILE_VERSION {
                    return Err(CredentialError::UnsupportedVersion(file.version));
                }
                for entry in file.credentials {
                    if entry.secret.trim().is_empty() {
                        return Err(CredentialError::EmptySecret(entry.id));
                    }
                    if credentials.iter().any(|c| c.id == entry.id) {
                        return Err(CredentialError::Duplicate(entry.id));
                    }
                    credentials.push(Credential::new(
                        entry.id,
                        entry.provider,
                        SecretString::from(entry.secret),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no credentials file");
            }
            Err(source) => {
                return Err(CredentialError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    for (provider, var) in ENV_CREDENTIALS {
        let Some(secret) = lookup(var).filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        let id = format!("env:{provider}");
        if credentials.iter().any(|c| c.id == id) {
            continue;
        }
        credentials.push(Credential::new(id, *provider, SecretString::from(secret)));
    }

    Ok(credentials)
}
