use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use tron_core::process::{Liveness, ProcessIdentity};
use tron_core::SessionKey;

use crate::atomic;
use crate::error::StoreError;
use crate::paths::StoreLayout;
use crate::schema::Record;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelPhase {
    Processing,
    Idle,
}

impl std::fmt::Display for SentinelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelRecord {
    pub session_key: SessionKey,
    pub phase: SentinelPhase,
    pub written_at: DateTime<Utc>,
    pub owner_pid: u32,
    pub owner_host: String,
}

impl Record for SentinelRecord {
    const SCHEMA: &'static str = "tron.sentinel";
    const VERSION: u32 = 1;
}

/// A session whose last turn never completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterruptedSession {
    pub session_key: SessionKey,
    pub since: DateTime<Utc>,
    pub owner: ProcessIdentity,
}

/// Per-session in-flight markers, written independently of the session lock.
#[derive(Clone, Debug)]
pub struct SentinelTracker {
    layout: StoreLayout,
    identity: ProcessIdentity,
    /// Age after which a sentinel from an unverifiable owner counts as interrupted.
    stale_after: Duration,
}

impl SentinelTracker {
    pub fn new(layout: StoreLayout, stale_after: Duration) -> Self {
        Self {
            layout,
            identity: ProcessIdentity::current(),
            stale_after,
        }
    }

    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    #[instrument(skip(self), fields(session_key = %key))]
    pub fn mark_processing(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.write(key, SentinelPhase::Processing)
    }

    #[instrument(skip(self), fields(session_key = %key))]
    pub fn clear(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.write(key, SentinelPhase::Idle)
    }

    pub fn get(&self, key: &SessionKey) -> Result<Option<SentinelRecord>, StoreError> {
        atomic::read_record(&self.layout.sentinel_file(key))
    }

    /// Sessions whose sentinel is still `processing` and whose writer is gone.
    ///
    /// Sentinels owned by another live local process belong to turns still
    /// running elsewhere and are skipped.
    pub fn scan_interrupted(&self) -> Result<Vec<InterruptedSession>, StoreError> {
        let mut interrupted = Vec::new();
        for path in atomic::list_records(&self.layout.sentinels_dir(), "json")? {
            let record = match atomic::read_record::<SentinelRecord>(&path) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(StoreError::IncompatibleSchema { path, found, .. }) => {
                    warn!(path = %path, found = %found, "skipping sentinel from an incompatible build");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if record.phase != SentinelPhase::Processing {
                continue;
            }
            let owner = ProcessIdentity::new(record.owner_pid, record.owner_host.clone());
            let abandoned = match owner.liveness() {
                Liveness::Dead => true,
                Liveness::Alive => false,
                Liveness::Unknown => {
                    (Utc::now() - record.written_at).to_std().unwrap_or_default() >= self.stale_after
                }
            };
            if abandoned {
                debug!(session_key = %record.session_key, owner = %owner, "interrupted turn found");
                interrupted.push(InterruptedSession {
                    session_key: record.session_key,
                    since: record.written_at,
                    owner,
                });
            }
        }
        Ok(interrupted)
    }

    fn write(&self, key: &SessionKey, phase: SentinelPhase) -> Result<(), StoreError> {
        let record = SentinelRecord {
            session_key: key.clone(),
            phase,
            written_at: Utc::now(),
            owner_pid: self.identity.pid,
            owner_host: self.identity.host.clone(),
        };
        atomic::write_record(&self.layout.sentinel_file(key), &record)
    }
}
