//! Cross-process mutual exclusion backed by lock files.
//!
//! A lock is a [`LockRecord`] published with an exclusive create. A held lock
//! whose owner is provably dead (same host, pid gone) is stolen on the next
//! attempt; a lock owned by another host is only stolen once it is older
//! than the staleness threshold.
//!
//! Removing a record, whether by steal or release, happens only while holding
//! an advisory `flock` on `<stem>.steal` and only after re-reading the record
//! under it. Creation needs no guard: the exclusive create already fails
//! while any record is in place.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use tron_core::process::{Liveness, ProcessIdentity};

use crate::atomic;
use crate::error::StoreError;
use crate::paths::StoreLayout;
use crate::schema::{self, Record};

/// Attempts to clear a stale record before reporting contention for this round.
const MAX_STEALS_PER_ATTEMPT: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource_key: String,
    pub owner_pid: u32,
    pub owner_host: String,
    /// Distinguishes holders inside one process.
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
}

impl Record for LockRecord {
    const SCHEMA: &'static str = "tron.lock";
    const VERSION: u32 = 1;
}

impl LockRecord {
    pub fn owner(&self) -> ProcessIdentity {
        ProcessIdentity::new(self.owner_pid, self.owner_host.clone())
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Age after which a lock whose owner cannot be checked is stale.
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_initial: Duration::from_millis(25),
            retry_max: Duration::from_millis(500),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Current holder of a resource, as seen by a non-authoritative read.
#[derive(Clone, Debug)]
pub struct LockStatus {
    pub record: LockRecord,
    pub stale: bool,
}

#[derive(Clone, Debug)]
pub struct LockManager {
    layout: StoreLayout,
    config: LockConfig,
    identity: ProcessIdentity,
}

impl LockManager {
    pub fn new(layout: StoreLayout, config: LockConfig) -> Self {
        Self {
            layout,
            config,
            identity: ProcessIdentity::current(),
        }
    }

    /// Acquire on behalf of another identity. Used by tests to impersonate
    /// foreign owners.
    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    /// Acquire `resource`, waiting with jittered exponential backoff until
    /// `timeout` elapses.
    #[instrument(skip(self), fields(resource = %resource))]
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockHandle, StoreError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut delay = self.config.retry_initial;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(handle) = self.try_acquire(resource)? {
                if attempts > 1 {
                    debug!(attempts, waited_ms = started.elapsed().as_millis() as u64, "lock acquired after contention");
                }
                return Ok(handle);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(attempts, waited_ms = started.elapsed().as_millis() as u64, "lock busy, giving up");
                return Err(StoreError::Busy {
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                });
            }

            let sleep = jittered(delay).min(deadline - now);
            tokio::time::sleep(sleep).await;
            delay = (delay * 2).min(self.config.retry_max);
        }
    }

    /// One non-blocking acquisition round. A stale holder is displaced within
    /// this call, so reclaiming a crashed owner's lock never waits for backoff.
    pub fn try_acquire(&self, resource: &str) -> Result<Option<LockHandle>, StoreError> {
        let path = self.layout.lock_file(resource);
        let record = LockRecord {
            resource_key: resource.to_string(),
            owner_pid: self.identity.pid,
            owner_host: self.identity.host.clone(),
            owner_token: uuid::Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
        };
        let bytes = schema::encode(&record)?;

        for _ in 0..=MAX_STEALS_PER_ATTEMPT {
            if atomic::create_exclusive(&path, &bytes)? {
                debug!(resource, token = %record.owner_token, "lock acquired");
                return Ok(Some(LockHandle {
                    path,
                    record,
                    released: false,
                }));
            }

            let Some(existing) = atomic::read_record::<LockRecord>(&path)? else {
                // Released (or quarantined) between our create and read.
                continue;
            };
            if !self.is_stale(&existing) {
                return Ok(None);
            }
            match remove_if_token(&path, &existing.owner_token)? {
                Take::Taken => {
                    warn!(
                        resource,
                        previous_owner = %existing.owner(),
                        held_for_secs = existing.age().as_secs(),
                        "stale lock reclaimed"
                    );
                }
                // Someone else cleared or replaced it first; look again.
                Take::Vanished | Take::Mismatch => {}
            }
        }

        // The last round may have cleared a stale record; claim it.
        if atomic::create_exclusive(&path, &bytes)? {
            debug!(resource, token = %record.owner_token, "lock acquired");
            return Ok(Some(LockHandle {
                path,
                record,
                released: false,
            }));
        }
        Ok(None)
    }

    /// Release a handle. Equivalent to dropping it, but reports failures.
    pub fn release(&self, handle: LockHandle) -> Result<(), StoreError> {
        handle.release()
    }

    pub fn inspect(&self, resource: &str) -> Result<Option<LockStatus>, StoreError> {
        let path = self.layout.lock_file(resource);
        Ok(atomic::read_record::<LockRecord>(&path)?.map(|record| LockStatus {
            stale: self.is_stale(&record),
            record,
        }))
    }

    /// Every lock currently on disk.
    pub fn inspect_all(&self) -> Result<Vec<LockStatus>, StoreError> {
        let mut out = Vec::new();
        for path in atomic::list_records(&self.layout.locks_dir(), "lock")? {
            if let Some(record) = atomic::read_record::<LockRecord>(&path)? {
                out.push(LockStatus {
                    stale: self.is_stale(&record),
                    record,
                });
            }
        }
        Ok(out)
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        match record.owner().liveness() {
            Liveness::Dead => true,
            Liveness::Alive => false,
            Liveness::Unknown => record.age() >= self.config.stale_after,
        }
    }
}

/// Proof of holding a lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.record.resource_key
    }

    pub fn token(&self) -> &str {
        &self.record.owner_token
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Confirm the lock file on disk still names this holder.
    pub fn verify(&self) -> Result<(), StoreError> {
        match atomic::read_bytes(&self.path)? {
            Some(bytes) => match schema::decode::<LockRecord>(&bytes) {
                Ok(current) if current.owner_token == self.record.owner_token => Ok(()),
                _ => Err(StoreError::LockLost(self.record.resource_key.clone())),
            },
            None => Err(StoreError::LockLost(self.record.resource_key.clone())),
        }
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<(), StoreError> {
        match remove_if_token(&self.path, &self.record.owner_token)? {
            Take::Taken => {
                debug!(resource = %self.record.resource_key, "lock released");
                Ok(())
            }
            Take::Vanished | Take::Mismatch => {
                warn!(
                    resource = %self.record.resource_key,
                    "lock was taken over before release; leaving the new holder in place"
                );
                Err(StoreError::LockLost(self.record.resource_key.clone()))
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.release_inner() {
                info!(resource = %self.record.resource_key, error = %e, "lock release on drop failed");
            }
        }
    }
}

enum Take {
    /// The record carried the expected token and is gone now.
    Taken,
    /// Nothing was there.
    Vanished,
    /// Another holder owns it; it was left alone.
    Mismatch,
}

/// Exclusive right to remove the lock record next to it. Released on drop.
struct RemovalGuard {
    file: File,
}

impl RemovalGuard {
    fn acquire(lock_path: &Path) -> Result<Self, StoreError> {
        let path = lock_path.with_extension("steal");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(format!("open {}", path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::io(format!("flock {}", path.display()), e))?;
        Ok(Self { file })
    }
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Remove the lock file at `path` only if it still carries `token`.
///
/// Other removers wait on the guard, and no one can create a record while
/// this one exists, so the record read here is the one removed.
fn remove_if_token(path: &Path, token: &str) -> Result<Take, StoreError> {
    let _guard = RemovalGuard::acquire(path)?;

    let current = match atomic::read_bytes(path)? {
        Some(bytes) => schema::decode::<LockRecord>(&bytes).ok(),
        None => return Ok(Take::Vanished),
    };
    if !current.is_some_and(|record| record.owner_token == token) {
        return Ok(Take::Mismatch);
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(Take::Taken),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Take::Vanished),
        Err(e) => Err(StoreError::io(format!("remove {}", path.display()), e)),
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}
