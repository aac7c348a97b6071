//! Cooldown state shared between processes.
//!
//! Only state is persisted here, never secret material. Writers merge their
//! entries into the on-disk ledger under the ledger lock; the newest
//! `updated_at` wins per credential.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use tron_core::errors::FailureKind;
use tron_store::{atomic, LockManager, Record, StoreError, StoreLayout, LEDGER_RESOURCE};

use crate::credentials::{Credential, CredentialState};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub credential_id: String,
    pub provider: String,
    pub state: CredentialState,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub last_failure: Option<FailureKind>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Credential> for LedgerEntry {
    fn from(c: &Credential) -> Self {
        Self {
            credential_id: c.id.clone(),
            provider: c.provider.clone(),
            state: c.state,
            cooldown_until: c.cooldown_until,
            failure_count: c.failure_count,
            last_failure: c.last_failure,
            updated_at: c.updated_at,
        }
    }
}

impl LedgerEntry {
    /// Adopt this entry into `credential` if it is newer than what the
    /// credential already knows. Returns true if anything changed.
    pub fn apply_to(&self, credential: &mut Credential) -> bool {
        if credential.id != self.credential_id || self.updated_at <= credential.updated_at {
            return false;
        }
        credential.state = self.state;
        credential.cooldown_until = self.cooldown_until;
        credential.failure_count = self.failure_count;
        credential.last_failure = self.last_failure;
        credential.updated_at = self.updated_at;
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownLedger {
    pub entries: BTreeMap<String, LedgerEntry>,
}

impl Record for CooldownLedger {
    const SCHEMA: &'static str = "tron.cooldowns";
    const VERSION: u32 = 1;
}

impl CooldownLedger {
    /// Merge `entry`, keeping whichever side was updated last.
    pub fn merge(&mut self, entry: LedgerEntry) -> bool {
        match self.entries.get(&entry.credential_id) {
            Some(existing) if existing.updated_at >= entry.updated_at => false,
            _ => {
                self.entries.insert(entry.credential_id.clone(), entry);
                true
            }
        }
    }
}

/// Reads and writes the shared ledger file.
#[derive(Clone, Debug)]
pub struct LedgerStore {
    layout: StoreLayout,
    locks: LockManager,
}

impl LedgerStore {
    pub fn new(layout: StoreLayout, locks: LockManager) -> Self {
        Self { layout, locks }
    }

    /// Current ledger. Non-authoritative snapshot.
    pub fn load(&self) -> Result<CooldownLedger, StoreError> {
        Ok(atomic::read_record(&self.layout.cooldown_ledger_file())?.unwrap_or_default())
    }

    /// Merge `entries` into the ledger under the ledger lock.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn record(&self, entries: Vec<LedgerEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let handle = self
            .locks
            .acquire(LEDGER_RESOURCE, self.locks.config().timeout)
            .await?;
        let mut ledger = self.load()?;
        let changed = entries.into_iter().fold(false, |acc, e| ledger.merge(e) | acc);
        if changed {
            handle.verify()?;
            atomic::write_record(&self.layout.cooldown_ledger_file(), &ledger)?;
            debug!(credentials = ledger.entries.len(), "cooldown ledger updated");
        }
        handle.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use tron_store::LockConfig;

    fn store(dir: &std::path::Path) -> LedgerStore {
        let layout = StoreLayout::new(dir);
        LedgerStore::new(layout.clone(), LockManager::new(layout, LockConfig::default()))
    }

    fn cooled(id: &str, at: DateTime<Utc>) -> Credential {
        let mut c = Credential::new(id, "anthropic", SecretString::from("sk-hidden"));
        c.note_failure();
        c.enter_cooldown(FailureKind::RateLimit, at + chrono::Duration::seconds(60), at);
        c
    }

    #[tokio::test]
    async fn record_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = store(dir.path());
        let now = Utc::now();
        ledger.record(vec![LedgerEntry::from(&cooled("a", now))]).await.unwrap();

        let loaded = ledger.load().unwrap();
        let entry = &loaded.entries["a"];
        assert_eq!(entry.state, CredentialState::Cooldown);
        assert_eq!(entry.failure_count, 1);
        assert_eq!(entry.last_failure, Some(FailureKind::RateLimit));
    }

    #[tokio::test]
    async fn no_secrets_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = store(dir.path());
        ledger.record(vec![LedgerEntry::from(&cooled("a", Utc::now()))]).await.unwrap();
        let raw = std::fs::read_to_string(StoreLayout::new(dir.path()).cooldown_ledger_file()).unwrap();
        assert!(!raw.contains("sk-hidden"));
    }

    #[tokio::test]
    async fn older_writes_lose() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = store(dir.path());
        let now = Utc::now();
        ledger.record(vec![LedgerEntry::from(&cooled("a", now))]).await.unwrap();

        let mut stale = Credential::new("a", "anthropic", SecretString::from("x"));
        stale.record_success(now - chrono::Duration::seconds(5));
        ledger.record(vec![LedgerEntry::from(&stale)]).await.unwrap();

        assert_eq!(ledger.load().unwrap().entries["a"].state, CredentialState::Cooldown);
    }

    #[test]
    fn apply_only_newer() {
        let now = Utc::now();
        let entry = LedgerEntry::from(&cooled("a", now));

        let mut fresh = Credential::new("a", "anthropic", SecretString::from("x"));
        assert!(entry.apply_to(&mut fresh));
        assert_eq!(fresh.state, CredentialState::Cooldown);
        assert!(!entry.apply_to(&mut fresh));

        let mut other = Credential::new("b", "anthropic", SecretString::from("x"));
        assert!(!entry.apply_to(&mut other));
    }
}
