use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use tron_core::tokens::estimate_turns_tokens;
use tron_core::{SessionKey, Turn};

use crate::atomic;
use crate::error::StoreError;
use crate::lock::{LockHandle, LockManager};
use crate::paths::{session_resource, StoreLayout};
use crate::schema::Record;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for ThinkingLevel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown thinking level: {other}")),
        }
    }
}

/// Behaviour flags a user toggles per conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectiveState {
    pub thinking: ThinkingLevel,
    pub verbose: bool,
    pub elevated: bool,
    pub reasoning_visible: bool,
}

/// Restart notice waiting to be attached to the next outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryNotice {
    pub interrupted_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_key: SessionKey,
    pub turns: Vec<Turn>,
    /// Turns below this index are covered by a summary.
    pub compaction_cursor: usize,
    pub token_estimate: u32,
    #[serde(default)]
    pub directives: DirectiveState,
    pub active: bool,
    /// Incremented on every persist.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub compactions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_notice: Option<RecoveryNotice>,
}

impl Record for SessionRecord {
    const SCHEMA: &'static str = "tron.session";
    const VERSION: u32 = 1;
}

impl SessionRecord {
    pub fn new(session_key: SessionKey) -> Self {
        let now = Utc::now();
        Self {
            session_key,
            turns: Vec::new(),
            compaction_cursor: 0,
            token_estimate: 0,
            directives: DirectiveState::default(),
            active: true,
            revision: 0,
            created_at: now,
            updated_at: now,
            compactions: 0,
            pending_notice: None,
        }
    }

    pub fn append_turn(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.refresh_token_estimate();
    }

    pub fn refresh_token_estimate(&mut self) {
        self.token_estimate = estimate_turns_tokens(&self.turns);
    }

    pub fn take_notice(&mut self) -> Option<RecoveryNotice> {
        self.pending_notice.take()
    }

    /// Whether `prefix` (by turn id) is the start of this history.
    pub fn starts_with_ids(&self, prefix: &[Turn]) -> bool {
        prefix.len() <= self.turns.len()
            && prefix
                .iter()
                .zip(&self.turns)
                .all(|(a, b)| a.id == b.id)
    }
}

/// Non-authoritative view for listings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_key: SessionKey,
    pub turns: usize,
    pub token_estimate: u32,
    pub active: bool,
    pub revision: u64,
    pub compactions: u32,
    pub has_pending_notice: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(r: &SessionRecord) -> Self {
        Self {
            session_key: r.session_key.clone(),
            turns: r.turns.len(),
            token_estimate: r.token_estimate,
            active: r.active,
            revision: r.revision,
            compactions: r.compactions,
            has_pending_notice: r.pending_notice.is_some(),
            updated_at: r.updated_at,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionStore {
    layout: StoreLayout,
    locks: LockManager,
}

impl SessionStore {
    pub fn new(layout: StoreLayout, locks: LockManager) -> Self {
        Self { layout, locks }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Read a session, or an empty one if it was never written.
    ///
    /// Outside [`with_lock`](Self::with_lock) the result is a snapshot and
    /// must not be written back.
    #[instrument(skip(self), fields(session_key = %key))]
    pub fn load(&self, key: &SessionKey) -> Result<SessionRecord, StoreError> {
        let path = self.layout.session_file(key);
        let Some(mut record) = atomic::read_record::<SessionRecord>(&path)? else {
            return Ok(SessionRecord::new(key.clone()));
        };
        if record.session_key != *key {
            return Err(StoreError::InvalidKey(format!(
                "{} holds session {}, expected {key}",
                path.display(),
                record.session_key
            )));
        }
        if record.compaction_cursor > record.turns.len() {
            warn!(
                cursor = record.compaction_cursor,
                turns = record.turns.len(),
                "compaction cursor past end of history, clamping"
            );
            record.compaction_cursor = record.turns.len();
        }
        Ok(record)
    }

    /// Run a read-modify-write cycle under the session lock.
    ///
    /// The lock is released on every exit path, including errors from `f` and
    /// unwinding. The record is persisted only if `f` succeeded and changed it.
    /// If the lock turns out to have been taken over during the section, the
    /// section fails with [`StoreError::LockLost`] even when `f` succeeded.
    #[instrument(skip(self, f), fields(session_key = %key))]
    pub async fn with_lock<T, E, F>(&self, key: &SessionKey, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut SessionRecord) -> Result<T, E>,
        E: From<StoreError>,
    {
        let handle = self
            .locks
            .acquire(&session_resource(key), self.locks.config().timeout)
            .await?;

        let result = self.modify_locked(key, &handle, f);

        match handle.release() {
            Ok(()) => result,
            Err(lost) => match result {
                Ok(_) => Err(lost.into()),
                Err(e) => {
                    warn!(error = %lost, "session lock lost during a failed section");
                    Err(e)
                }
            },
        }
    }

    fn modify_locked<T, E, F>(&self, key: &SessionKey, handle: &LockHandle, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut SessionRecord) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut record = self.load(key)?;
        let before = record.clone();
        let out = f(&mut record)?;
        if record != before {
            self.persist(&mut record, handle)?;
        }
        Ok(out)
    }

    pub fn append_turn(&self, record: &mut SessionRecord, turn: Turn) {
        record.append_turn(turn);
    }

    /// Atomically write `record`. `handle` must be the live lock for this session.
    pub fn persist(&self, record: &mut SessionRecord, handle: &LockHandle) -> Result<(), StoreError> {
        let expected = session_resource(&record.session_key);
        if handle.resource() != expected {
            return Err(StoreError::InvalidKey(format!(
                "lock {} does not guard {expected}",
                handle.resource()
            )));
        }
        handle.verify()?;

        record.revision += 1;
        record.updated_at = Utc::now();
        record.refresh_token_estimate();
        atomic::write_record(&self.layout.session_file(&record.session_key), &*record)?;
        debug!(session_key = %record.session_key, revision = record.revision, turns = record.turns.len(), "session persisted");
        Ok(())
    }

    /// All stored sessions. Non-authoritative; do not write back.
    pub fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut out = Vec::new();
        for path in atomic::list_records(&self.layout.sessions_dir(), "json")? {
            match atomic::read_record::<SessionRecord>(&path) {
                Ok(Some(record)) => out.push(SessionSummary::from(&record)),
                Ok(None) => {}
                Err(e @ StoreError::IncompatibleSchema { .. }) => {
                    warn!(error = %e, "skipping incompatible session file");
                }
                Err(e) => return Err(e),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use std::time::Duration;
    use tron_core::ToolInvocation;

    fn setup() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let locks = LockManager::new(
            layout.clone(),
            LockConfig {
                timeout: Duration::from_millis(200),
                retry_initial: Duration::from_millis(5),
                retry_max: Duration::from_millis(20),
                ..Default::default()
            },
        );
        (dir, SessionStore::new(layout, locks))
    }

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s).unwrap()
    }

    #[test]
    fn load_absent_is_empty() {
        let (_dir, store) = setup();
        let record = store.load(&key("cli:new")).unwrap();
        assert!(record.turns.is_empty());
        assert!(record.active);
        assert_eq!(record.revision, 0);
    }

    #[tokio::test]
    async fn with_lock_persists_changes() {
        let (_dir, store) = setup();
        let k = key("cli:a");
        store
            .with_lock(&k, |record| {
                record.append_turn(Turn::user("hello"));
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        let loaded = store.load(&k).unwrap();
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.revision, 1);
        assert!(loaded.token_estimate > 0);
        assert!(store.locks().inspect(&session_resource(&k)).unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_record_is_not_rewritten() {
        let (_dir, store) = setup();
        let k = key("cli:a");
        let seen = store
            .with_lock(&k, |record| Ok::<_, StoreError>(record.turns.len()))
            .await
            .unwrap();
        assert_eq!(seen, 0);
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_in_closure_discards_changes_and_releases() {
        let (_dir, store) = setup();
        let k = key("cli:a");
        let result: Result<(), StoreError> = store
            .with_lock(&k, |record| {
                record.append_turn(Turn::user("lost"));
                Err(StoreError::NotFound("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert!(store.load(&k).unwrap().turns.is_empty());
        assert!(store.locks().inspect(&session_resource(&k)).unwrap().is_none());
    }

    fn usurp(store: &SessionStore, k: &SessionKey) {
        let thief = crate::lock::LockRecord {
            resource_key: session_resource(k),
            owner_pid: std::process::id(),
            owner_host: "usurper.invalid".into(),
            owner_token: "usurper".into(),
            acquired_at: Utc::now(),
        };
        atomic::write_record(&store.layout.lock_file(&session_resource(k)), &thief).unwrap();
    }

    #[tokio::test]
    async fn lock_taken_over_mid_section_fails_the_section() {
        let (_dir, store) = setup();
        let k = key("cli:a");

        // Read-only section: nothing written, but the caller must still learn
        // that exclusivity was lost.
        let read: Result<usize, StoreError> = store
            .with_lock(&k, |record| {
                usurp(&store, &k);
                Ok(record.turns.len())
            })
            .await;
        assert!(matches!(read, Err(StoreError::LockLost(_))));

        std::fs::remove_file(store.layout.lock_file(&session_resource(&k))).unwrap();
        let write: Result<(), StoreError> = store
            .with_lock(&k, |record| {
                usurp(&store, &k);
                record.append_turn(Turn::user("must not land"));
                Ok(())
            })
            .await;
        assert!(matches!(write, Err(StoreError::LockLost(_))));
        assert!(store.load(&k).unwrap().turns.is_empty());
        let holder = store.locks().inspect(&session_resource(&k)).unwrap().unwrap();
        assert_eq!(holder.record.owner_token, "usurper");
    }

    #[tokio::test]
    async fn panicking_section_releases_the_lock() {
        let (_dir, store) = setup();
        let k = key("cli:a");

        let task = {
            let (store, k) = (store.clone(), k.clone());
            tokio::spawn(async move {
                let _: Result<(), StoreError> = store
                    .with_lock(&k, |record| {
                        record.append_turn(Turn::user("half done"));
                        panic!("section blew up");
                    })
                    .await;
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert!(store.locks().inspect(&session_resource(&k)).unwrap().is_none());
        assert!(store.locks().try_acquire(&session_resource(&k)).unwrap().is_some());
        assert!(store.load(&k).unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn held_lock_yields_busy() {
        let (_dir, store) = setup();
        let k = key("cli:a");
        let _held = store
            .locks()
            .acquire(&session_resource(&k), Duration::from_millis(50))
            .await
            .unwrap();
        let result: Result<(), StoreError> = store.with_lock(&k, |_| Ok(())).await;
        assert!(result.unwrap_err().is_busy());
    }

    #[tokio::test]
    async fn persist_rejects_foreign_lock() {
        let (_dir, store) = setup();
        let other = store
            .locks()
            .acquire(&session_resource(&key("cli:b")), Duration::from_millis(50))
            .await
            .unwrap();
        let mut record = SessionRecord::new(key("cli:a"));
        let err = store.persist(&mut record, &other).unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_lose_turns() {
        let (_dir, store) = setup();
        let store = std::sync::Arc::new(SessionStore::new(
            store.layout.clone(),
            LockManager::new(
                store.layout.clone(),
                LockConfig {
                    timeout: Duration::from_secs(10),
                    retry_initial: Duration::from_millis(1),
                    retry_max: Duration::from_millis(5),
                    ..Default::default()
                },
            ),
        ));
        let k = key("cli:shared");
        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let k = k.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .with_lock(&k, |record| {
                        record.append_turn(Turn::user(format!("turn {i}")));
                        Ok::<_, StoreError>(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let record = store.load(&k).unwrap();
        assert_eq!(record.turns.len(), 10);
        assert_eq!(record.revision, 10);
    }

    #[tokio::test]
    async fn directives_and_tool_payloads_survive_roundtrip() {
        let (_dir, store) = setup();
        let k = key("cli:a");
        store
            .with_lock(&k, |record| {
                record.directives.thinking = ThinkingLevel::High;
                record.directives.verbose = true;
                record.append_turn(Turn::assistant_with_calls(
                    "",
                    vec![ToolInvocation {
                        id: "c1".into(),
                        name: "bash".into(),
                        arguments: serde_json::json!({"command": "ls"}),
                    }],
                ));
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        let loaded = store.load(&k).unwrap();
        assert_eq!(loaded.directives.thinking, ThinkingLevel::High);
        assert!(loaded.directives.verbose);
        assert_eq!(loaded.turns[0].tool_calls[0].name, "bash");
    }

    #[tokio::test]
    async fn list_reports_sessions() {
        let (_dir, store) = setup();
        for name in ["cli:a", "cli:b"] {
            store
                .with_lock(&key(name), |r| {
                    r.append_turn(Turn::user("x"));
                    Ok::<_, StoreError>(())
                })
                .await
                .unwrap();
        }
        let mut keys: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.session_key.to_string())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["cli:a", "cli:b"]);
    }

    #[test]
    fn starts_with_ids() {
        let mut record = SessionRecord::new(key("cli:a"));
        record.append_turn(Turn::user("1"));
        record.append_turn(Turn::assistant("2"));
        let snapshot = record.turns.clone();
        record.append_turn(Turn::user("3"));
        assert!(record.starts_with_ids(&snapshot));
        record.turns.remove(0);
        assert!(!record.starts_with_ids(&snapshot));
    }

    #[test]
    fn thinking_level_parse() {
        assert_eq!("medium".parse::<ThinkingLevel>().unwrap(), ThinkingLevel::Medium);
        assert!("extreme".parse::<ThinkingLevel>().is_err());
    }
}
