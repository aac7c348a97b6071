//! Credential and model fallback.
//!
//! Each turn walks its own copy of the model chain from the earliest entry
//! that has a usable credential and, for each entry, the credentials of that entry's provider in configured order,
//! skipping any in cooldown. Classified failures drive the next step:
//!
//! - `auth` / `billing` / `rate_limit`: cool the credential down, try the next one
//! - `timeout`: bounded retries with backoff, no penalty, then move on
//! - `unknown`: one retry, then move on
//! - `context_overflow`: returned to the caller untouched
//!
//! A turn makes at most N×M selections (N credentials, M chain entries) and
//! never selects a credential whose cooldown has not elapsed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, instrument, warn};
use tron_core::errors::{ClassifiedError, FailureKind};
use tron_core::Turn;

use crate::chain::{ChainEntry, ModelChain};
use crate::credentials::{CooldownPolicy, Credential};
use crate::invoker::{ModelInvoker, ModelReply};
use crate::ledger::{LedgerEntry, LedgerStore};

#[derive(Clone, Debug)]
pub struct FallbackConfig {
    /// Extra attempts on the same credential after a timeout.
    pub timeout_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub cooldowns: CooldownPolicy,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            timeout_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.2,
            cooldowns: CooldownPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("no credentials are configured for any model in the chain")]
    NoCredentials,
    #[error("all credentials are cooling down, retry at {retry_at}")]
    CredentialsExhausted { retry_at: DateTime<Utc> },
    #[error("no model in the chain succeeded after {attempts} attempts: {last}")]
    Unavailable { attempts: usize, last: ClassifiedError },
    #[error("{model} rejected the request as too large: {error}")]
    ContextOverflow { model: String, error: ClassifiedError },
}

/// A successful model call and where it came from.
#[derive(Clone, Debug)]
pub struct FallbackOutcome {
    pub reply: ModelReply,
    pub entry: ChainEntry,
    pub credential_id: String,
    /// Selections made this turn, including the successful one.
    pub attempts: usize,
}

struct Selection {
    entry_index: usize,
    entry: ChainEntry,
    credential: Credential,
}

/// Shared between concurrent turns. The chain here is only a template; each
/// turn walks a private copy so one turn running out never ends another's.
struct FallbackState {
    chain: ModelChain,
    credentials: Vec<Credential>,
    last_cursor: usize,
}

pub struct FallbackManager {
    invoker: Arc<dyn ModelInvoker>,
    config: FallbackConfig,
    state: Mutex<FallbackState>,
    ledger: Option<LedgerStore>,
    total_retries: AtomicU64,
    total_selections: AtomicU64,
}

impl FallbackManager {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        chain: ModelChain,
        credentials: Vec<Credential>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            invoker,
            config,
            state: Mutex::new(FallbackState {
                chain,
                credentials,
                last_cursor: 0,
            }),
            ledger: None,
            total_retries: AtomicU64::new(0),
            total_selections: AtomicU64::new(0),
        }
    }

    /// Share cooldowns with other processes through `ledger`.
    pub fn with_ledger(mut self, ledger: LedgerStore) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn total_selections(&self) -> u64 {
        self.total_selections.load(Ordering::Relaxed)
    }

    /// Chain position where the most recently finished turn stopped.
    pub fn chain_cursor(&self) -> usize {
        self.state.lock().last_cursor
    }

    /// Credential states without secret material, for status display.
    pub fn credential_states(&self) -> Vec<LedgerEntry> {
        self.state.lock().credentials.iter().map(LedgerEntry::from).collect()
    }

    /// Run one model call for a turn, falling back across credentials and
    /// models as classified failures dictate.
    #[instrument(skip_all, fields(turns = turns.len()))]
    pub async fn run_turn(&self, turns: &[Turn]) -> Result<FallbackOutcome, FallbackError> {
        self.sync_from_ledger();
        let (mut walk, budget) = self.begin_turn()?;

        let mut tried: HashSet<(usize, String)> = HashSet::new();
        let mut attempts = 0usize;
        let mut last_error: Option<ClassifiedError> = None;

        while attempts < budget {
            let Some(selection) = self.select(&mut walk, &tried) else {
                break;
            };
            attempts += 1;
            self.total_selections.fetch_add(1, Ordering::Relaxed);
            tried.insert((selection.entry_index, selection.credential.id.clone()));
            debug!(
                model = %selection.entry,
                credential = %selection.credential.id,
                attempt = attempts,
                "model selected"
            );

            match self.invoke_with_retries(&selection, turns).await {
                Ok(reply) => {
                    self.finish_walk(&walk);
                    self.on_success(&selection).await;
                    return Ok(FallbackOutcome {
                        reply,
                        entry: selection.entry,
                        credential_id: selection.credential.id,
                        attempts,
                    });
                }
                Err(error) if error.kind == FailureKind::ContextOverflow => {
                    self.finish_walk(&walk);
                    return Err(FallbackError::ContextOverflow {
                        model: selection.entry.to_string(),
                        error,
                    });
                }
                Err(error) => {
                    if error.kind.penalizes_credential() {
                        self.penalize(&selection, &error).await;
                    } else {
                        warn!(
                            model = %selection.entry,
                            credential = %selection.credential.id,
                            kind = %error.kind,
                            error = %error.message,
                            "transient failure persisted, moving on"
                        );
                    }
                    last_error = Some(error);
                }
            }
        }

        self.finish_walk(&walk);
        Err(self.exhausted(attempts, last_error))
    }

    /// This turn's copy of the chain, positioned at the earliest entry that
    /// has a usable credential, and the selection budget for the turn.
    fn begin_turn(&self) -> Result<(ModelChain, usize), FallbackError> {
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let covered = state
            .chain
            .entries()
            .iter()
            .any(|e| state.credentials.iter().any(|c| c.provider == e.provider));
        if !covered {
            return Err(FallbackError::NoCredentials);
        }

        let earliest = state.chain.entries().iter().position(|e| {
            state
                .credentials
                .iter()
                .any(|c| c.provider == e.provider && c.is_available(now))
        });
        let target = earliest.unwrap_or(0);
        if target != state.last_cursor {
            debug!(from = state.last_cursor, to = target, "model chain cursor rewound");
        }
        let mut walk = state.chain.clone();
        walk.rewind_to(target);

        let budget = state.credentials.len() * walk.len();
        Ok((walk, budget))
    }

    fn finish_walk(&self, walk: &ModelChain) {
        self.state.lock().last_cursor = walk.cursor();
    }

    fn select(&self, walk: &mut ModelChain, tried: &HashSet<(usize, String)>) -> Option<Selection> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let start = walk.cursor();

        let mut found = None;
        'entries: for (index, entry) in walk.remaining() {
            for credential in state.credentials.iter_mut().filter(|c| c.provider == entry.provider) {
                if credential.refresh(now) {
                    info!(credential = %credential.id, provider = %credential.provider, "credential cooldown elapsed");
                }
                if !credential.is_available(now) || tried.contains(&(index, credential.id.clone())) {
                    continue;
                }
                found = Some(Selection {
                    entry_index: index,
                    entry: entry.clone(),
                    credential: credential.clone(),
                });
                break 'entries;
            }
        }

        drop(state);

        match &found {
            Some(selection) => {
                if selection.entry_index > start {
                    if let Some(from) = walk.current() {
                        info!(from = %from, to = %selection.entry, "falling back to next model");
                    }
                }
                walk.seek(selection.entry_index);
            }
            None => walk.seek(walk.len()),
        }
        found
    }

    async fn invoke_with_retries(
        &self,
        selection: &Selection,
        turns: &[Turn],
    ) -> Result<ModelReply, ClassifiedError> {
        let mut retries = 0u32;
        loop {
            let error = match self
                .invoker
                .invoke(&selection.entry.model, &selection.credential, turns)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(error) => error,
            };

            let limit = match error.kind {
                FailureKind::Timeout => self.config.timeout_retries,
                FailureKind::Unknown => 1,
                _ => 0,
            };
            if retries >= limit {
                return Err(error);
            }

            let delay = self.retry_delay(retries, error.retry_after);
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                model = %selection.entry,
                credential = %selection.credential.id,
                kind = %error.kind,
                attempt = retries + 1,
                max_retries = limit,
                delay_ms = delay.as_millis() as u64,
                error = %error.message,
                "retrying model call"
            );
            retries += 1;
            tokio::time::sleep(delay).await;
        }
    }

    fn retry_delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.config.max_delay);
        }
        let exp = self.config.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.config.max_delay.as_millis() as f64);
        let jitter = self.config.jitter_factor.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis((capped * factor) as u64)
    }

    async fn penalize(&self, selection: &Selection, error: &ClassifiedError) {
        let now = Utc::now();
        let entry = {
            let mut state = self.state.lock();
            let Some(credential) = state
                .credentials
                .iter_mut()
                .find(|c| c.id == selection.credential.id)
            else {
                return;
            };
            let failures = credential.note_failure();
            let cooldown = self
                .config
                .cooldowns
                .duration(error.kind, failures, error.retry_after);
            let until = chrono::Duration::from_std(cooldown)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            credential.enter_cooldown(error.kind, until, now);
            warn!(
                credential = %credential.id,
                provider = %credential.provider,
                model = %selection.entry,
                kind = %error.kind,
                failures,
                cooldown_secs = cooldown.as_secs(),
                "credential cooling down"
            );
            LedgerEntry::from(&*credential)
        };
        self.share(entry).await;
    }

    async fn on_success(&self, selection: &Selection) {
        let entry = {
            let mut state = self.state.lock();
            let Some(credential) = state
                .credentials
                .iter_mut()
                .find(|c| c.id == selection.credential.id)
            else {
                return;
            };
            if credential.failure_count == 0 && credential.last_failure.is_none() {
                return;
            }
            credential.record_success(Utc::now());
            LedgerEntry::from(&*credential)
        };
        self.share(entry).await;
    }

    async fn share(&self, entry: LedgerEntry) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(e) = ledger.record(vec![entry]).await {
            warn!(error = %e, "failed to update cooldown ledger");
        }
    }

    fn sync_from_ledger(&self) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let shared = match ledger.load() {
            Ok(shared) => shared,
            Err(e) => {
                warn!(error = %e, "cooldown ledger unreadable, using local state");
                return;
            }
        };
        let mut state = self.state.lock();
        for credential in state.credentials.iter_mut() {
            if let Some(entry) = shared.entries.get(&credential.id) {
                if entry.apply_to(credential) {
                    debug!(credential = %credential.id, state = %credential.state, "adopted shared cooldown state");
                }
            }
        }
    }

    fn exhausted(&self, attempts: usize, last_error: Option<ClassifiedError>) -> FallbackError {
        let now = Utc::now();
        let state = self.state.lock();
        let relevant = state.credentials.iter().filter(|c| {
            state
                .chain
                .entries()
                .iter()
                .any(|e| e.provider == c.provider)
        });

        let mut any_available = false;
        let mut retry_at: Option<DateTime<Utc>> = None;
        for credential in relevant {
            if credential.is_available(now) {
                any_available = true;
            } else if let Some(until) = credential.cooldown_until {
                retry_at = Some(retry_at.map_or(until, |current| current.min(until)));
            }
        }

        match (any_available, retry_at, last_error) {
            (false, Some(retry_at), _) => {
                warn!(attempts, retry_at = %retry_at, "all credentials cooling down");
                FallbackError::CredentialsExhausted { retry_at }
            }
            (_, _, Some(last)) => FallbackError::Unavailable { attempts, last },
            _ => FallbackError::NoCredentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockInvoker, MockResponse};
    use secrecy::SecretString;
    use tron_store::{LockConfig, LockManager, StoreLayout};

    fn cred(id: &str, provider: &str) -> Credential {
        Credential::new(id, provider, SecretString::from(format!("sk-{id}")))
    }

    fn chain() -> ModelChain {
        ModelChain::new(vec![
            ChainEntry::new("anthropic", "claude-sonnet-4-5"),
            ChainEntry::new("openai", "gpt-4.1"),
        ])
    }

    fn fast() -> FallbackConfig {
        FallbackConfig {
            timeout_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn manager(mock: Arc<MockInvoker>, credentials: Vec<Credential>) -> FallbackManager {
        FallbackManager::new(mock, chain(), credentials, fast())
    }

    fn turns() -> Vec<Turn> {
        vec![Turn::user("hi")]
    }

    #[tokio::test(start_paused = true)]
    async fn first_credential_succeeds() {
        let mock = Arc::new(MockInvoker::new(vec![MockResponse::text("hello")]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")]);

        let out = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(out.reply.content, "hello");
        assert_eq!(out.credential_id, "a1");
        assert_eq!(out.entry.model, "claude-sonnet-4-5");
        assert_eq!(out.attempts, 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_prefers_same_model_other_credential() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::rate_limit("429")),
            MockResponse::text("ok"),
        ]));
        let fm = manager(
            mock.clone(),
            vec![cred("a1", "anthropic"), cred("a2", "anthropic"), cred("o1", "openai")],
        );

        let out = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(out.credential_id, "a2");
        assert_eq!(out.entry.provider, "anthropic");

        let states = fm.credential_states();
        assert_eq!(states[0].state, crate::credentials::CredentialState::Cooldown);
        assert_eq!(states[0].last_failure, Some(FailureKind::RateLimit));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_falls_back_to_next_model() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::auth("invalid x-api-key")),
            MockResponse::text("from openai"),
        ]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")]);

        let out = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(out.entry.model, "gpt-4.1");
        assert_eq!(out.attempts, 2);
        assert_eq!(fm.chain_cursor(), 1);

        let calls = mock.calls();
        assert_eq!(calls[0].model, "claude-sonnet-4-5");
        assert_eq!(calls[1].model, "gpt-4.1");
        assert_eq!(calls[1].credential_id, "o1");
    }

    #[tokio::test(start_paused = true)]
    async fn cooling_credential_is_never_retried_early() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::billing("credit balance")),
            MockResponse::text("second turn"),
        ]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")]);
        mock.push(MockResponse::text("unused"));

        // First turn: a1 fails, o1 answers with "second turn".
        let first = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(first.credential_id, "o1");

        // Next turn must skip a1 (still cooling) and go straight to o1.
        let second = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(second.credential_id, "o1");
        assert!(mock.calls().iter().filter(|c| c.credential_id == "a1").count() == 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_bounded_and_reports_retry_at() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::rate_limit("1")),
            MockResponse::Error(ClassifiedError::rate_limit("2")),
            MockResponse::Error(ClassifiedError::auth("3")),
            MockResponse::text("never"),
        ]));
        let fm = manager(
            mock.clone(),
            vec![cred("a1", "anthropic"), cred("a2", "anthropic"), cred("o1", "openai")],
        );

        let before = Utc::now();
        let err = fm.run_turn(&turns()).await.unwrap_err();
        let FallbackError::CredentialsExhausted { retry_at } = err else {
            panic!("expected CredentialsExhausted, got {err:?}");
        };
        assert_eq!(mock.call_count(), 3);
        assert!(fm.total_selections() <= 3 * 2);
        // Earliest expiry is a rate-limit cooldown (60s), not the auth one (300s).
        assert!(retry_at >= before + chrono::Duration::seconds(59));
        assert!(retry_at <= Utc::now() + chrono::Duration::seconds(61));

        // A further turn fails fast without invoking anything.
        let again = fm.run_turn(&turns()).await.unwrap_err();
        assert!(matches!(again, FallbackError::CredentialsExhausted { .. }));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_without_penalty() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::timeout("slow")),
            MockResponse::Error(ClassifiedError::timeout("slow")),
            MockResponse::text("finally"),
        ]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic")]);

        let out = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(out.reply.content, "finally");
        assert_eq!(out.attempts, 1);
        assert_eq!(fm.total_retries(), 2);
        assert_eq!(fm.credential_states()[0].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_timeouts_surface_unavailable() {
        let mock = Arc::new(MockInvoker::new(
            (0..3)
                .map(|_| MockResponse::Error(ClassifiedError::timeout("slow")))
                .collect(),
        ));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic")]);

        let err = fm.run_turn(&turns()).await.unwrap_err();
        assert!(matches!(err, FallbackError::Unavailable { attempts: 1, .. }));
        assert_eq!(mock.call_count(), 3);
        assert_eq!(fm.credential_states()[0].state, crate::credentials::CredentialState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_gets_one_retry_then_escalates() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::unknown("weird")),
            MockResponse::Error(ClassifiedError::unknown("weird")),
            MockResponse::text("openai"),
        ]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")]);

        let out = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(out.credential_id, "o1");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(fm.total_retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn context_overflow_is_not_a_credential_problem() {
        let mock = Arc::new(MockInvoker::new(vec![MockResponse::Error(
            ClassifiedError::context_overflow("prompt is too long"),
        )]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")]);

        let err = fm.run_turn(&turns()).await.unwrap_err();
        assert!(matches!(err, FallbackError::ContextOverflow { .. }));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(fm.credential_states()[0].state, crate::credentials::CredentialState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn no_matching_credentials() {
        let mock = Arc::new(MockInvoker::new(vec![]));
        let fm = manager(mock, vec![cred("g1", "google")]);
        assert!(matches!(
            fm.run_turn(&turns()).await,
            Err(FallbackError::NoCredentials)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_rewinds_once_cooldown_elapses() {
        let mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::rate_limit("429")),
            MockResponse::text("openai"),
            MockResponse::text("anthropic again"),
        ]));
        let fm = manager(mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")]);
        fm.run_turn(&turns()).await.unwrap();
        assert_eq!(fm.chain_cursor(), 1);

        // Expire a1's cooldown.
        {
            let mut state = fm.state.lock();
            state.credentials[0].cooldown_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        let out = fm.run_turn(&turns()).await.unwrap();
        assert_eq!(out.credential_id, "a1");
        assert_eq!(fm.chain_cursor(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldowns_are_shared_through_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let ledger = || LedgerStore::new(layout.clone(), LockManager::new(layout.clone(), LockConfig::default()));

        let first_mock = Arc::new(MockInvoker::new(vec![
            MockResponse::Error(ClassifiedError::auth("revoked")),
            MockResponse::text("o1"),
        ]));
        let first = manager(first_mock, vec![cred("a1", "anthropic"), cred("o1", "openai")])
            .with_ledger(ledger());
        first.run_turn(&turns()).await.unwrap();

        // A second process with fresh state learns a1 is cooling down.
        let second_mock = Arc::new(MockInvoker::new(vec![MockResponse::text("o1 again")]));
        let second = manager(second_mock.clone(), vec![cred("a1", "anthropic"), cred("o1", "openai")])
            .with_ledger(ledger());
        let out = second.run_turn(&turns()).await.unwrap();
        assert_eq!(out.credential_id, "o1");
        assert_eq!(second_mock.calls()[0].credential_id, "o1");
    }

    /// Answers by the first turn's text so concurrent turns get their own script.
    struct PerTurnInvoker;

    #[async_trait::async_trait]
    impl ModelInvoker for PerTurnInvoker {
        async fn invoke(
            &self,
            _model_id: &str,
            credential: &Credential,
            turns: &[Turn],
        ) -> Result<ModelReply, ClassifiedError> {
            match (turns[0].content.as_str(), credential.id.as_str()) {
                ("slow", "a1") => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Err(ClassifiedError::rate_limit("429"))
                }
                ("slow", _) => Ok(ModelReply::text("from o1")),
                _ => Err(ClassifiedError::timeout("no answer")),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_turns_walk_the_chain_independently() {
        let fm = FallbackManager::new(
            Arc::new(PerTurnInvoker),
            chain(),
            vec![cred("a1", "anthropic"), cred("o1", "openai")],
            FallbackConfig {
                timeout_retries: 0,
                ..fast()
            },
        );

        let slow = vec![Turn::user("slow")];
        let doomed = vec![Turn::user("doomed")];
        let (slow_out, doomed_out) = tokio::join!(fm.run_turn(&slow), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            fm.run_turn(&doomed).await
        });

        // The doomed turn exhausts the chain while the slow one is still
        // waiting on a1; the slow turn must still get to try o1.
        assert!(matches!(doomed_out, Err(FallbackError::Unavailable { attempts: 2, .. })));
        let slow_out = slow_out.unwrap();
        assert_eq!(slow_out.credential_id, "o1");
        assert_eq!(slow_out.attempts, 2);
    }

    #[test]
    fn retry_delay_respects_suggested_and_cap() {
        let fm = manager(Arc::new(MockInvoker::new(vec![])), vec![]);
        assert_eq!(
            fm.retry_delay(0, Some(Duration::from_millis(20))),
            Duration::from_millis(20)
        );
        assert_eq!(fm.retry_delay(0, Some(Duration::from_secs(60))), Duration::from_millis(50));
        for attempt in 0..8 {
            let d = fm.retry_delay(attempt, None);
            assert!(d <= Duration::from_millis(60), "attempt {attempt}: {d:?}");
        }
    }
}
