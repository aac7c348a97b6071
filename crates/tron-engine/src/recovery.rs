//! Startup recovery after an unclean shutdown.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use tron_core::{RunId, SessionKey};
use tron_store::{atomic, RecoveryNotice, SentinelTracker, SessionStore, StoreError, StoreLayout};

use crate::error::TurnError;
use crate::subagent::SubagentRegistry;

/// Renders the user-facing restart notice for an interrupted session.
pub trait NoticeComposer: Send + Sync {
    fn compose(&self, session_key: &SessionKey, interrupted_at: DateTime<Utc>) -> String;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultNoticeComposer;

impl NoticeComposer for DefaultNoticeComposer {
    fn compose(&self, _session_key: &SessionKey, interrupted_at: DateTime<Utc>) -> String {
        format!(
            "I was restarted while working on your last message (started {} UTC), so my reply \
             may be missing. Please resend it if you still need an answer.",
            interrupted_at.format("%Y-%m-%d %H:%M")
        )
    }
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Sessions that received a recovery notice.
    pub interrupted: Vec<SessionKey>,
    pub orphaned: Vec<RunId>,
    /// Abandoned temp files removed.
    pub swept: usize,
    /// Sessions left in `processing` for the next startup to retry.
    pub failures: Vec<(SessionKey, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.interrupted.is_empty() && self.orphaned.is_empty() && self.failures.is_empty()
    }
}

pub struct StartupRecovery<'a> {
    pub layout: &'a StoreLayout,
    pub sessions: &'a SessionStore,
    pub sentinels: &'a SentinelTracker,
    pub registry: &'a SubagentRegistry,
    pub composer: &'a dyn NoticeComposer,
    /// Temp files younger than this may belong to a live writer.
    pub sweep_after: Duration,
}

impl StartupRecovery<'_> {
    #[instrument(skip_all)]
    pub async fn run(&self) -> Result<RecoveryReport, TurnError> {
        let mut report = RecoveryReport::default();

        for interrupted in self.sentinels.scan_interrupted()? {
            let key = interrupted.session_key;
            match self.recover_session(&key, interrupted.since).await {
                Ok(()) => {
                    info!(session_key = %key, owner = %interrupted.owner, "interrupted session recovered");
                    report.interrupted.push(key);
                }
                Err(e) => {
                    warn!(session_key = %key, error = %e, "session recovery failed, will retry next startup");
                    report.failures.push((key, e.to_string()));
                }
            }
        }

        report.orphaned = self.registry.reconcile_on_startup().await?;

        for dir in self.layout.record_dirs() {
            match atomic::sweep_staged(&dir, self.sweep_after) {
                Ok(n) => report.swept += n,
                Err(e) => warn!(dir = %dir.display(), error = %e, "temp sweep failed"),
            }
        }

        info!(
            interrupted = report.interrupted.len(),
            orphaned = report.orphaned.len(),
            swept = report.swept,
            failures = report.failures.len(),
            "startup recovery finished"
        );
        Ok(report)
    }

    async fn recover_session(&self, key: &SessionKey, interrupted_at: DateTime<Utc>) -> Result<(), TurnError> {
        let message = self.composer.compose(key, interrupted_at);
        self.sessions
            .with_lock(key, |record| {
                record.active = false;
                record.pending_notice = Some(RecoveryNotice {
                    interrupted_at,
                    detected_at: Utc::now(),
                    message,
                });
                Ok::<_, StoreError>(())
            })
            .await?;
        self.sessions
            .with_lock(key, |record| {
                record.active = true;
                Ok::<_, StoreError>(())
            })
            .await?;
        // Cleared last so a failure above is retried on the next startup.
        self.sentinels.clear(key)?;
        Ok(())
    }
}
