//! Wiring of every component from loaded settings.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument};
use tron_llm::{
    load_credentials, ChainEntry, CooldownPolicy, Credential, CredentialError, FallbackConfig, FallbackManager, LedgerStore,
    ModelChain, ModelInvoker,
};
use tron_settings::ResilienceSettings;
use tron_store::{LockConfig, LockManager, SentinelTracker, SessionStore, StoreError, StoreLayout};

use crate::context::{Compactor, ContextGuard, GuardConfig, ModelSummarizer, Summarizer};
use crate::error::TurnError;
use crate::recovery::{NoticeComposer, RecoveryReport, StartupRecovery};
use crate::runner::TurnRunner;
use crate::subagent::{SpawnLimits, SubagentRegistry};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// The components of one process, built from settings.
#[derive(Clone, Debug)]
pub struct Runtime {
    settings: ResilienceSettings,
    layout: StoreLayout,
    locks: LockManager,
    sessions: SessionStore,
    sentinels: SentinelTracker,
    registry: SubagentRegistry,
    guard: ContextGuard,
}

impl Runtime {
    /// Build every component and create the data directory layout.
    #[instrument(skip_all)]
    pub fn from_settings(settings: ResilienceSettings) -> Result<Self, RuntimeError> {
        let layout = StoreLayout::new(settings.data_dir_path());
        layout.ensure()?;

        let lock = &settings.lock;
        let locks = LockManager::new(
            layout.clone(),
            LockConfig {
                timeout: lock.timeout(),
                retry_initial: lock.retry_initial(),
                retry_max: lock.retry_max(),
                stale_after: lock.stale_after(),
            },
        );
        let sessions = SessionStore::new(layout.clone(), locks.clone());
        let sentinels = SentinelTracker::new(layout.clone(), lock.stale_after());
        let registry = SubagentRegistry::new(
            layout.clone(),
            locks.clone(),
            SpawnLimits {
                max_depth: settings.subagents.max_depth,
                max_children: settings.subagents.max_children,
            },
        )
        .with_poll_interval(settings.subagents.wait_poll())
        .with_stale_after(lock.stale_after());
        let guard = ContextGuard::new(GuardConfig::from(&settings.context));

        info!(data_dir = %layout.root().display(), "runtime ready");
        Ok(Self {
            settings,
            layout,
            locks,
            sessions,
            sentinels,
            registry,
            guard,
        })
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn sentinels(&self) -> &SentinelTracker {
        &self.sentinels
    }

    pub fn registry(&self) -> &SubagentRegistry {
        &self.registry
    }

    pub fn guard(&self) -> &ContextGuard {
        &self.guard
    }

    /// Credentials from the configured file followed by provider
    /// environment variables.
    pub fn credentials(&self) -> Result<Vec<Credential>, CredentialError> {
        let path = self
            .settings
            .fallback
            .credentials_path()
            .unwrap_or_else(|| self.layout.credentials_file());
        let credentials = load_credentials(Some(&path))?;
        info!(count = credentials.len(), path = %path.display(), "credentials loaded");
        Ok(credentials)
    }

    pub fn fallback_manager(&self, invoker: Arc<dyn ModelInvoker>) -> Result<FallbackManager, RuntimeError> {
        Ok(self.fallback_manager_with(invoker, self.credentials()?))
    }

    /// A fallback manager over the configured chain.
    pub fn fallback_manager_with(&self, invoker: Arc<dyn ModelInvoker>, credentials: Vec<Credential>) -> FallbackManager {
        let fallback = &self.settings.fallback;
        let chain = ModelChain::new(
            fallback
                .chain
                .iter()
                .map(|e| ChainEntry::new(e.provider.clone(), e.model.clone()))
                .collect(),
        );
        let config = FallbackConfig {
            timeout_retries: fallback.timeout_retries,
            base_delay: Duration::from_millis(fallback.timeout_backoff_ms),
            cooldowns: CooldownPolicy {
                rate_limit_base: Duration::from_secs(fallback.rate_limit_cooldown_secs),
                auth_base: Duration::from_secs(fallback.auth_cooldown_secs),
                billing_base: Duration::from_secs(fallback.billing_cooldown_secs),
                max: Duration::from_secs(fallback.max_cooldown_secs),
            },
            ..Default::default()
        };

        let manager = FallbackManager::new(invoker, chain, credentials, config);
        if fallback.share_cooldowns {
            manager.with_ledger(LedgerStore::new(self.layout.clone(), self.locks.clone()))
        } else {
            manager
        }
    }

    /// A turn runner. Without an explicit summarizer, compaction summarizes
    /// through the same model chain.
    pub fn turn_runner(
        &self,
        invoker: Arc<dyn ModelInvoker>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Result<TurnRunner, RuntimeError> {
        let fallback = Arc::new(self.fallback_manager(invoker)?);
        let summarizer = summarizer.unwrap_or_else(|| Arc::new(ModelSummarizer::new(fallback.clone())));
        Ok(TurnRunner::new(
            self.sessions.clone(),
            self.sentinels.clone(),
            Compactor::new(self.guard.clone(), summarizer),
            fallback,
        ))
    }

    /// Startup recovery: notify interrupted sessions, orphan dead subagent
    /// runs, and sweep temp files abandoned before the staleness threshold.
    pub async fn recover(&self, composer: &dyn NoticeComposer) -> Result<RecoveryReport, TurnError> {
        StartupRecovery {
            layout: &self.layout,
            sessions: &self.sessions,
            sentinels: &self.sentinels,
            registry: &self.registry,
            composer,
            sweep_after: self.settings.lock.stale_after(),
        }
        .run()
        .await
    }
}
