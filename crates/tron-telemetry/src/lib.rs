mod warnlog;

pub use warnlog::{Correlation, WarnEntry, WarnFilter, WarnLog, WarnLogLayer};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// How the process-wide subscriber is assembled.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is unset.
    pub log_level: Level,
    /// Extra `target=level` directives, e.g. `tron_store` at DEBUG.
    pub module_levels: Vec<(String, Level)>,
    pub json: bool,
    /// Destination of the persistent warn+ log. `None` keeps it off.
    pub warn_log_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            warn_log_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Level named in settings; anything unrecognised means INFO.
    pub fn parse_level(name: &str) -> Level {
        name.trim().parse().unwrap_or(Level::INFO)
    }

    fn directives(&self) -> String {
        std::iter::once(self.log_level.to_string().to_lowercase())
            .chain(
                self.module_levels
                    .iter()
                    .map(|(target, level)| format!("{target}={}", level.to_string().to_lowercase())),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Returned by [`init_telemetry`]. Holds the warn log open for queries.
pub struct TelemetryGuard {
    warn_log: Option<Arc<WarnLog>>,
    installed: bool,
}

impl TelemetryGuard {
    pub fn warn_log(&self) -> Option<&WarnLog> {
        self.warn_log.as_deref()
    }

    /// False when some other global subscriber won the race.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Install the global subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    // stderr only: stdout carries command output.
    let console: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed()
    };

    let warn_log = config.warn_log_path.as_deref().and_then(|path| {
        WarnLog::open(path)
            .map(Arc::new)
            .map_err(|e| eprintln!("tron-telemetry: cannot open {}: {e}", path.display()))
            .ok()
    });

    let installed = tracing_subscriber::registry()
        .with(console.with_filter(filter))
        .with(warn_log.clone().map(WarnLogLayer::new))
        .try_init()
        .is_ok();

    TelemetryGuard {
        warn_log,
        installed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_directives_follow_default_level() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("tron_store".into(), Level::DEBUG),
                ("tron_llm".into(), Level::TRACE),
            ],
            ..Default::default()
        };
        assert_eq!(config.directives(), "warn,tron_store=debug,tron_llm=trace");
    }

    #[test]
    fn unknown_level_is_info() {
        assert_eq!(TelemetryConfig::parse_level(" debug"), Level::DEBUG);
        assert_eq!(TelemetryConfig::parse_level("loud"), Level::INFO);
    }

    #[test]
    fn repeated_init_keeps_first_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let config = TelemetryConfig {
            warn_log_path: Some(dir.path().join("logs/warn.jsonl")),
            ..Default::default()
        };
        let _first = init_telemetry(config.clone());
        let second = init_telemetry(config);
        assert!(!second.installed());
        assert!(second.warn_log().is_some());
    }
}
