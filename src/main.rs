//! `tron`: operational triggers for the resilient execution core.
//!
//! Conversational turns need a model-call collaborator and run through the
//! `tron-engine` library; this binary covers recovery, inspection and the
//! subagent lifecycle.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tron_core::process::local_hostname;
use tron_core::{ProcessIdentity, RunId, SessionKey};
use tron_engine::{DefaultNoticeComposer, RunStatus, Runtime, TurnError};
use tron_llm::LedgerStore;
use tron_settings::{load_settings, load_settings_from_explicit, ResilienceSettings};
use tron_store::StoreLayout;
use tron_telemetry::{init_telemetry, TelemetryConfig, WarnFilter, WarnLog};

#[derive(Debug, Parser)]
#[command(name = "tron", version, about = "Crash recovery, status and subagent control")]
struct Cli {
    /// Settings file (defaults to ~/.tron/resilience.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print machine-readable JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover interrupted sessions and orphaned subagent runs.
    Recover,
    /// Show locks, interrupted sessions, subagent runs and credential cooldowns.
    Status,
    /// List stored sessions.
    Sessions,
    /// Register a background run for a parent session.
    Spawn {
        #[arg(long)]
        parent: String,
        #[arg(long)]
        objective: String,
        #[arg(long, default_value_t = 1)]
        depth: u32,
    },
    /// Move a run to a new status.
    Mark {
        run_id: String,
        #[arg(long)]
        status: RunStatus,
        #[arg(long)]
        result: Option<String>,
        /// Pid of the process doing the work; required with `--status running`.
        #[arg(long)]
        worker_pid: Option<u32>,
        /// Host of that process (defaults to this host).
        #[arg(long, requires = "worker_pid")]
        worker_host: Option<String>,
    },
    /// Wait for a run to complete or fail.
    Wait {
        run_id: String,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Remove finished runs older than the retention period.
    Prune,
    /// Show persisted warnings and errors, newest first.
    Warnings {
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        run: Option<String>,
        #[arg(long, default_value_t = false)]
        errors_only: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = settings(&cli)?;

    let logging = &settings.logging;
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: TelemetryConfig::parse_level(&logging.level),
        json: logging.json,
        warn_log_path: logging
            .persist_warnings
            .then(|| StoreLayout::new(settings.data_dir_path()).warn_log_file()),
        ..Default::default()
    });

    let runtime = Runtime::from_settings(settings).context("failed to open data directory")?;

    let outcome = match cli.command {
        Command::Recover => recover(&runtime, cli.json).await,
        Command::Status => status(&runtime, cli.json),
        Command::Sessions => sessions(&runtime, cli.json),
        Command::Spawn {
            parent,
            objective,
            depth,
        } => {
            let parent = SessionKey::new(parent).context("invalid parent session key")?;
            let run_id = runtime
                .registry()
                .spawn(&parent, &objective, depth)
                .await
                .map_err(surface)?;
            print(cli.json, json!({ "runId": run_id }), &run_id.to_string());
            Ok(())
        }
        Command::Mark {
            run_id,
            status,
            result,
            worker_pid,
            worker_host,
        } => {
            let run_id = RunId::from_raw(run_id);
            let registry = runtime.registry();
            let record = match mark_worker(status, worker_pid, worker_host)? {
                Some(worker) => registry.update_status_as(&run_id, status, result, &worker).await,
                None => registry.update_status(&run_id, status, result).await,
            }
            .map_err(surface)?;
            print(
                cli.json,
                serde_json::to_value(&record)?,
                &format!("{} {}", record.run_id, record.status),
            );
            Ok(())
        }
        Command::Wait { run_id, timeout_secs } => {
            return wait(&runtime, RunId::from_raw(run_id), timeout_secs, cli.json).await;
        }
        Command::Prune => {
            let retention = runtime.settings().subagents.retention();
            let pruned = runtime.registry().prune_terminal(retention).await.map_err(surface)?;
            print(cli.json, json!({ "pruned": pruned }), &format!("pruned {pruned} runs"));
            Ok(())
        }
        Command::Warnings {
            session,
            run,
            errors_only,
            limit,
        } => {
            let filter = WarnFilter {
                errors_only,
                session_key: session,
                run_id: run,
                ..WarnFilter::default()
            }
            .limit(limit);
            warnings(&runtime, &filter, cli.json)
        }
    };
    outcome.map(|()| ExitCode::SUCCESS)
}

/// Worker to record for a `mark`. This command exits right away, so a run
/// only becomes `running` on behalf of a named worker process.
fn mark_worker(
    status: RunStatus,
    pid: Option<u32>,
    host: Option<String>,
) -> Result<Option<ProcessIdentity>> {
    match pid {
        Some(pid) => {
            let host = host.unwrap_or_else(|| local_hostname().to_owned());
            Ok(Some(ProcessIdentity::new(pid, host)))
        }
        None if status == RunStatus::Running => {
            bail!("--status running needs --worker-pid of the process doing the run")
        }
        None => Ok(None),
    }
}

/// Exits with status 2 when the run has not settled in time.
async fn wait(runtime: &Runtime, run_id: RunId, timeout_secs: u64, as_json: bool) -> Result<ExitCode> {
    let outcome = runtime
        .registry()
        .wait(&run_id, Duration::from_secs(timeout_secs))
        .await
        .map_err(surface)?;
    let record = &outcome.record;
    let text = match (&record.result, outcome.settled) {
        (Some(result), true) => format!("{}: {result}", record.status),
        (None, true) => record.status.to_string(),
        (_, false) => format!("still {} after {timeout_secs}s", record.status),
    };
    print(
        as_json,
        json!({ "settled": outcome.settled, "run": record }),
        &text,
    );
    Ok(if outcome.settled {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn settings(cli: &Cli) -> Result<ResilienceSettings> {
    let mut settings = match &cli.config {
        Some(path) => load_settings_from_explicit(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.display().to_string();
    }
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

/// Attach the user-facing message to an engine error.
fn surface(e: TurnError) -> anyhow::Error {
    let message = e.user_message();
    anyhow::Error::new(e).context(message)
}

fn print(as_json: bool, value: serde_json::Value, text: &str) {
    if as_json {
        println!("{value}");
    } else {
        println!("{text}");
    }
}

async fn recover(runtime: &Runtime, as_json: bool) -> Result<()> {
    let report = runtime.recover(&DefaultNoticeComposer).await.map_err(surface)?;
    if as_json {
        let failures: Vec<_> = report
            .failures
            .iter()
            .map(|(key, error)| json!({ "sessionKey": key, "error": error }))
            .collect();
        println!(
            "{}",
            json!({
                "interrupted": report.interrupted,
                "orphaned": report.orphaned,
                "swept": report.swept,
                "failures": failures,
            })
        );
        return Ok(());
    }
    if report.is_clean() && report.swept == 0 {
        println!("nothing to recover");
        return Ok(());
    }
    for key in &report.interrupted {
        println!("session {key}: interrupted turn, notice queued");
    }
    for run in &report.orphaned {
        println!("run {run}: orphaned");
    }
    for (key, error) in &report.failures {
        println!("session {key}: recovery failed: {error}");
    }
    if report.swept > 0 {
        println!("removed {} abandoned temp files", report.swept);
    }
    Ok(())
}

fn status(runtime: &Runtime, as_json: bool) -> Result<()> {
    let locks = runtime.locks().inspect_all()?;
    let interrupted = runtime.sentinels().scan_interrupted()?;
    let runs = runtime.registry().list(None).map_err(surface)?;
    let ledger = LedgerStore::new(runtime.layout().clone(), runtime.locks().clone()).load()?;

    if as_json {
        let locks: Vec<_> = locks
            .iter()
            .map(|l| json!({ "lock": l.record, "stale": l.stale }))
            .collect();
        let interrupted: Vec<_> = interrupted.iter().map(|i| &i.session_key).collect();
        println!(
            "{}",
            json!({
                "locks": locks,
                "interrupted": interrupted,
                "runs": runs,
                "cooldowns": ledger.entries,
            })
        );
        return Ok(());
    }

    println!("data dir: {}", runtime.layout().root().display());
    println!("locks: {}", locks.len());
    for lock in &locks {
        println!(
            "  {} held by {} for {}s{}",
            lock.record.resource_key,
            lock.record.owner(),
            lock.record.age().as_secs(),
            if lock.stale { " (stale)" } else { "" }
        );
    }
    println!("interrupted sessions: {}", interrupted.len());
    for session in &interrupted {
        println!("  {} since {}", session.session_key, session.since.to_rfc3339());
    }
    let live = runs.iter().filter(|r| r.status.is_live()).count();
    println!("subagent runs: {} ({live} live)", runs.len());
    for run in &runs {
        println!(
            "  {} [{}] depth {} parent {}: {}",
            run.run_id, run.status, run.depth, run.parent_session_key, run.objective
        );
    }
    println!("credentials: {}", ledger.entries.len());
    for entry in ledger.entries.values() {
        match entry.cooldown_until {
            Some(until) => println!("  {} ({}) {} until {}", entry.credential_id, entry.provider, entry.state, until.to_rfc3339()),
            None => println!("  {} ({}) {}", entry.credential_id, entry.provider, entry.state),
        }
    }
    Ok(())
}

fn sessions(runtime: &Runtime, as_json: bool) -> Result<()> {
    let sessions = runtime.sessions().list()?;
    if as_json {
        println!("{}", serde_json::to_string(&sessions)?);
        return Ok(());
    }
    for s in &sessions {
        println!(
            "{}  turns={} tokens={} rev={} compactions={}{}{}",
            s.session_key,
            s.turns,
            s.token_estimate,
            s.revision,
            s.compactions,
            if s.active { "" } else { " inactive" },
            if s.has_pending_notice { " notice-pending" } else { "" }
        );
    }
    Ok(())
}

fn warnings(runtime: &Runtime, filter: &WarnFilter, as_json: bool) -> Result<()> {
    let path = runtime.layout().warn_log_file();
    let log = WarnLog::open(&path).with_context(|| format!("cannot open {}", path.display()))?;
    let entries = log.query(filter)?;
    if as_json {
        println!("{}", serde_json::to_string(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        let scope = match (&entry.correlation.session_key, &entry.correlation.run_id) {
            (Some(key), Some(run)) => format!(" [{key} {run}]"),
            (Some(key), None) => format!(" [{key}]"),
            (None, Some(run)) => format!(" [{run}]"),
            (None, None) => String::new(),
        };
        println!(
            "{} {:5} {}{scope}: {}",
            entry.at.to_rfc3339(),
            entry.level,
            entry.target,
            entry.message
        );
    }
    Ok(())
}
