//! Persistent warn+ log.
//!
//! Every warning or error emitted while a turn, recovery pass or subagent
//! operation runs is appended to `logs/warn.jsonl` with the correlation ids
//! of its enclosing spans, so an operator can later ask "what went wrong for
//! this session" without replaying stderr.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const DEFAULT_LIMIT: usize = 100;

/// Ids that tie a log line back to the session or subagent run it concerns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Correlation {
    fn is_empty(&self) -> bool {
        self.session_key.is_none() && self.run_id.is_none()
    }

    /// Fill whatever is still missing from `outer`.
    fn inherit(&mut self, outer: &Correlation) {
        if self.session_key.is_none() {
            self.session_key.clone_from(&outer.session_key);
        }
        if self.run_id.is_none() {
            self.run_id.clone_from(&outer.run_id);
        }
    }
}

/// One persisted warning or error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarnEntry {
    pub at: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(flatten)]
    pub correlation: Correlation,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

/// Filter for [`WarnLog::query`]. Unset criteria match everything.
#[derive(Clone, Debug, Default)]
pub struct WarnFilter {
    pub errors_only: bool,
    pub target_prefix: Option<String>,
    pub session_key: Option<String>,
    pub run_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl WarnFilter {
    pub fn session(key: impl Into<String>) -> Self {
        Self {
            session_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn run(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn accepts(&self, entry: &WarnEntry) -> bool {
        if self.errors_only && !entry.level.eq_ignore_ascii_case("error") {
            return false;
        }
        if let Some(prefix) = &self.target_prefix {
            if !entry.target.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.session_key.is_some() && entry.correlation.session_key != self.session_key {
            return false;
        }
        if self.run_id.is_some() && entry.correlation.run_id != self.run_id {
            return false;
        }
        self.since.map_or(true, |since| entry.at >= since)
    }
}

/// Append-only JSONL file of [`WarnEntry`]s.
pub struct WarnLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl WarnLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &WarnEntry) {
        let Ok(mut line) = serde_json::to_vec(entry) else {
            return;
        };
        line.push(b'\n');
        // One write_all per entry keeps lines from separate processes whole.
        let _ = self.file.lock().write_all(&line);
    }

    /// Matching entries, newest first. Lines that do not parse are skipped.
    pub fn query(&self, filter: &WarnFilter) -> std::io::Result<Vec<WarnEntry>> {
        let _writer = self.file.lock();
        let lines = BufReader::new(File::open(&self.path)?).lines();
        let mut hits: Vec<WarnEntry> = lines
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str(&line).ok())
            .filter(|entry| filter.accepts(entry))
            .collect();
        hits.reverse();
        hits.truncate(filter.limit.unwrap_or(DEFAULT_LIMIT));
        Ok(hits)
    }
}

/// `tracing` layer feeding a [`WarnLog`].
pub struct WarnLogLayer {
    log: Arc<WarnLog>,
}

impl WarnLogLayer {
    pub fn new(log: Arc<WarnLog>) -> Self {
        Self { log }
    }
}

#[derive(Default)]
struct Collected {
    message: String,
    correlation: Correlation,
    fields: Map<String, Value>,
}

impl Collected {
    fn set(&mut self, name: &str, value: Value) {
        match name {
            "message" => self.message = as_text(value),
            "session_key" => self.correlation.session_key = Some(as_text(value)),
            "run_id" => self.correlation.run_id = Some(as_text(value)),
            _ => {
                self.fields.insert(name.to_owned(), value);
            }
        }
    }
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for Collected {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field.name(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.set(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.set(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.set(field.name(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // NaN and infinities have no JSON form.
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.set(field.name(), Value::Number(n));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = if field.name() == "message" {
            rendered
        } else {
            rendered.trim_matches('"').to_owned()
        };
        self.set(field.name(), Value::String(rendered));
    }
}

impl<S> Layer<S> for WarnLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        attrs.record(&mut collected);
        if collected.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collected.correlation);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut collected = Collected::default();
        event.record(&mut collected);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    collected.correlation.inherit(outer);
                }
            }
        }

        self.log.append(&WarnEntry {
            at: Utc::now(),
            level: level.to_string(),
            target: event.metadata().target().to_owned(),
            message: collected.message,
            correlation: collected.correlation,
            fields: collected.fields,
        });
    }
}
