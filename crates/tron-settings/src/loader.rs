//! Reading `resilience.json`.
//!
//! The compiled defaults are serialized to JSON, the user's file is layered
//! over them with [`deep_merge`], `TRON_*` variables are applied last, and the
//! result must pass [`ResilienceSettings::validate`] before anyone sees it.
//! Nested objects merge key by key. Arrays (the fallback chain in particular)
//! and scalars are replaced wholesale. An explicit `null` leaves the default.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{expand_home, ResilienceSettings};

/// `~/.tron/resilience.json`
pub fn settings_path() -> PathBuf {
    expand_home("~/.tron/resilience.json")
}

pub fn load_settings() -> Result<ResilienceSettings> {
    load_settings_from_path(&settings_path())
}

/// Like [`load_settings_from_path`], but the file has to exist.
pub fn load_settings_from_explicit(path: &Path) -> Result<ResilienceSettings> {
    if path.exists() {
        load_settings_from_path(path)
    } else {
        Err(SettingsError::NotFound(path.to_path_buf()))
    }
}

/// Defaults, then `path` if present, then the process environment.
pub fn load_settings_from_path(path: &Path) -> Result<ResilienceSettings> {
    let mut settings = merge_file_over_defaults(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file_over_defaults(path: &Path) -> Result<ResilienceSettings> {
    let mut layered = serde_json::to_value(ResilienceSettings::default())?;
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "layering settings file over defaults");
        layered = deep_merge(layered, user);
    } else {
        debug!(path = %path.display(), "no settings file, defaults only");
    }
    Ok(serde_json::from_value(layered)?)
}

/// Layer `overlay` on top of `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            merge_maps(&mut base, overlay);
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

fn merge_maps(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay.into_iter().filter(|(_, v)| !v.is_null()) {
        let layered = match base.remove(&key) {
            Some(existing) => deep_merge(existing, value),
            None => value,
        };
        base.insert(key, layered);
    }
}

pub fn apply_env_overrides(settings: &mut ResilienceSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `TRON_*` overrides fetched through `lookup`.
///
/// A value that does not parse, or falls outside its range, is logged and
/// skipped so the file or default value stays in effect.
pub fn apply_overrides(settings: &mut ResilienceSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvSource(lookup);

    if let Some(dir) = env.text("TRON_DATA_DIR") {
        settings.data_dir = dir;
    }

    if let Some(ms) = env.bounded("TRON_LOCK_TIMEOUT_MS", 1..=600_000) {
        settings.lock.timeout_ms = ms;
    }
    if let Some(secs) = env.bounded("TRON_LOCK_STALE_AFTER_SECS", 1..=86_400) {
        settings.lock.stale_after_secs = secs;
    }

    if let Some(tokens) = env.bounded::<u32>("TRON_CONTEXT_WINDOW", 1_024..=10_000_000) {
        settings.context.context_window = tokens;
    }

    if let Some(path) = env.text("TRON_CREDENTIALS_FILE") {
        settings.fallback.credentials_file = Some(path);
    }
    if let Some(share) = env.flag("TRON_SHARE_COOLDOWNS") {
        settings.fallback.share_cooldowns = share;
    }

    if let Some(depth) = env.bounded::<u32>("TRON_SUBAGENT_MAX_DEPTH", 0..=64) {
        settings.subagents.max_depth = depth;
    }
    if let Some(children) = env.bounded::<usize>("TRON_SUBAGENT_MAX_CHILDREN", 1..=1_000) {
        settings.subagents.max_children = children;
    }

    if let Some(level) = env.text("TRON_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(json) = env.flag("TRON_LOG_JSON") {
        settings.logging.json = json;
    }
}

/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(raw: &str) -> Option<bool> {
    const TRUTHY: [&str; 4] = ["true", "1", "yes", "on"];
    const FALSY: [&str; 4] = ["false", "0", "no", "off"];
    let lowered = raw.trim().to_ascii_lowercase();
    if TRUTHY.contains(&lowered.as_str()) {
        Some(true)
    } else if FALSY.contains(&lowered.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Parse `raw` as a `T` and keep it only when it lies in `range`.
pub fn parse_bounded<T>(raw: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    raw.trim().parse().ok().filter(|n| range.contains(n))
}

struct EnvSource<F>(F);

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn text(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn flag(&self, name: &str) -> Option<bool> {
        self.parsed(name, parse_bool)
    }

    fn bounded<T>(&self, name: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd,
    {
        self.parsed(name, |raw| parse_bounded(raw, range))
    }

    fn parsed<T>(&self, name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let raw = (self.0)(name)?;
        let value = parse(&raw);
        if value.is_none() {
            warn!(key = name, value = %raw, "ignoring unusable environment override");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> ResilienceSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = ResilienceSettings::default();
        apply_overrides(&mut settings, |name| vars.get(name).cloned());
        settings
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "lock": {"timeoutMs": 5000, "retryMaxMs": 500}
        });
        let source = serde_json::json!({
            "lock": {"timeoutMs": 2000}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["lock"]["timeoutMs"], 2000);
        assert_eq!(merged["lock"]["retryMaxMs"], 500);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/resilience.json");
        let settings = merge_file_over_defaults(path).unwrap();
        assert_eq!(settings, ResilienceSettings::default());
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.json");
        std::fs::write(
            &path,
            r#"{"lock": {"timeoutMs": 2500}, "subagents": {"maxDepth": 1}}"#,
        )
        .unwrap();

        let settings = merge_file_over_defaults(&path).unwrap();
        assert_eq!(settings.lock.timeout_ms, 2500);
        assert_eq!(settings.subagents.max_depth, 1);
        assert_eq!(settings.lock.retry_max_ms, 500);
        assert_eq!(settings.subagents.max_children, 5);
    }

    #[test]
    fn load_chain_replaces_not_merges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.json");
        std::fs::write(
            &path,
            r#"{"fallback": {"chain": [{"provider": "google", "model": "gemini-2.5-pro"}]}}"#,
        )
        .unwrap();

        let settings = merge_file_over_defaults(&path).unwrap();
        assert_eq!(settings.fallback.chain.len(), 1);
        assert_eq!(settings.fallback.chain[0].provider, "google");
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.json");
        std::fs::write(&path, "not valid json").unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::Json(_)));
    }

    #[test]
    fn load_incoherent_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.json");
        std::fs::write(&path, r#"{"context": {"softRatio": 0.95, "hardRatio": 0.9}}"#).unwrap();

        let result = load_settings_from_path(&path);
        assert!(matches!(result.unwrap_err(), SettingsError::InvalidValue { .. }));
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let result = load_settings_from_explicit(Path::new("/nonexistent/resilience.json"));
        assert!(matches!(result.unwrap_err(), SettingsError::NotFound(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("TRON_DATA_DIR", "/srv/tron"),
            ("TRON_LOCK_TIMEOUT_MS", "1500"),
            ("TRON_CONTEXT_WINDOW", "32000"),
            ("TRON_SUBAGENT_MAX_DEPTH", "1"),
            ("TRON_SUBAGENT_MAX_CHILDREN", "2"),
            ("TRON_LOG_LEVEL", "debug"),
            ("TRON_LOG_JSON", "yes"),
            ("TRON_LOCK_STALE_AFTER_SECS", "90"),
            ("TRON_CREDENTIALS_FILE", "/etc/tron/creds.json"),
            ("TRON_SHARE_COOLDOWNS", "off"),
        ]);
        assert_eq!(s.data_dir, "/srv/tron");
        assert_eq!(s.lock.timeout_ms, 1500);
        assert_eq!(s.context.context_window, 32_000);
        assert_eq!(s.subagents.max_depth, 1);
        assert_eq!(s.subagents.max_children, 2);
        assert_eq!(s.logging.level, "debug");
        assert!(s.logging.json);
        assert_eq!(s.lock.stale_after_secs, 90);
        assert_eq!(s.fallback.credentials_file.as_deref(), Some("/etc/tron/creds.json"));
        assert!(!s.fallback.share_cooldowns);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let s = overrides(&[
            ("TRON_LOCK_TIMEOUT_MS", "0"),
            ("TRON_SUBAGENT_MAX_CHILDREN", "lots"),
            ("TRON_LOG_JSON", "maybe"),
            ("TRON_DATA_DIR", ""),
        ]);
        let defaults = ResilienceSettings::default();
        assert_eq!(s.lock.timeout_ms, defaults.lock.timeout_ms);
        assert_eq!(s.subagents.max_children, defaults.subagents.max_children);
        assert_eq!(s.logging.json, defaults.logging.json);
        assert_eq!(s.data_dir, defaults.data_dir);
    }

    #[test]
    fn parse_bool_variants() {
        for val in &["true", "1", "yes", "on", "TRUE", "Yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in &["false", "0", "no", "off", "FALSE", "No", "OFF"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn bounded_parsing() {
        assert_eq!(parse_bounded::<u64>("30000", 1000..=600_000), Some(30_000));
        assert_eq!(parse_bounded::<u64>(" 30000 ", 1000..=600_000), Some(30_000));
        assert_eq!(parse_bounded::<u64>("500", 1000..=600_000), None);
        assert_eq!(parse_bounded::<u64>("700000", 1000..=600_000), None);
        assert_eq!(parse_bounded::<usize>("abc", 1..=10), None);
        assert_eq!(parse_bounded::<u32>("-1", 0..=64), None);
    }
}
