//! JSON persistence for settings, office session metadata, and approval
//! rules.
//!
//! Three surfaces exist on disk: `settings.json` (app-wide preferences), one
//! `{session_id}.json` per office run, and `tool-approval-rules.json`
//! (Global approval rules only). All files are UTF-8 and pretty-printed.
//! Loads match keys case-insensitively and fall back to defaults on any
//! failure; a corrupt or missing file can never prevent startup.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::agentdesk::approval::RuleDecision;
use crate::agentdesk::config::AppSettings;
use crate::agentdesk::error::{OrchestratorError, OrchestratorResult};

/// Recursively lowercase every object key so loads match case-insensitively.
/// Map *values* (including rule tool names) are left untouched.
fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), normalize_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

fn save_pretty<T: Serialize>(path: &Path, value: &T) -> OrchestratorResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| OrchestratorError::Parse(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| OrchestratorError::Transport(format!("create {:?}: {}", parent, e)))?;
    }
    fs::write(path, json)
        .map_err(|e| OrchestratorError::Transport(format!("write {:?}: {}", path, e)))
}

fn load_normalized<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&raw).ok()?;
    serde_json::from_value(normalize_keys(value)).ok()
}

/// Persist app-wide settings to `settings.json`.
pub fn save_settings(path: &Path, settings: &AppSettings) -> OrchestratorResult<()> {
    save_pretty(path, settings)
}

/// Load app-wide settings, falling back to defaults on any failure.
pub fn load_settings(path: &Path) -> AppSettings {
    match load_normalized(path) {
        Some(settings) => settings,
        None => {
            log::warn!("could not load settings from {:?}; using defaults", path);
            AppSettings::default()
        }
    }
}

/// Metadata persisted for one office session as `{session_id}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
pub struct OfficeSessionRecord {
    pub session_id: String,
    pub objective: String,
    pub created_at: DateTime<Utc>,
    pub iteration_count: u64,
    pub last_phase: String,
}

fn session_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.json", session_id))
}

/// Write a session record under `dir`.
pub fn save_office_session(dir: &Path, record: &OfficeSessionRecord) -> OrchestratorResult<()> {
    save_pretty(&session_path(dir, &record.session_id), record)
}

/// Read one session record; `None` when missing or unreadable.
pub fn load_office_session(dir: &Path, session_id: &str) -> Option<OfficeSessionRecord> {
    load_normalized(&session_path(dir, session_id))
}

/// List every readable session record under `dir`, unreadable files skipped.
pub fn list_office_sessions(dir: &Path) -> Vec<OfficeSessionRecord> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut records: Vec<OfficeSessionRecord> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|entry| load_normalized(&entry.path()))
        .collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    records
}

/// On-disk shape of `tool-approval-rules.json`. Rules are stored as entries
/// rather than a bare map so that tool names stay untouched by key
/// normalization.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
struct RuleFile {
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(serialize = "camelCase", deserialize = "lowercase"))]
struct RuleEntry {
    tool_name: String,
    decision: RuleDecision,
}

/// Persist Global approval rules.
pub fn save_approval_rules(
    path: &Path,
    rules: &HashMap<String, RuleDecision>,
) -> OrchestratorResult<()> {
    let mut entries: Vec<RuleEntry> = rules
        .iter()
        .map(|(tool_name, decision)| RuleEntry { tool_name: tool_name.clone(), decision: *decision })
        .collect();
    entries.sort_by(|a, b| a.tool_name.cmp(&b.tool_name));
    save_pretty(path, &RuleFile { rules: entries })
}

/// Load Global approval rules; an unreadable file yields an empty set.
pub fn load_approval_rules(path: &Path) -> HashMap<String, RuleDecision> {
    match load_normalized::<RuleFile>(path) {
        Some(file) => file
            .rules
            .into_iter()
            .map(|entry| (entry.tool_name, entry.decision))
            .collect(),
        None => {
            log::warn!("could not load approval rules from {:?}; starting empty", path);
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentdesk::config::{ApprovalUiMode, DiscussionDepth};
    use tempfile::tempdir;

    #[test]
    fn settings_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = AppSettings {
            approval_ui_mode: ApprovalUiMode::Both,
            default_depth: DiscussionDepth::Deep,
            ..AppSettings::default()
        };

        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn settings_load_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "ApprovalUIMode": "inline", "DEFAULTDEPTH": "quick",
                 "Office": { "CheckIntervalMinutes": 7, "MaxAssistants": 2,
                             "RequirePlanApproval": false } }"#,
        )
        .unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.approval_ui_mode, ApprovalUiMode::Inline);
        assert_eq!(settings.default_depth, DiscussionDepth::Quick);
        assert_eq!(settings.office.check_interval_minutes, 7);
        assert!(!settings.office.require_plan_approval);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), AppSettings::default());
        assert_eq!(load_settings(&dir.path().join("missing.json")), AppSettings::default());
    }

    #[test]
    fn session_records_round_trip_and_list() {
        let dir = tempdir().unwrap();
        let record = OfficeSessionRecord {
            session_id: "abc12345".to_string(),
            objective: "keep the build green".to_string(),
            created_at: Utc::now(),
            iteration_count: 3,
            last_phase: "Resting".to_string(),
        };

        save_office_session(dir.path(), &record).unwrap();
        assert_eq!(load_office_session(dir.path(), "abc12345"), Some(record.clone()));
        assert_eq!(load_office_session(dir.path(), "missing"), None);

        let listed = list_office_sessions(dir.path());
        assert_eq!(listed, vec![record]);
    }

    #[test]
    fn approval_rules_round_trip_preserving_tool_case() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tool-approval-rules.json");
        let mut rules = HashMap::new();
        rules.insert("readFile".to_string(), RuleDecision::Allow);
        rules.insert("shell".to_string(), RuleDecision::Deny);

        save_approval_rules(&path, &rules).unwrap();
        let loaded = load_approval_rules(&path);
        assert_eq!(loaded, rules);

        // Written file is pretty-printed.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains('\n'));
        assert!(raw.contains("readFile"));
    }

    #[test]
    fn missing_rules_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(load_approval_rules(&dir.path().join("nope.json")).is_empty());
    }
}
