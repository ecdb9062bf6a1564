//! Persistent CLI settings stored in `.parallel-dev/settings.json`.
//!
//! Loaded once at startup and flushed synchronously on every mutation.
//! The store tolerates a missing or corrupt file (defaults apply) and
//! migrates the legacy flat-key layout (`attach_mode`, `boss_mode`,
//! `flow_mode`, `auto_commit`) into the nested one.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Mode switches for how cycles are driven.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Modes {
    /// Terminal attach behavior: `auto` or `manual`.
    pub attach: String,
    /// Winner selection: `score` (external judge) or `auto` (diff-size
    /// heuristic).
    pub selection: String,
    /// Cycle flow: `manual` (one instruction per invocation) or `queue`.
    pub flow: String,
    /// Session namespace behavior: `shared` or `fresh`.
    pub session: String,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            attach: "auto".to_string(),
            selection: "score".to_string(),
            flow: "manual".to_string(),
            session: "shared".to_string(),
        }
    }
}

/// Worker pool knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSettings {
    pub count: usize,
    /// Commit a winning workspace's outstanding changes before merge.
    pub auto_commit: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: 3,
            auto_commit: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub modes: Modes,
    pub workers: WorkerSettings,
}

/// Load-at-start / flush-on-mutation settings store.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    data: Settings,
}

impl SettingsStore {
    /// Read settings from `path`. Missing or unparseable files fall back
    /// to defaults; a legacy flat-key file is migrated in memory (the
    /// nested layout is written on the next mutation).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match read_settings(&path) {
            Ok(Some(data)) => data,
            Ok(None) => Settings::default(),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "unreadable settings, using defaults");
                Settings::default()
            }
        };
        Self { path, data }
    }

    pub fn settings(&self) -> &Settings {
        &self.data
    }

    pub fn set_attach_mode(&mut self, value: impl Into<String>) {
        self.data.modes.attach = value.into();
        self.flush();
    }

    pub fn set_selection_mode(&mut self, value: impl Into<String>) {
        self.data.modes.selection = value.into();
        self.flush();
    }

    pub fn set_flow_mode(&mut self, value: impl Into<String>) {
        self.data.modes.flow = value.into();
        self.flush();
    }

    pub fn set_session_mode(&mut self, value: impl Into<String>) {
        self.data.modes.session = value.into();
        self.flush();
    }

    pub fn set_worker_count(&mut self, count: usize) {
        self.data.workers.count = count;
        self.flush();
    }

    pub fn set_auto_commit(&mut self, value: bool) {
        self.data.workers.auto_commit = value;
        self.flush();
    }

    /// Synchronous write-back. Failures stay at this persistence
    /// boundary: the in-memory settings remain authoritative.
    fn flush(&self) {
        if let Err(err) = write_settings(&self.path, &self.data) {
            warn!(path = %self.path.display(), err = %err, "failed to persist settings");
        }
    }
}

fn read_settings(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if let Some(migrated) = migrate_legacy(&value) {
        debug!(path = %path.display(), "migrated legacy flat-key settings");
        return Ok(Some(migrated));
    }
    let settings =
        serde_json::from_value(value).with_context(|| format!("decode {}", path.display()))?;
    Ok(Some(settings))
}

/// Map the original flat layout onto the nested one. Returns `None` when
/// the file carries no legacy keys.
fn migrate_legacy(value: &serde_json::Value) -> Option<Settings> {
    let object = value.as_object()?;
    const LEGACY_KEYS: [&str; 4] = ["attach_mode", "boss_mode", "flow_mode", "auto_commit"];
    if !LEGACY_KEYS.iter().any(|key| object.contains_key(*key)) {
        return None;
    }

    let mut settings = Settings::default();
    if let Some(attach) = object.get("attach_mode").and_then(|v| v.as_str()) {
        settings.modes.attach = attach.to_string();
    }
    if let Some(boss) = object.get("boss_mode").and_then(|v| v.as_str()) {
        settings.modes.selection = boss.to_string();
    }
    if let Some(flow) = object.get("flow_mode").and_then(|v| v.as_str()) {
        settings.modes.flow = flow.to_string();
    }
    if let Some(auto_commit) = object.get("auto_commit").and_then(|v| v.as_bool()) {
        settings.workers.auto_commit = auto_commit;
    }
    Some(settings)
}

/// Atomically write settings to disk (temp file + rename).
fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(settings).context("serialize settings")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
