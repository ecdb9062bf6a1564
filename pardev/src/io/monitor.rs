//! Session monitoring: pane/session/log bindings and completion polling.
//!
//! The driven agent writes an append-only JSONL rollout log per session
//! and offers no push notifications, so completion and fork detection are
//! polling protocols: read only the bytes appended since the last offset,
//! look for the terminal marker, and degrade to partial results on
//! timeout. The pane -> session -> log registry is durable
//! (`sessions.json`) and reloaded before every read so bindings written
//! by background processes are observed.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::types::CompletionStatus;

/// A session is complete once its log contains a line whose `content`
/// field equals this marker.
pub const DONE_MARKER: &str = "/done";

/// Durable pane/session/log binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub pane: String,
    pub session_id: String,
    pub log_path: PathBuf,
    #[serde(default)]
    pub done: bool,
}

/// Capability consumed by the orchestrator and the layout driver.
pub trait SessionWatcher {
    /// Upsert a pane binding; persists across restarts.
    fn register_session(&self, pane: &str, session_id: &str, log_path: &Path) -> Result<()>;

    /// Resolve the session bound to `pane`, append `{pane, instruction}`
    /// to the instruction audit log, and return the session id.
    fn capture_instruction(&self, pane: &str, instruction: &str) -> Result<String>;

    /// Poll each session's log until all report the terminal marker or
    /// the timeout elapses. Never errors on timeout; sessions that are
    /// unknown or still running report `done = false`.
    fn await_completion(
        &self,
        session_ids: &[String],
        timeout: Duration,
        interval: Duration,
    ) -> BTreeMap<String, CompletionStatus>;

    /// Poll the registry until each worker pane's bound session differs
    /// from `base_session_id`. Returns only the panes that changed within
    /// the window; the rest are simply absent.
    fn await_new_sessions(
        &self,
        worker_panes: &[String],
        base_session_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> BTreeMap<String, String>;
}

#[derive(Default)]
struct MonitorState {
    /// Pane id -> binding.
    sessions: BTreeMap<String, SessionRecord>,
    /// Session id -> byte offset already consumed from its log.
    offsets: BTreeMap<String, u64>,
}

/// Polling-based monitor over the durable session registry.
#[derive(Clone)]
pub struct SessionMonitor {
    registry_path: PathBuf,
    instruction_log_path: PathBuf,
    state: Arc<Mutex<MonitorState>>,
}

impl SessionMonitor {
    /// Load (or start) the registry under `logs_dir`. A corrupt registry
    /// file is an error here: silently discarding bindings would break
    /// restart recovery.
    pub fn new(logs_dir: &Path) -> Result<Self> {
        fs::create_dir_all(logs_dir).with_context(|| format!("create {}", logs_dir.display()))?;
        let registry_path = logs_dir.join("sessions.json");
        let sessions = if registry_path.exists() {
            load_registry(&registry_path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            registry_path,
            instruction_log_path: logs_dir.join("instruction.log"),
            state: Arc::new(Mutex::new(MonitorState {
                sessions,
                offsets: BTreeMap::new(),
            })),
        })
    }

    pub fn instruction_log_path(&self) -> &Path {
        &self.instruction_log_path
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace in-memory bindings with the on-disk registry. During
    /// polling a transient read failure only degrades the poll, so it is
    /// logged rather than raised.
    fn reload(&self, state: &mut MonitorState) {
        if !self.registry_path.exists() {
            return;
        }
        match load_registry(&self.registry_path) {
            Ok(sessions) => state.sessions = sessions,
            Err(err) => warn!(err = %err, "failed to reload session registry"),
        }
    }

    /// Persist bindings. Write failures are confined to this persistence
    /// boundary: memory state stays authoritative for the running process.
    fn persist(&self, state: &MonitorState) {
        if let Err(err) = write_registry(&self.registry_path, &state.sessions) {
            warn!(err = %err, "failed to persist session registry");
        }
    }

    fn record_for_session(state: &MonitorState, session_id: &str) -> Option<SessionRecord> {
        state
            .sessions
            .values()
            .find(|record| record.session_id == session_id)
            .cloned()
    }
}

impl SessionWatcher for SessionMonitor {
    fn register_session(&self, pane: &str, session_id: &str, log_path: &Path) -> Result<()> {
        let mut state = self.lock();
        state.sessions.insert(
            pane.to_string(),
            SessionRecord {
                pane: pane.to_string(),
                session_id: session_id.to_string(),
                log_path: log_path.to_path_buf(),
                done: false,
            },
        );
        self.persist(&state);
        debug!(pane, session_id, "registered session");
        Ok(())
    }

    fn capture_instruction(&self, pane: &str, instruction: &str) -> Result<String> {
        let mut state = self.lock();
        self.reload(&mut state);
        let record = state
            .sessions
            .get(pane)
            .ok_or_else(|| anyhow!("no session registered for pane {pane}"))?;
        let session_id = record.session_id.clone();

        let entry = serde_json::json!({ "pane": pane, "instruction": instruction });
        if let Err(err) = append_line(&self.instruction_log_path, &entry.to_string()) {
            warn!(err = %err, "failed to append instruction log");
        }
        debug!(pane, session_id = %session_id, "captured instruction");
        Ok(session_id)
    }

    #[instrument(skip_all, fields(sessions = session_ids.len(), timeout_ms = timeout.as_millis() as u64))]
    fn await_completion(
        &self,
        session_ids: &[String],
        timeout: Duration,
        interval: Duration,
    ) -> BTreeMap<String, CompletionStatus> {
        let deadline = Instant::now() + timeout;
        let mut out: BTreeMap<String, CompletionStatus> = session_ids
            .iter()
            .map(|id| (id.clone(), CompletionStatus::default()))
            .collect();

        loop {
            {
                let mut state = self.lock();
                self.reload(&mut state);
                let mut dirty = false;
                for id in session_ids {
                    let Some(status) = out.get_mut(id) else {
                        continue;
                    };
                    if status.done {
                        continue;
                    }
                    let Some(record) = Self::record_for_session(&state, id) else {
                        continue;
                    };
                    let offset = state.offsets.get(id).copied().unwrap_or(0);
                    match scan_log_for_marker(&record.log_path, offset) {
                        Ok((found, new_offset)) => {
                            state.offsets.insert(id.clone(), new_offset);
                            if found {
                                status.done = true;
                                if let Some(bound) = state.sessions.get_mut(&record.pane) {
                                    bound.done = true;
                                    dirty = true;
                                }
                                debug!(session_id = %id, "session reported done");
                            }
                        }
                        Err(err) => debug!(session_id = %id, err = %err, "log not readable yet"),
                    }
                }
                if dirty {
                    self.persist(&state);
                }
            }

            if out.values().all(|status| status.done) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("completion wait timed out with partial results");
                break;
            }
            std::thread::sleep(interval.min(deadline - now));
        }
        out
    }

    #[instrument(skip_all, fields(panes = worker_panes.len(), timeout_ms = timeout.as_millis() as u64))]
    fn await_new_sessions(
        &self,
        worker_panes: &[String],
        base_session_id: &str,
        timeout: Duration,
        interval: Duration,
    ) -> BTreeMap<String, String> {
        let deadline = Instant::now() + timeout;
        let mut out = BTreeMap::new();

        loop {
            {
                let mut state = self.lock();
                self.reload(&mut state);
                for pane in worker_panes {
                    if out.contains_key(pane) {
                        continue;
                    }
                    if let Some(record) = state.sessions.get(pane)
                        && record.session_id != base_session_id
                    {
                        out.insert(pane.clone(), record.session_id.clone());
                    }
                }
            }

            if out.len() == worker_panes.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    rebound = out.len(),
                    expected = worker_panes.len(),
                    "fork detection timed out"
                );
                break;
            }
            std::thread::sleep(interval.min(deadline - now));
        }
        out
    }
}

fn load_registry(path: &Path) -> Result<BTreeMap<String, SessionRecord>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read registry {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse registry {}", path.display()))
}

/// Atomically write the registry (temp file + rename).
fn write_registry(path: &Path, sessions: &BTreeMap<String, SessionRecord>) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(sessions)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))?;
    Ok(())
}

/// Read log content appended since `offset`, scanning complete lines for
/// the terminal marker. Returns whether the marker was seen and the new
/// offset (the last fully-terminated line consumed). Malformed lines are
/// skipped, not fatal; a shrunken file resets the offset to zero.
fn scan_log_for_marker(path: &Path, offset: u64) -> Result<(bool, u64)> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let offset = if len < offset { 0 } else { offset };
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("seek {}", path.display()))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;

    // Only consume up to the last newline so a half-written trailing line
    // is re-read on the next poll.
    let consumed = match buf.iter().rposition(|byte| *byte == b'\n') {
        Some(pos) => pos + 1,
        None => return Ok((false, offset)),
    };

    let text = String::from_utf8_lossy(&buf[..consumed]);
    let found = text.lines().any(line_is_done_marker);
    Ok((found, offset + consumed as u64))
}

fn line_is_done_marker(line: &str) -> bool {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return false;
    };
    value.get("content").and_then(|content| content.as_str()) == Some(DONE_MARKER)
}
