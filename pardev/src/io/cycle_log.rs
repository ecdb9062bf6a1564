//! Per-cycle audit records under `<logs>/cycles/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::types::{CompletionStatus, OrchestrationResult, PaneLayout};

/// Everything worth keeping about one finished cycle, written as a single
/// pretty-JSON document.
#[derive(Debug, Serialize)]
pub struct CycleRecord<'a> {
    pub instruction: &'a str,
    pub layout: &'a PaneLayout,
    pub fork_map: &'a BTreeMap<String, String>,
    pub completion: &'a BTreeMap<String, CompletionStatus>,
    pub result: &'a OrchestrationResult,
}

/// Writes one audit document per cycle, numbered in arrival order.
#[derive(Debug, Clone)]
pub struct CycleLog {
    cycles_dir: PathBuf,
}

impl CycleLog {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            cycles_dir: logs_dir.join("cycles"),
        }
    }

    pub fn record_cycle(&self, record: &CycleRecord<'_>) -> Result<PathBuf> {
        fs::create_dir_all(&self.cycles_dir)
            .with_context(|| format!("create {}", self.cycles_dir.display()))?;
        let seq = fs::read_dir(&self.cycles_dir)
            .with_context(|| format!("list {}", self.cycles_dir.display()))?
            .count()
            + 1;
        let path = self.cycles_dir.join(format!("cycle-{seq:04}.json"));

        let mut buf = serde_json::to_string_pretty(record).context("serialize cycle record")?;
        buf.push('\n');
        fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScoreEntry;

    #[test]
    fn writes_one_document_per_cycle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = CycleLog::new(temp.path());

        let layout = PaneLayout {
            main: "%0".to_string(),
            boss: "%1".to_string(),
            workers: vec!["%2".to_string()],
        };
        let fork_map = BTreeMap::from([("%2".to_string(), "session-worker".to_string())]);
        let completion = BTreeMap::from([(
            "session-worker".to_string(),
            CompletionStatus {
                done: true,
                score: None,
            },
        )]);
        let result = OrchestrationResult {
            selected_session: "session-worker".to_string(),
            scoreboard: BTreeMap::from([(
                "worker-1".to_string(),
                ScoreEntry {
                    score: 90,
                    comment: None,
                    done: true,
                },
            )]),
            continue_requested: false,
        };

        let path = log
            .record_cycle(&CycleRecord {
                instruction: "Deploy",
                layout: &layout,
                fork_map: &fork_map,
                completion: &completion,
                result: &result,
            })
            .expect("record");

        assert!(path.ends_with("cycle-0001.json"));
        let contents = fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&contents).expect("json");
        assert_eq!(value["instruction"], "Deploy");
        assert_eq!(value["result"]["selected_session"], "session-worker");

        let second = log
            .record_cycle(&CycleRecord {
                instruction: "Again",
                layout: &layout,
                fork_map: &fork_map,
                completion: &completion,
                result: &result,
            })
            .expect("record");
        assert!(second.ends_with("cycle-0002.json"));
    }
}
