//! Decision trace — append-only JSONL of every policy evaluation.
//!
//! One line per decision, carrying the per-rule explanation list so
//! `autopilot explain` can show exactly why a prompt was auto-answered or
//! escalated. Rotates at 10 MB keeping three archives
//! (`decisions.jsonl.1` … `.3`).

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Rotate once the active file reaches this size.
const ROTATE_BYTES: u64 = 10 * 1024 * 1024;
/// Archives kept after rotation.
const ARCHIVE_COUNT: u32 = 3;

/// Outcome of evaluating one rule against one prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_criterion: Option<String>,
}

/// One decision-trace line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: String,
    pub prompt_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub action: String,
    pub reason: String,
    pub rule_evaluations: Vec<RuleEvaluation>,
}

impl TraceEntry {
    pub fn new(
        prompt_id: &str,
        rule_id: Option<&str>,
        action: &str,
        reason: &str,
        rule_evaluations: Vec<RuleEvaluation>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            prompt_id: prompt_id.to_string(),
            rule_id: rule_id.map(str::to_string),
            action: action.to_string(),
            reason: reason.to_string(),
            rule_evaluations,
        }
    }
}

/// Writer for the decision trace.
pub struct DecisionTrace {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl DecisionTrace {
    /// Open (creating parents) and append.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create trace directory: {}", parent.display())
            })?;
        }
        let file = open_append(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Append one entry, rotating first if the active file is full.
    pub fn record(&self, entry: &TraceEntry) -> Result<()> {
        let json = serde_json::to_string(entry).context("failed to serialize trace entry")?;
        let mut writer = self.writer.lock().unwrap();
        if self.needs_rotation() {
            writer.flush().ok();
            rotate(&self.path)?;
            *writer = BufWriter::new(open_append(&self.path)?);
        }
        writeln!(writer, "{json}").context("failed to write trace entry")?;
        writer.flush().context("failed to flush trace")?;
        Ok(())
    }

    fn needs_rotation(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| m.len() >= ROTATE_BYTES)
            .unwrap_or(false)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open decision trace: {}", path.display()))
}

fn rotate(path: &Path) -> Result<()> {
    let archive = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));
    let _ = std::fs::remove_file(archive(ARCHIVE_COUNT));
    for n in (1..ARCHIVE_COUNT).rev() {
        let from = archive(n);
        if from.exists() {
            std::fs::rename(&from, archive(n + 1))
                .with_context(|| format!("failed to rotate {}", from.display()))?;
        }
    }
    std::fs::rename(path, archive(1))
        .with_context(|| format!("failed to rotate {}", path.display()))?;
    Ok(())
}

/// Read the last `n` entries (newest last) for `autopilot explain`.
pub fn tail(path: &Path, n: usize) -> Result<Vec<TraceEntry>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open {}", path.display()));
        }
    };
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("failed to read trace line")?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TraceEntry>(&line) {
            Ok(entry) => entries.push(entry),
            // Tolerate torn tail lines from a crashed writer.
            Err(_) => continue,
        }
    }
    let skip = entries.len().saturating_sub(n);
    Ok(entries.split_off(skip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prompt_id: &str) -> TraceEntry {
        TraceEntry::new(
            prompt_id,
            Some("r1"),
            "auto_reply",
            "matched rule r1",
            vec![RuleEvaluation {
                rule_id: "r1".to_string(),
                matched: true,
                failing_criterion: None,
            }],
        )
    }

    #[test]
    fn writes_one_json_line_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("decisions.jsonl");
        let trace = DecisionTrace::open(&path).unwrap();
        trace.record(&entry("p1")).unwrap();
        trace.record(&entry("p2")).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: TraceEntry = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.action, "auto_reply");
            assert_eq!(parsed.rule_evaluations.len(), 1);
        }
    }

    #[test]
    fn tail_returns_newest_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("decisions.jsonl");
        let trace = DecisionTrace::open(&path).unwrap();
        for i in 0..10 {
            trace.record(&entry(&format!("p{i}"))).unwrap();
        }
        let last = tail(&path, 3).unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[2].prompt_id, "p9");
        assert_eq!(last[0].prompt_id, "p7");
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(tail(&tmp.path().join("absent.jsonl"), 5).unwrap().is_empty());
    }

    #[test]
    fn rotation_shifts_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("decisions.jsonl");
        std::fs::write(&path, "old-1\n").unwrap();
        rotate(&path).unwrap();
        std::fs::write(&path, "old-2\n").unwrap();
        rotate(&path).unwrap();
        std::fs::write(&path, "current\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(tmp.path().join("decisions.jsonl.1")).unwrap(),
            "old-2\n"
        );
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("decisions.jsonl.2")).unwrap(),
            "old-1\n"
        );
    }

    #[test]
    fn rotation_caps_archive_count() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("decisions.jsonl");
        for i in 0..5 {
            std::fs::write(&path, format!("gen-{i}\n")).unwrap();
            rotate(&path).unwrap();
        }
        assert!(tmp.path().join("decisions.jsonl.1").exists());
        assert!(tmp.path().join("decisions.jsonl.2").exists());
        assert!(tmp.path().join("decisions.jsonl.3").exists());
        assert!(!tmp.path().join("decisions.jsonl.4").exists());
        // Oldest generations fell off the end.
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("decisions.jsonl.3")).unwrap(),
            "gen-2\n"
        );
    }

    #[test]
    fn tolerates_torn_tail_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("decisions.jsonl");
        let trace = DecisionTrace::open(&path).unwrap();
        trace.record(&entry("p1")).unwrap();
        // Simulate a crash mid-write.
        use std::io::Write as _;
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"timestamp\":\"2026-01-").unwrap();

        let entries = tail(&path, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].prompt_id, "p1");
    }
}
