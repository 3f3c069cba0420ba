//! File-persisted sync progress.
//!
//! A checkpoint is written after every committed batch. A run that finds one
//! on start resumes it: finished stages are skipped and the current stage
//! continues from the saved page under the same sync-log row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Establishments,
    Staff,
    Students,
    QuestionResponses,
    Enrollments,
    Statistics,
}

impl Stage {
    /// Execution order; later stages rely on rows written by earlier ones.
    pub const ALL: [Stage; 6] = [
        Stage::Establishments,
        Stage::Staff,
        Stage::Students,
        Stage::QuestionResponses,
        Stage::Enrollments,
        Stage::Statistics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Establishments => "establishments",
            Stage::Staff => "staff",
            Stage::Students => "students",
            Stage::QuestionResponses => "question_responses",
            Stage::Enrollments => "enrollments",
            Stage::Statistics => "statistics",
        }
    }

    pub fn parse(s: &str) -> Result<Stage, String> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| {
                let known = Stage::ALL.iter().map(Stage::as_str).collect::<Vec<_>>().join(", ");
                format!("unknown sync stage '{}' (expected one of: {})", s.trim(), known)
            })
    }

    /// Comma-separated list, returned deduplicated in execution order.
    pub fn parse_list(s: &str) -> Result<Vec<Stage>, String> {
        let mut wanted = BTreeSet::new();
        for part in s.split(',').filter(|p| !p.trim().is_empty()) {
            wanted.insert(Stage::parse(part)?);
        }
        if wanted.is_empty() {
            return Err("stage list is empty".to_string());
        }
        Ok(Stage::ALL.iter().copied().filter(|s| wanted.contains(s)).collect())
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub processed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: Stage,
    /// 1-based page to request next.
    pub next_page: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Sync-log row of the run this checkpoint belongs to.
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_stages: Vec<Stage>,
    #[serde(default)]
    pub current: Option<StageProgress>,
    #[serde(default)]
    pub counts: BTreeMap<Stage, StageCounts>,
    /// Academic years that received score rows; statistics are recomputed for these.
    #[serde(default)]
    pub academic_years: BTreeSet<String>,
}

impl Checkpoint {
    pub fn new(run_id: i64, started_at: DateTime<Utc>) -> Self {
        Checkpoint {
            run_id,
            started_at,
            completed_stages: Vec::new(),
            current: None,
            counts: BTreeMap::new(),
            academic_years: BTreeSet::new(),
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed_stages.contains(&stage)
    }

    pub fn resume_page(&self, stage: Stage) -> u32 {
        match &self.current {
            Some(progress) if progress.stage == stage => progress.next_page.max(1),
            _ => 1,
        }
    }

    pub fn record_batch(&mut self, stage: Stage, next_page: u32, processed: u64, skipped: u64) {
        self.current = Some(StageProgress { stage, next_page });
        let entry = self.counts.entry(stage).or_default();
        entry.processed += processed;
        entry.skipped += skipped;
    }

    /// Forget a stage's counts; used by stages that redo all their work on resume.
    pub fn reset_counts(&mut self, stage: Stage) {
        self.counts.remove(&stage);
    }

    pub fn complete_stage(&mut self, stage: Stage) {
        if !self.is_complete(stage) {
            self.completed_stages.push(stage);
        }
        if self.current.as_ref().is_some_and(|p| p.stage == stage) {
            self.current = None;
        }
        self.counts.entry(stage).or_default();
    }

    pub fn total_processed(&self) -> u64 {
        self.counts.values().map(|c| c.processed).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.counts.values().map(|c| c.skipped).sum()
    }

    /// Summary stored in the sync log's metadata column.
    pub fn metadata(&self) -> serde_json::Value {
        let stages: serde_json::Map<String, serde_json::Value> = self
            .counts
            .iter()
            .map(|(stage, c)| {
                (
                    stage.as_str().to_string(),
                    serde_json::json!({ "processed": c.processed, "skipped": c.skipped }),
                )
            })
            .collect();
        serde_json::json!({
            "stages": stages,
            "completed_stages": self.completed_stages.iter().map(Stage::as_str).collect::<Vec<_>>(),
            "academic_years": self.academic_years,
        })
    }
}

/// Reads the checkpoint; `Ok(None)` when no file exists.
/// A file that exists but cannot be parsed is an error, never silently dropped.
pub fn load(path: &Path) -> Result<Option<Checkpoint>, String> {
    let json = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("failed to read checkpoint {}: {}", path.display(), e)),
    };
    let de = &mut serde_json::Deserializer::from_str(&json);
    let checkpoint: Checkpoint = serde_path_to_error::deserialize(de).map_err(|e| {
        format!(
            "checkpoint {} is corrupt at {}: {} (delete it to start a fresh sync)",
            path.display(),
            e.path(),
            e.inner()
        )
    })?;
    Ok(Some(checkpoint))
}

/// Writes to a sibling temp file and renames it over the target.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), String> {
    let json = serde_json::to_vec_pretty(checkpoint).map_err(|e| format!("serialize checkpoint failed: {}", e))?;
    let tmp = temp_path(path);
    {
        let mut file =
            fs::File::create(&tmp).map_err(|e| format!("failed to create {}: {}", tmp.display(), e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| format!("failed to write {}: {}", tmp.display(), e))?;
    }
    fs::rename(&tmp, path).map_err(|e| format!("failed to move checkpoint into {}: {}", path.display(), e))
}

pub fn clear(path: &Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("failed to remove checkpoint {}: {}", path.display(), e)),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "checkpoint".into());
    name.push(".tmp");
    path.with_file_name(name)
}
