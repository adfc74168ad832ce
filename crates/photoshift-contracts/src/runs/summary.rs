use std::path::Path;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobs::{JobStatus, TransformationJob};

/// End-of-session totals. Pending and processing jobs count toward
/// `total_jobs` only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total_jobs: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub simulated: u64,
    pub credits_spent: u64,
    pub credits_available: u64,
}

impl SessionSummary {
    pub fn tally<'a>(&mut self, jobs: impl IntoIterator<Item = &'a TransformationJob>) {
        for job in jobs {
            self.total_jobs += 1;
            let bucket = match job.status() {
                JobStatus::Completed => &mut self.completed,
                JobStatus::Failed => &mut self.failed,
                JobStatus::TimedOut => &mut self.timed_out,
                JobStatus::Cancelled => &mut self.cancelled,
                JobStatus::Pending | JobStatus::Processing => continue,
            };
            *bucket += 1;
            if job.is_simulated() {
                self.simulated += 1;
            }
        }
    }
}

#[derive(Serialize)]
struct SummaryFile<'a> {
    #[serde(flatten)]
    summary: &'a SessionSummary,
    ts: String,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Writes `summary.json`. Keys in `extra` are added alongside the totals.
pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let empty = Map::new();
    let file = SummaryFile {
        summary,
        ts: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
        extra: extra.unwrap_or(&empty),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&file)?)
        .with_context(|| format!("failed to write {}", path.display()))
}
