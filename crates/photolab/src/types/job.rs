//! Batch job data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Error;

/// Quality/latency tradeoff selecting the removal provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Quality,
    Fast,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quality => "quality",
            Mode::Fast => "fast",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quality" => Ok(Mode::Quality),
            "fast" => Ok(Mode::Fast),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Job lifecycle state; transitions only move forward
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Started,
    Finished,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Started => "started",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "started" => Some(JobState::Started),
            "finished" => Some(JobState::Finished),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One prepared image of a batch
#[derive(Debug, Clone)]
pub struct JobItem {
    pub filename: String,
    pub data: Vec<u8>,
}

impl JobItem {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }
}

/// Items completed out of the job's total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.done, self.total)
    }
}

impl Serialize for Progress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Where a processed image can be retrieved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultReference {
    /// Inline `data:image/png;base64,...` payload
    DataUrl { data_url: String },
    /// Object store key plus a temporary download link
    Object { key: String, url: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Succeeded,
    Failed,
}

/// Outcome of one batch item, in submission order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemResult {
    pub filename: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ResultReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemResult {
    pub fn succeeded(filename: impl Into<String>, reference: ResultReference) -> Self {
        Self {
            filename: filename.into(),
            status: ItemStatus::Succeeded,
            reference: Some(reference),
            error: None,
        }
    }

    pub fn failed(filename: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: ItemStatus::Failed,
            reference: None,
            error: Some(error.into()),
        }
    }
}

/// Job record as stored in the queue (without item payloads)
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub mode: Mode,
    pub state: JobState,
    pub progress: Progress,
    pub results: Vec<ItemResult>,
    pub filenames: Vec<String>,
    pub error: Option<String>,
    pub timeout: Duration,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A job claimed by a worker, with its payloads in submission order
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub mode: Mode,
    pub timeout: Duration,
    pub items: Vec<JobItem>,
}

/// Read projection returned to polling clients
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub state: JobState,
    pub mode: Mode,
    pub progress: Progress,
    /// Submitted filenames in processing order
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ItemResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        let results = (job.state == JobState::Finished).then_some(job.results);
        let error = if job.state == JobState::Failed { job.error } else { None };
        Self {
            job_id: job.id,
            state: job.state,
            mode: job.mode,
            progress: job.progress,
            files: job.filenames,
            results,
            error,
        }
    }
}
