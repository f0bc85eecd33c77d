use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransitionError;

/// Lifecycle of a scrape run: `pending -> running -> completed | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    fn can_become(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Per-run tallies. `new` vs `updated` is informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub found: u32,
    pub new: u32,
    pub updated: u32,
}

/// One execution record per run of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: JobStatus,
    pub full_scrape: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: JobCounters,
    pub error_message: Option<String>,
}

impl ScrapeJob {
    pub fn pending(source_id: Uuid, full_scrape: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            status: JobStatus::Pending,
            full_scrape,
            created_at: now,
            started_at: None,
            completed_at: None,
            counters: JobCounters::default(),
            error_message: None,
        }
    }

    /// Shorthand for a job created at the moment its run begins.
    pub fn started(source_id: Uuid, full_scrape: bool, now: DateTime<Utc>) -> Self {
        let mut job = Self::pending(source_id, full_scrape, now);
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job
    }

    pub fn complete(
        &mut self,
        counters: JobCounters,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.counters = counters;
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        counters: JobCounters,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.counters = counters;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_become(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}
