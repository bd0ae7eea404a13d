use std::fmt;
use std::time::Duration;

use crate::common::utils::{pretty_duration, timestamp};

use super::progress::ProgressSnapshot;

/// 单个下载任务的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initialized,
    TempWorkspaceReady,
    ProgressiveDownload,
    HlsDownload,
    Assembled,
    SubtitlesAttached,
    Cleaned,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Skipped(String),
    Completed(Duration),
    Failed(String),
    Cancelled,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed(_) | JobStatus::Skipped(_))
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Skipped(reason) => write!(f, "skipped ({reason})"),
            JobStatus::Completed(elapsed) => write!(f, "completed in {}", pretty_duration(*elapsed)),
            JobStatus::Failed(reason) => write!(f, "failed: {reason}"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// 任务结束后交给上层汇总的结果
#[derive(Debug, Clone)]
pub struct JobReport {
    pub file_name: String,
    pub status: JobStatus,
    pub progress: Option<ProgressSnapshot>,
    pub finished_at: String,
}

impl JobReport {
    pub fn new(file_name: impl Into<String>, status: JobStatus) -> Self {
        Self {
            file_name: file_name.into(),
            status,
            progress: None,
            finished_at: timestamp(),
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressSnapshot>) -> Self {
        self.progress = progress;
        self
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.finished_at, self.file_name, self.status)
    }
}
