//! Data model for a scraping job.
//!
//! The EPUB writer and the JSON output both consume [NovelJob]; chapters inside it are
//! always ordered by index.

use crate::fetch::FetchErrorKind;
use serde::{Deserialize, Serialize};

/// Novel-level metadata taken from the index page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NovelMetadata {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub genres: Vec<String>,
    pub language: Option<String>,
    pub status: Option<String>,
    #[serde(rename = "coverUrl")]
    pub cover_url: Option<String>,
    pub synopsis: Option<String>,
    /// Page the job was started from.
    pub source_url: String,
    /// First chapter, entry point for sequential crawl.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_first_url: Option<String>,
}

/// Lifecycle of one chapter task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Fetching,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterTask {
    /// 1-based chapter ordinal.
    pub index: u32,
    pub url: String,
    pub state: TaskState,
}

impl ChapterTask {
    pub fn new(index: u32, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            state: TaskState::Pending,
        }
    }
}

/// One parsed chapter. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterResult {
    pub index: u32,
    pub title: String,
    pub paragraphs: Vec<String>,
    /// Size of the fetched page in bytes.
    pub raw_size: usize,
}

/// Why a chapter ended without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Blocked,
    ProxyExhausted,
    Cancelled,
    Parse,
}

impl From<FetchErrorKind> for FailureKind {
    fn from(k: FetchErrorKind) -> Self {
        match k {
            FetchErrorKind::Network => FailureKind::Network,
            FetchErrorKind::Blocked => FailureKind::Blocked,
            FetchErrorKind::ProxyExhausted => FailureKind::ProxyExhausted,
            FetchErrorKind::Cancelled => FailureKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChapterFailure {
    pub index: u32,
    pub url: String,
    pub kind: FailureKind,
    pub message: String,
}

/// How a job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Every task reached a terminal state (some may have failed).
    Completed,
    /// Stop was requested; chapters holds the ordered partial result.
    Stopped,
    /// Cancel was requested; results must not be published.
    Cancelled,
}

/// Everything one generation request produced.
#[derive(Debug, Clone, Serialize)]
pub struct NovelJob {
    pub metadata: NovelMetadata,
    pub status: JobStatus,
    /// Ordered by index.
    pub chapters: Vec<ChapterResult>,
    /// Ordered by index.
    pub failed: Vec<ChapterFailure>,
    /// Chapters that were requested (after start/limit filtering).
    pub requested: usize,
}

impl NovelJob {
    pub fn failed_indices(&self) -> Vec<u32> {
        self.failed.iter().map(|f| f.index).collect()
    }

    pub fn is_partial(&self) -> bool {
        self.status != JobStatus::Completed || !self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn sample_job() -> NovelJob {
        NovelJob {
            metadata: NovelMetadata {
                title: "The Long Road".to_string(),
                author: "A. Writer".to_string(),
                genres: vec!["Fantasy".to_string()],
                cover_url: Some("https://novel.test/cover.jpg".to_string()),
                source_url: "https://novel.test/novel/the-long-road".to_string(),
                ..NovelMetadata::default()
            },
            status: JobStatus::Stopped,
            chapters: vec![ChapterResult {
                index: 1,
                title: "Chapter 1".to_string(),
                paragraphs: vec!["First.".to_string(), "Second.".to_string()],
                raw_size: 2048,
            }],
            failed: vec![ChapterFailure {
                index: 2,
                url: "https://novel.test/novel/the-long-road/chapter-2".to_string(),
                kind: FailureKind::Blocked,
                message: "Access blocked".to_string(),
            }],
            requested: 3,
        }
    }

    #[test]
    fn job_serializes_with_status_and_failures() -> Result<(), Box<dyn Error>> {
        let json = serde_json::to_string(&sample_job())?;
        let v: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(v["status"].as_str(), Some("stopped"));
        assert_eq!(v["metadata"]["coverUrl"].as_str(), Some("https://novel.test/cover.jpg"));
        assert!(v["metadata"].get("read_first_url").is_none());
        assert_eq!(v["chapters"][0]["paragraphs"].as_array().map(|a| a.len()), Some(2));
        assert_eq!(v["failed"][0]["kind"].as_str(), Some("blocked"));
        Ok(())
    }

    #[test]
    fn partial_when_stopped_or_failed() {
        let mut job = sample_job();
        assert!(job.is_partial());
        assert_eq!(job.failed_indices(), vec![2]);
        job.status = JobStatus::Completed;
        assert!(job.is_partial());
        job.failed.clear();
        assert!(!job.is_partial());
    }

    #[test]
    fn fetch_kinds_map_to_failure_kinds() {
        assert_eq!(FailureKind::from(FetchErrorKind::Cancelled), FailureKind::Cancelled);
        assert_eq!(FailureKind::from(FetchErrorKind::ProxyExhausted), FailureKind::ProxyExhausted);
    }

    #[test]
    fn task_state_terminality() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Fetching.is_terminal());
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert_eq!(ChapterTask::new(3, "u").state, TaskState::Pending);
    }
}
