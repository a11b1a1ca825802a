//! Chapter worker pool.
//!
//! Tasks go into a crossbeam queue; N scoped worker threads pull from it and send each
//! finished task back to the calling thread, which records results keyed by chapter
//! index and drives the progress callback. Workers check the cancellation token (and a
//! local abort flag) before every task; the fetch layer checks it again between retry
//! attempts. With zero workers the same loop runs inline on the calling thread.

use crate::cancel::{CancelState, CancellationToken};
use crate::fetch::{FetchClient, FetchError};
use crate::model::{
    ChapterFailure, ChapterResult, ChapterTask, FailureKind, JobStatus, NovelJob, NovelMetadata,
    TaskState,
};
use crate::source::{
    ChapterIndexResolver, ChapterParser, ChapterPlan, DiscoveryMode, ParseError, ResolveError,
    ResolvedIndex,
};
use crossbeam_channel as channel;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Consecutive empty or unparseable pages that end a sequential crawl.
const MAX_EMPTY_STREAK: u32 = 3;
pub const DEFAULT_RETRY_ROUNDS: u32 = 2;

/// Terminal error for one chapter. Recorded on the report, never propagated on its own.
#[derive(Debug, Error)]
pub enum ChapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl ChapterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ChapterError::Fetch(e) => e.kind().into(),
            ChapterError::Parse(_) => FailureKind::Parse,
        }
    }

    /// Fetch failures may succeed on a later round; parse failures will not.
    fn retryable(&self) -> bool {
        matches!(
            self,
            ChapterError::Fetch(FetchError::Network { .. } | FetchError::Blocked { .. })
        )
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Chapter {index} failed in strict mode: {message}")]
    Strict { index: u32, message: String },

    #[error("No healthy proxy remains and direct connections are disabled (chapter {index})")]
    ProxyExhausted { index: u32 },
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    /// 0 runs every task inline on the calling thread.
    pub workers: usize,
    /// First wanted chapter (1-based).
    pub start: u32,
    pub limit: Option<usize>,
    pub retry_rounds: u32,
    /// Abort on the first chapter that ends in failure.
    pub strict: bool,
    pub max_index_pages: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            start: 1,
            limit: None,
            retry_rounds: DEFAULT_RETRY_ROUNDS,
            strict: false,
            max_index_pages: crate::source::resolver::DEFAULT_MAX_INDEX_PAGES,
        }
    }
}

/// Reported to the caller's progress callback, always on the calling thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Planned { total: usize },
    ChapterDone { index: u32, title: String },
    ChapterFailed { index: u32, kind: FailureKind },
    RetryRound { round: u32, pending: usize },
}

#[derive(Debug)]
enum TaskOutcome {
    Done(ChapterResult),
    Failed(ChapterError),
    /// Never started because the job was halting.
    Skipped,
    /// Fetch observed a cancel request.
    Cancelled,
}

impl TaskOutcome {
    fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Done(_) => TaskState::Done,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Skipped | TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

pub struct Orchestrator<'a, 'c> {
    client: &'a FetchClient<'c>,
    parser: &'a dyn ChapterParser,
    token: &'a CancellationToken,
    options: JobOptions,
}

impl<'a, 'c> Orchestrator<'a, 'c> {
    pub fn new(
        client: &'a FetchClient<'c>,
        parser: &'a dyn ChapterParser,
        token: &'a CancellationToken,
        options: JobOptions,
    ) -> Self {
        Self {
            client,
            parser,
            token,
            options,
        }
    }

    /// Resolve the chapter list for `url` and fetch it.
    pub fn scrape(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<(NovelJob, DiscoveryMode), JobError> {
        let resolved = ChapterIndexResolver::new(self.options.max_index_pages).resolve(
            self.client,
            self.token,
            url,
            self.options.workers,
            self.options.start,
            self.options.limit,
        )?;
        let mode = resolved.mode;
        Ok((self.run(resolved, on_progress)?, mode))
    }

    pub fn run(
        &self,
        resolved: ResolvedIndex,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<NovelJob, JobError> {
        match resolved.plan {
            ChapterPlan::Indexed(tasks) => self.run_indexed(resolved.metadata, tasks, on_progress),
            ChapterPlan::Crawl { start_url } => {
                self.run_crawl(resolved.metadata, &start_url, on_progress)
            }
        }
    }

    /// Fetch a fixed task list, then re-queue fetch failures for the configured rounds.
    pub fn run_indexed(
        &self,
        metadata: NovelMetadata,
        mut tasks: Vec<ChapterTask>,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<NovelJob, JobError> {
        let requested = tasks.len();
        on_progress(&ProgressEvent::Planned { total: requested });
        let mut results: BTreeMap<u32, ChapterResult> = BTreeMap::new();
        let mut failures: BTreeMap<u32, ChapterFailure> = BTreeMap::new();
        let mut retryable: HashSet<u32> = HashSet::new();
        // Retry rounds skipped by a halt still count as unfinished work.
        let mut retries_cut = false;

        for round in 0..=self.options.retry_rounds {
            let batch: Vec<ChapterTask> = if round == 0 {
                std::mem::take(&mut tasks)
            } else {
                if retryable.is_empty() {
                    break;
                }
                if self.token.should_halt() {
                    retries_cut = true;
                    break;
                }
                let batch: Vec<ChapterTask> = tasks
                    .iter()
                    .filter(|t| retryable.contains(&t.index))
                    .map(|t| ChapterTask::new(t.index, t.url.clone()))
                    .collect();
                tasks.retain(|t| !retryable.contains(&t.index));
                // Fresh proxies for the retry round.
                for w in 0..self.options.workers.max(1) {
                    self.client.pool().release(w);
                }
                info!(round, pending = batch.len(), "retrying failed chapters");
                on_progress(&ProgressEvent::RetryRound {
                    round,
                    pending: batch.len(),
                });
                batch
            };
            retryable.clear();

            for (task, outcome) in self.execute(batch, on_progress) {
                match outcome {
                    TaskOutcome::Done(result) => {
                        failures.remove(&task.index);
                        results.insert(task.index, result);
                    }
                    TaskOutcome::Failed(err) => {
                        if let ChapterError::Fetch(FetchError::ProxyExhausted { .. }) = err {
                            return Err(JobError::ProxyExhausted { index: task.index });
                        }
                        if self.options.strict && !err.retryable() {
                            return Err(JobError::Strict {
                                index: task.index,
                                message: err.to_string(),
                            });
                        }
                        if err.retryable() {
                            retryable.insert(task.index);
                        }
                        failures.insert(
                            task.index,
                            ChapterFailure {
                                index: task.index,
                                url: task.url.clone(),
                                kind: err.kind(),
                                message: err.to_string(),
                            },
                        );
                    }
                    TaskOutcome::Skipped | TaskOutcome::Cancelled => {}
                }
                tasks.push(task);
            }
            if self.token.is_cancelled() {
                break;
            }
        }

        if self.options.strict && !self.token.should_halt() {
            if let Some(f) = failures.values().next() {
                return Err(JobError::Strict {
                    index: f.index,
                    message: f.message.clone(),
                });
            }
        }

        tasks.sort_by_key(|t| t.index);
        let unfinished = retries_cut
            || tasks
                .iter()
                .any(|t| !matches!(t.state, TaskState::Done | TaskState::Failed));
        let status = self.final_status(unfinished);
        info!(
            chapters = results.len(),
            failed = failures.len(),
            status = ?status,
            "chapter fetch finished"
        );
        Ok(NovelJob {
            metadata,
            status,
            chapters: results.into_values().collect(),
            failed: failures.into_values().collect(),
            requested,
        })
    }

    /// Follow next-chapter links from `start_url`, one page at a time.
    pub fn run_crawl(
        &self,
        metadata: NovelMetadata,
        start_url: &str,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Result<NovelJob, JobError> {
        let start = self.options.start.max(1);
        let limit = self.options.limit.filter(|l| *l > 0);
        let mut chapters: Vec<ChapterResult> = Vec::new();
        let mut failed: Vec<ChapterFailure> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut next = Some(start_url.to_string());
        let mut empty_streak = 0;
        let mut seen = 0u32;
        let mut halted = false;

        while let Some(url) = next.take() {
            if self.token.should_halt() {
                halted = true;
                break;
            }
            if !visited.insert(url.clone()) {
                warn!(url = %url, "next link loops back, ending crawl");
                break;
            }
            let page = match self.client.fetch(&url, 0, self.token) {
                Ok(p) => p,
                Err(FetchError::Cancelled { .. }) => {
                    halted = true;
                    break;
                }
                Err(FetchError::ProxyExhausted { .. }) => {
                    return Err(JobError::ProxyExhausted { index: seen + 1 });
                }
                Err(e) => {
                    // Without the page there is no next link to follow.
                    let err = ChapterError::Fetch(e);
                    if self.options.strict {
                        return Err(JobError::Strict {
                            index: seen + 1,
                            message: err.to_string(),
                        });
                    }
                    warn!(url = %url, error = %err, "crawl stopped at unfetchable chapter");
                    on_progress(&ProgressEvent::ChapterFailed {
                        index: seen + 1,
                        kind: err.kind(),
                    });
                    failed.push(ChapterFailure {
                        index: seen + 1,
                        url,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                    break;
                }
            };
            let raw = page.text();
            match self.parser.parse(&raw, &url) {
                Ok(parsed) => {
                    empty_streak = 0;
                    seen += 1;
                    next = parsed.next_url;
                    if seen < start {
                        debug!(index = seen, "before start chapter, skipping");
                        continue;
                    }
                    on_progress(&ProgressEvent::ChapterDone {
                        index: seen,
                        title: parsed.title.clone(),
                    });
                    chapters.push(ChapterResult {
                        index: seen,
                        title: parsed.title,
                        paragraphs: parsed.paragraphs,
                        raw_size: page.body.len(),
                    });
                    if limit.map_or(false, |l| chapters.len() >= l) {
                        break;
                    }
                }
                Err(e) => {
                    if self.options.strict {
                        return Err(JobError::Strict {
                            index: seen + 1,
                            message: e.to_string(),
                        });
                    }
                    empty_streak += 1;
                    warn!(url = %url, error = %e, empty_streak, "empty chapter in crawl, skipping");
                    if empty_streak >= MAX_EMPTY_STREAK {
                        warn!("too many consecutive empty chapters, ending crawl");
                        break;
                    }
                    next = self.parser.next_link(&raw, &url);
                }
            }
        }

        let status = self.final_status(halted);
        info!(chapters = chapters.len(), status = ?status, "crawl finished");
        Ok(NovelJob {
            metadata,
            status,
            requested: chapters.len() + failed.len(),
            chapters,
            failed,
        })
    }

    fn final_status(&self, unfinished: bool) -> JobStatus {
        match self.token.state() {
            CancelState::CancelRequested => JobStatus::Cancelled,
            CancelState::StopRequested if unfinished => JobStatus::Stopped,
            _ => JobStatus::Completed,
        }
    }

    fn halted(&self, abort: &AtomicBool) -> bool {
        self.token.should_halt() || abort.load(Ordering::Acquire)
    }

    /// Run one batch to completion (or until halted). Returns every task with its outcome.
    fn execute(
        &self,
        batch: Vec<ChapterTask>,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) -> Vec<(ChapterTask, TaskOutcome)> {
        let abort = AtomicBool::new(false);
        let mut finished = Vec::with_capacity(batch.len());

        if self.options.workers == 0 {
            for mut task in batch {
                let outcome = self.run_task(&mut task, 0, &abort);
                self.observe(&task, &outcome, &abort, on_progress);
                finished.push((task, outcome));
            }
            return finished;
        }

        let workers = self.options.workers.min(batch.len()).max(1);
        let (tx_jobs, rx_jobs) = channel::unbounded::<ChapterTask>();
        let (tx_res, rx_res) = channel::unbounded::<(ChapterTask, TaskOutcome)>();
        for task in batch {
            let _ = tx_jobs.send(task);
        }
        drop(tx_jobs);

        std::thread::scope(|s| {
            for worker in 0..workers {
                let rx = rx_jobs.clone();
                let tx = tx_res.clone();
                let abort = &abort;
                s.spawn(move || {
                    for mut task in rx.iter() {
                        let outcome = self.run_task(&mut task, worker, abort);
                        if tx.send((task, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx_res);
            for (task, outcome) in rx_res.iter() {
                self.observe(&task, &outcome, &abort, on_progress);
                finished.push((task, outcome));
            }
        });
        finished
    }

    fn run_task(&self, task: &mut ChapterTask, worker: usize, abort: &AtomicBool) -> TaskOutcome {
        if self.halted(abort) {
            task.state = TaskState::Cancelled;
            return TaskOutcome::Skipped;
        }
        task.state = TaskState::Fetching;
        debug!(index = task.index, worker, url = %task.url, "fetching chapter");
        let outcome = match self.client.fetch(&task.url, worker, self.token) {
            Ok(page) => match self.parser.parse(&page.text(), &task.url) {
                Ok(parsed) => TaskOutcome::Done(ChapterResult {
                    index: task.index,
                    title: parsed.title,
                    paragraphs: parsed.paragraphs,
                    raw_size: page.body.len(),
                }),
                Err(e) => TaskOutcome::Failed(e.into()),
            },
            Err(FetchError::Cancelled { .. }) => TaskOutcome::Cancelled,
            Err(e) => TaskOutcome::Failed(e.into()),
        };
        task.state = outcome.state();
        outcome
    }

    /// Calling-thread bookkeeping for one finished task.
    fn observe(
        &self,
        task: &ChapterTask,
        outcome: &TaskOutcome,
        abort: &AtomicBool,
        on_progress: &mut dyn FnMut(&ProgressEvent),
    ) {
        match outcome {
            TaskOutcome::Done(r) => on_progress(&ProgressEvent::ChapterDone {
                index: task.index,
                title: r.title.clone(),
            }),
            TaskOutcome::Failed(e) => {
                let fatal = e.kind() == FailureKind::ProxyExhausted
                    || (self.options.strict && !e.retryable());
                if fatal {
                    abort.store(true, Ordering::Release);
                }
                warn!(index = task.index, error = %e, "chapter failed");
                on_progress(&ProgressEvent::ChapterFailed {
                    index: task.index,
                    kind: e.kind(),
                });
            }
            TaskOutcome::Skipped | TaskOutcome::Cancelled => {}
        }
    }
}
