//! novelscrape: proxy-aware concurrent web novel scraper, outputting EPUB volumes.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod epub;
pub mod fetch;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod source;

// Re-exports for CLI and consumers.
pub use cancel::{CancelState, CancellationToken};
pub use config::{ConfigError, FileConfig, Settings};
pub use epub::{plan_volumes, write_volumes, EpubError};
pub use fetch::{FetchClient, FetchError, ProxyPool, ReqwestTransport, ThreadSleeper, Transport};
pub use model::{ChapterResult, JobStatus, NovelJob, NovelMetadata};
pub use orchestrator::{JobError, JobOptions, Orchestrator, ProgressEvent};
pub use source::{ChapterIndexResolver, ChapterParser, DiscoveryMode, HtmlChapterParser};
