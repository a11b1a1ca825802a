//! Chapter source: HTML parsing and chapter-list discovery.

pub mod html;
pub mod resolver;

pub use html::{parse_metadata, HtmlChapterParser};
pub use resolver::{
    select_mode, ChapterIndexResolver, ChapterPlan, DiscoveryMode, ResolveError, ResolvedIndex,
};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Chapter content container not found at {url}")]
    MissingContainer { url: String },

    #[error("Chapter text is empty at {url}")]
    Empty { url: String },

    #[error("Invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
}

/// Parsed chapter page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChapter {
    pub title: String,
    pub paragraphs: Vec<String>,
    /// Absolute URL of the following chapter, when the page links one.
    pub next_url: Option<String>,
}

/// Turns a fetched chapter page into structured text. Called once per fetched chapter,
/// possibly from several worker threads at once.
pub trait ChapterParser: Send + Sync {
    fn parse(&self, raw: &str, url: &str) -> Result<ParsedChapter, ParseError>;

    /// Next-chapter link on a page that did not parse, so a crawl can step over it.
    fn next_link(&self, _raw: &str, _url: &str) -> Option<String> {
        None
    }
}
