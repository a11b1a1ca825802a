//! Chapter discovery: index scan over table-of-contents pages, or sequential crawl.

use crate::cancel::CancellationToken;
use crate::fetch::{FetchClient, FetchError};
use crate::model::{ChapterTask, NovelMetadata};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::html::{extract_chapter_links, find_next_index_page, parse_metadata};
use super::ParseError;

/// TOC pages followed before giving up on pagination.
pub const DEFAULT_MAX_INDEX_PAGES: usize = 20;

/// Worker id for resolver fetches. Resolution finishes before any chapter worker runs.
const RESOLVER_WORKER: usize = 0;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Could not fetch index page: {0}")]
    Fetch(#[from] FetchError),

    #[error("Could not parse index page: {0}")]
    Parse(#[from] ParseError),

    #[error("Cancelled while resolving chapters")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Chapter URLs read from table-of-contents pages; supports offsets and parallel fetch.
    IndexScan,
    /// Follow "next chapter" links from the first chapter.
    SequentialCrawl,
}

impl std::fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryMode::IndexScan => write!(f, "index scan"),
            DiscoveryMode::SequentialCrawl => write!(f, "sequential crawl"),
        }
    }
}

/// Any worker count uses the index. With no workers, a start offset past the first
/// chapter also promotes to index scan, since crawling would fetch every skipped chapter.
pub fn select_mode(workers: usize, start: u32) -> DiscoveryMode {
    if workers > 0 || start > 1 {
        DiscoveryMode::IndexScan
    } else {
        DiscoveryMode::SequentialCrawl
    }
}

/// What to fetch, decided before any chapter is downloaded.
#[derive(Debug, Clone)]
pub enum ChapterPlan {
    Indexed(Vec<ChapterTask>),
    Crawl { start_url: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedIndex {
    pub metadata: NovelMetadata,
    /// Mode actually used, after fallback.
    pub mode: DiscoveryMode,
    pub plan: ChapterPlan,
}

#[derive(Debug, Clone)]
pub struct ChapterIndexResolver {
    max_index_pages: usize,
}

impl Default for ChapterIndexResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INDEX_PAGES)
    }
}

impl ChapterIndexResolver {
    pub fn new(max_index_pages: usize) -> Self {
        Self {
            max_index_pages: max_index_pages.max(1),
        }
    }

    /// Fetch the novel page, read its metadata and decide the chapter plan.
    /// `start` is the first wanted chapter number (1-based); `limit` caps the count.
    pub fn resolve(
        &self,
        client: &FetchClient<'_>,
        token: &CancellationToken,
        url: &str,
        workers: usize,
        start: u32,
        limit: Option<usize>,
    ) -> Result<ResolvedIndex, ResolveError> {
        let start = start.max(1);
        let page = client.fetch(url, RESOLVER_WORKER, token)?;
        let html = page.text();
        let metadata = parse_metadata(&html, url)?;
        info!(title = %metadata.title, author = %metadata.author, "novel metadata");

        let crawl_start = metadata
            .read_first_url
            .clone()
            .unwrap_or_else(|| url.to_string());

        let requested = select_mode(workers, start);
        if requested == DiscoveryMode::SequentialCrawl {
            return Ok(ResolvedIndex {
                metadata,
                mode: DiscoveryMode::SequentialCrawl,
                plan: ChapterPlan::Crawl {
                    start_url: crawl_start,
                },
            });
        }
        if workers == 0 {
            info!(start, "start offset requested, promoting to index scan");
        }

        let links = self.scan_index(client, token, url, html)?;
        let mut tasks: Vec<ChapterTask> = Vec::new();
        let mut numbers = HashSet::new();
        for (num, link) in links {
            if num < start || !numbers.insert(num) {
                continue;
            }
            tasks.push(ChapterTask::new(num, link));
        }
        if let Some(limit) = limit.filter(|l| *l > 0) {
            tasks.truncate(limit);
        }

        if tasks.is_empty() {
            warn!(url, "no chapter links on index, falling back to sequential crawl");
            return Ok(ResolvedIndex {
                metadata,
                mode: DiscoveryMode::SequentialCrawl,
                plan: ChapterPlan::Crawl {
                    start_url: crawl_start,
                },
            });
        }
        info!(chapters = tasks.len(), "chapter index resolved");
        Ok(ResolvedIndex {
            metadata,
            mode: DiscoveryMode::IndexScan,
            plan: ChapterPlan::Indexed(tasks),
        })
    }

    /// Collect chapter links from the first TOC page and any paginated follow-ups.
    fn scan_index(
        &self,
        client: &FetchClient<'_>,
        token: &CancellationToken,
        first_url: &str,
        first_html: String,
    ) -> Result<Vec<(u32, String)>, ResolveError> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(first_url.to_string());
        let mut links = extract_chapter_links(&first_html, first_url)?;
        let mut next = find_next_index_page(&first_html, first_url)?;
        let mut pages = 1;

        while let Some(page_url) = next.take() {
            if pages >= self.max_index_pages || !visited.insert(page_url.clone()) {
                break;
            }
            if token.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            if token.should_halt() {
                info!(pages, "stop requested, keeping index links found so far");
                break;
            }
            let html = match client.fetch(&page_url, RESOLVER_WORKER, token) {
                Ok(p) => p.text(),
                Err(FetchError::Cancelled { .. }) => return Err(ResolveError::Cancelled),
                Err(e) => {
                    warn!(url = %page_url, error = %e, "index page failed, keeping links so far");
                    break;
                }
            };
            pages += 1;
            let found = extract_chapter_links(&html, &page_url)?;
            debug!(url = %page_url, links = found.len(), "index page scanned");
            links.extend(found);
            next = find_next_index_page(&html, &page_url)?;
        }

        // Same de-duplication rule across pages: smallest number per URL.
        links.sort();
        let mut seen = HashSet::new();
        links.retain(|(_, u)| seen.insert(u.clone()));
        links.sort();
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fetch::retry::RecordingSleeper;
    use crate::fetch::testing::ScriptedTransport;
    use crate::fetch::{ProxyChoice, ProxyPool, RawResponse, Transport, TransportError};

    /// Flips the token on every request it serves.
    struct SignallingTransport<'a> {
        inner: ScriptedTransport,
        token: &'a CancellationToken,
        cancel: bool,
    }

    impl Transport for SignallingTransport<'_> {
        fn get(&self, url: &str, route: &ProxyChoice) -> Result<RawResponse, TransportError> {
            if self.cancel {
                self.token.request_cancel();
            } else {
                self.token.request_stop();
            }
            self.inner.get(url, route)
        }
    }

    fn paginated() -> ScriptedTransport {
        ScriptedTransport::new()
            .page(INDEX, 200, &index_page(&[1, 2, 3], Some("/novel/x?page=2")))
            .page(PAGE_TWO, 200, &index_page(&[4, 5], None))
    }

    fn resolve_signalled(
        cancel: bool,
    ) -> (Result<ResolvedIndex, ResolveError>, ScriptedTransport) {
        let token = CancellationToken::new();
        let t = SignallingTransport {
            inner: paginated(),
            token: &token,
            cancel,
        };
        let pool = ProxyPool::direct_only(true);
        let sleeper = RecordingSleeper::new();
        let settings = Settings::default();
        let client = FetchClient::new(&t, &pool, &sleeper, &settings);
        let r = ChapterIndexResolver::default().resolve(&client, &token, INDEX, 2, 1, None);
        (r, t.inner)
    }

    const INDEX: &str = "https://novel.test/novel/x";
    const PAGE_TWO: &str = "https://novel.test/novel/x?page=2";

    fn index_page(links: &[u32], next_page: Option<&str>) -> Vec<u8> {
        let mut html = String::from(
            r#"<html><head><meta property="og:title" content="X Novel">
<meta property="og:novel:read_url" content="/novel/x/chapter-1"></head><body><ul>"#,
        );
        for n in links {
            html.push_str(&format!(r#"<li><a href="/novel/x/chapter-{n}">Chapter {n}</a></li>"#));
        }
        html.push_str("</ul>");
        if let Some(p) = next_page {
            html.push_str(&format!(r#"<a rel="next" href="{}">&gt;</a>"#, p));
        }
        html.push_str(&"<p>padding for the content size check</p>".repeat(6));
        html.push_str("</body></html>");
        html.into_bytes()
    }

    fn resolve(
        t: &ScriptedTransport,
        workers: usize,
        start: u32,
        limit: Option<usize>,
    ) -> Result<ResolvedIndex, ResolveError> {
        let pool = ProxyPool::direct_only(true);
        let sleeper = RecordingSleeper::new();
        let mut settings = Settings::default();
        settings.retry.max_attempts = 1;
        let client = FetchClient::new(t, &pool, &sleeper, &settings);
        ChapterIndexResolver::default().resolve(
            &client,
            &CancellationToken::new(),
            INDEX,
            workers,
            start,
            limit,
        )
    }

    fn indices(r: &ResolvedIndex) -> Vec<u32> {
        match &r.plan {
            ChapterPlan::Indexed(tasks) => tasks.iter().map(|t| t.index).collect(),
            ChapterPlan::Crawl { .. } => Vec::new(),
        }
    }

    #[test]
    fn mode_selection_rules() {
        assert_eq!(select_mode(4, 1), DiscoveryMode::IndexScan);
        assert_eq!(select_mode(0, 1), DiscoveryMode::SequentialCrawl);
        assert_eq!(select_mode(0, 120), DiscoveryMode::IndexScan);
        assert_eq!(select_mode(1, 120), DiscoveryMode::IndexScan);
    }

    #[test]
    fn zero_workers_with_offset_promotes_to_index_scan() {
        let t = ScriptedTransport::new().page(INDEX, 200, &index_page(&[118, 119, 120, 121], None));
        let r = resolve(&t, 0, 120, None).unwrap();
        assert_eq!(r.mode, DiscoveryMode::IndexScan);
        assert_eq!(indices(&r), vec![120, 121]);
    }

    #[test]
    fn zero_workers_from_start_crawls_from_read_first() {
        let t = ScriptedTransport::new().page(INDEX, 200, &index_page(&[1, 2], None));
        let r = resolve(&t, 0, 1, None).unwrap();
        assert_eq!(r.mode, DiscoveryMode::SequentialCrawl);
        match r.plan {
            ChapterPlan::Crawl { start_url } => {
                assert_eq!(start_url, "https://novel.test/novel/x/chapter-1")
            }
            ChapterPlan::Indexed(_) => panic!("expected crawl"),
        }
        assert_eq!(r.metadata.title, "X Novel");
    }

    #[test]
    fn paginated_index_is_followed_and_limited() {
        let page2 = "https://novel.test/novel/x?page=2";
        let t = ScriptedTransport::new()
            .page(INDEX, 200, &index_page(&[3, 1, 2], Some("/novel/x?page=2")))
            .page(page2, 200, &index_page(&[4, 5, 2], Some("/novel/x")));
        let r = resolve(&t, 3, 2, Some(3)).unwrap();
        assert_eq!(indices(&r), vec![2, 3, 4]);
        // The link back to page one is not revisited.
        assert_eq!(t.calls_to(INDEX), 1);
        assert_eq!(t.calls_to(page2), 1);
    }

    #[test]
    fn empty_index_falls_back_to_crawl() {
        let t = ScriptedTransport::new().page(INDEX, 200, &index_page(&[], None));
        let r = resolve(&t, 4, 1, None).unwrap();
        assert_eq!(r.mode, DiscoveryMode::SequentialCrawl);
        assert!(matches!(r.plan, ChapterPlan::Crawl { .. }));
    }

    #[test]
    fn failed_index_fetch_is_an_error() {
        let t = ScriptedTransport::new().page(INDEX, 500, b"");
        assert!(matches!(
            resolve(&t, 2, 1, None),
            Err(ResolveError::Fetch(FetchError::Network { .. }))
        ));
    }

    #[test]
    fn stop_during_pagination_keeps_links_found_so_far() {
        let (r, t) = resolve_signalled(false);
        let r = r.unwrap();
        assert_eq!(r.mode, DiscoveryMode::IndexScan);
        assert_eq!(indices(&r), vec![1, 2, 3]);
        assert_eq!(t.calls_to(PAGE_TWO), 0);
    }

    #[test]
    fn cancel_during_pagination_is_an_error() {
        let (r, t) = resolve_signalled(true);
        assert!(matches!(r, Err(ResolveError::Cancelled)));
        assert_eq!(t.calls_to(PAGE_TWO), 0);
    }
}
