use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use novelscrape::fetch::{FetchClient, ProxyPool, ReqwestTransport, ThreadSleeper};
use novelscrape::model::{FailureKind, JobStatus};
use novelscrape::orchestrator::{JobOptions, Orchestrator, ProgressEvent};
use novelscrape::source::{DiscoveryMode, HtmlChapterParser};
use novelscrape::{write_volumes, CancellationToken, Settings};

static COVER_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1, 128,
    110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

const CHAPTERS: u32 = 5;

fn index_html() -> String {
    let mut links = String::new();
    for n in 1..=CHAPTERS {
        links.push_str(&format!(
            r#"<li><a href="/novel/tales/chapter-{n}">Chapter {n}</a></li>"#
        ));
    }
    format!(
        r#"<!doctype html>
<html>
  <head>
    <meta property="og:title" content="Tales of the Road">
    <meta property="og:novel:author" content="Ann Writer">
    <meta property="og:novel:genre" content="Fantasy, Adventure">
    <meta property="og:image" content="/cover.png">
    <meta property="og:novel:read_url" content="/novel/tales/chapter-1">
  </head>
  <body>
    <h1 class="tit">Tales of the Road</h1>
    <ul>{links}</ul>
    <p>A long road, many chapters, and a steady walk from one town to the next.</p>
  </body>
</html>"#
    )
}

fn chapter_html(n: u32) -> String {
    let next = if n < CHAPTERS {
        format!(r#"<a title="Next Chapter" href="/novel/tales/chapter-{}">Next</a>"#, n + 1)
    } else {
        String::new()
    };
    format!(
        r#"<!doctype html>
<html>
  <head><title>Chapter {n}</title></head>
  <body>
    <div class="m-read">
      <span class="chapter">Chapter {n}</span>
      <p>The travellers woke early on day {n} and packed their things.</p>
      <p>By noon the road had turned to gravel and the hills rose ahead.</p>
    </div>
    {next}
  </body>
</html>"#
    )
}

struct TestServer {
    base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// `flaky` paths answer 500 on their first request; `blocked` paths always answer 403.
    fn start(flaky: &[&str], blocked: &[&str]) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base_url = format!("http://{}", server.server_addr());
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();
        let flaky: Vec<String> = flaky.iter().map(|s| s.to_string()).collect();
        let blocked: Vec<String> = blocked.iter().map(|s| s.to_string()).collect();

        let hits_srv = Arc::clone(&hits);
        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(_) => break,
            };
            let path = request.url().to_string();
            let count = {
                let mut h = hits_srv.lock().expect("hits lock");
                let c = h.entry(path.clone()).or_insert(0);
                *c += 1;
                *c
            };

            let (status, body, content_type): (u16, Vec<u8>, &str) =
                if blocked.contains(&path) {
                    (403, b"denied".to_vec(), "text/plain")
                } else if flaky.contains(&path) && count == 1 {
                    (500, b"try again".to_vec(), "text/plain")
                } else if path == "/novel/tales" {
                    (200, index_html().into_bytes(), "text/html; charset=utf-8")
                } else if path == "/cover.png" {
                    (200, COVER_PNG.to_vec(), "image/png")
                } else if let Some(n) = path
                    .strip_prefix("/novel/tales/chapter-")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| (1..=CHAPTERS).contains(n))
                {
                    (200, chapter_html(n).into_bytes(), "text/html; charset=utf-8")
                } else {
                    (404, b"not found".to_vec(), "text/plain")
                };

            let header =
                tiny_http::Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
                    .expect("build header");
            let response = tiny_http::Response::from_data(body)
                .with_status_code(status)
                .with_header(header);
            let _ = request.respond(response);
        });

        Self {
            base_url,
            hits,
            shutdown,
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .expect("hits lock")
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.retry.base = Duration::from_millis(10);
    settings.retry.max_backoff = Duration::from_millis(20);
    settings.retry.max_attempts = 3;
    settings.http.timeout = Duration::from_secs(5);
    settings
}

fn options(workers: usize) -> JobOptions {
    JobOptions {
        workers,
        retry_rounds: 1,
        ..JobOptions::default()
    }
}

#[test]
fn indexed_scrape_writes_ordered_volumes_with_cover() -> Result<(), Box<dyn std::error::Error>> {
    let server = TestServer::start(&["/novel/tales/chapter-3"], &[]);
    let settings = fast_settings();
    let pool = ProxyPool::direct_only(true);
    let transport = ReqwestTransport::new(settings.http.clone());
    let sleeper = ThreadSleeper;
    let client = FetchClient::new(&transport, &pool, &sleeper, &settings);
    let parser = HtmlChapterParser;
    let token = CancellationToken::new();

    let done = AtomicUsize::new(0);
    let orchestrator = Orchestrator::new(&client, &parser, &token, options(3));
    let (job, mode) = orchestrator.scrape(&server.url("/novel/tales"), &mut |e| {
        if let ProgressEvent::ChapterDone { .. } = e {
            done.fetch_add(1, Ordering::Relaxed);
        }
    })?;

    assert_eq!(mode, DiscoveryMode::IndexScan);
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.failed.is_empty());
    assert_eq!(done.load(Ordering::Relaxed), CHAPTERS as usize);
    let indices: Vec<u32> = job.chapters.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert_eq!(job.metadata.title, "Tales of the Road");
    assert_eq!(job.metadata.author, "Ann Writer");
    assert_eq!(server.hits("/novel/tales/chapter-3"), 2);

    let cover_url = job.metadata.cover_url.clone().ok_or("cover url missing")?;
    let cover = client.fetch_asset(&cover_url, 0, &token)?;
    assert_eq!(cover, COVER_PNG);

    let dir = tempfile::tempdir()?;
    let paths = write_volumes(&job, Some(&cover), 2, dir.path())?;
    let names: Vec<String> = paths
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "tales_of_the_road-i.epub",
            "tales_of_the_road-ii.epub",
            "tales_of_the_road-iii.epub"
        ]
    );

    let mut zip = zip::ZipArchive::new(std::fs::File::open(&paths[1])?)?;
    let mut chapter = String::new();
    zip.by_name("OEBPS/chapter-2.xhtml")?
        .read_to_string(&mut chapter)?;
    assert!(chapter.contains("<h1>Chapter 4</h1>"));
    assert!(zip.by_name("OEBPS/images/cover.png").is_ok());
    Ok(())
}

#[test]
fn sequential_crawl_follows_next_links() -> Result<(), Box<dyn std::error::Error>> {
    let server = TestServer::start(&[], &[]);
    let settings = fast_settings();
    let pool = ProxyPool::direct_only(true);
    let transport = ReqwestTransport::new(settings.http.clone());
    let sleeper = ThreadSleeper;
    let client = FetchClient::new(&transport, &pool, &sleeper, &settings);
    let parser = HtmlChapterParser;
    let token = CancellationToken::new();

    let orchestrator = Orchestrator::new(&client, &parser, &token, options(0));
    let (job, mode) = orchestrator.scrape(&server.url("/novel/tales"), &mut |_| {})?;

    assert_eq!(mode, DiscoveryMode::SequentialCrawl);
    assert_eq!(job.status, JobStatus::Completed);
    let titles: Vec<&str> = job.chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(
        titles,
        vec!["Chapter 1", "Chapter 2", "Chapter 3", "Chapter 4", "Chapter 5"]
    );
    for n in 1..=CHAPTERS {
        assert_eq!(server.hits(&format!("/novel/tales/chapter-{n}")), 1);
    }
    Ok(())
}

#[test]
fn blocked_chapter_is_reported_and_others_kept() -> Result<(), Box<dyn std::error::Error>> {
    let server = TestServer::start(&[], &["/novel/tales/chapter-2"]);
    let settings = fast_settings();
    let pool = ProxyPool::direct_only(true);
    let transport = ReqwestTransport::new(settings.http.clone());
    let sleeper = ThreadSleeper;
    let client = FetchClient::new(&transport, &pool, &sleeper, &settings);
    let parser = HtmlChapterParser;
    let token = CancellationToken::new();

    let orchestrator = Orchestrator::new(&client, &parser, &token, options(2));
    let (job, _) = orchestrator.scrape(&server.url("/novel/tales"), &mut |_| {})?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_indices(), vec![2]);
    assert_eq!(job.failed[0].kind, FailureKind::Blocked);
    let indices: Vec<u32> = job.chapters.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![1, 3, 4, 5]);
    assert!(job.is_partial());
    Ok(())
}
