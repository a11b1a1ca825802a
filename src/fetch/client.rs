//! One logical URL fetch: proxy selection, request, classification, health report, backoff.

use crate::cancel::CancellationToken;
use crate::config::{HttpSettings, RetrySettings, Settings};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::classify::{BlockClassifier, Verdict};
use super::error::{FetchError, TransportError};
use super::proxy::{ProxyChoice, ProxyPool, WorkerId};
use super::retry::{AttemptState, RetryMachine, Sleeper};

/// A small pool of realistic desktop browsers, rotated per request.
const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 13_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
];

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Performs a single GET through the chosen route. Implementations must be shareable
/// across worker threads.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, route: &ProxyChoice) -> Result<RawResponse, TransportError>;
}

/// Blocking reqwest transport with one client (and cookie jar) per proxy.
#[derive(Debug)]
pub struct ReqwestTransport {
    http: HttpSettings,
    clients: Mutex<HashMap<Option<String>, reqwest::blocking::Client>>,
}

impl ReqwestTransport {
    pub fn new(http: HttpSettings) -> Self {
        Self {
            http,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, route: &ProxyChoice) -> Result<reqwest::blocking::Client, TransportError> {
        let key = route.address().map(str::to_string);
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = clients.get(&key) {
            return Ok(c.clone());
        }
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(
            reqwest::header::CACHE_CONTROL,
            reqwest::header::HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            reqwest::header::PRAGMA,
            reqwest::header::HeaderValue::from_static("no-cache"),
        );
        let mut builder = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .timeout(self.http.timeout)
            .redirect(reqwest::redirect::Policy::limited(self.http.max_redirects));
        if let Some(ref addr) = key {
            let proxy = reqwest::Proxy::all(addr.as_str()).map_err(|e| TransportError::Proxy {
                proxy: addr.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(TransportError::from_reqwest)?;
        clients.insert(key, client.clone());
        Ok(client)
    }

    fn user_agent(&self) -> &str {
        match self.http.user_agent {
            Some(ref ua) => ua.as_str(),
            None => USER_AGENTS
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or(USER_AGENTS[0]),
        }
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str, route: &ProxyChoice) -> Result<RawResponse, TransportError> {
        let client = self.client_for(route)?;
        let response = client
            .get(url)
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .send()
            .map_err(TransportError::from_reqwest)?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| TransportError::Body(e.to_string()))?
            .to_vec();
        Ok(RawResponse { status, body })
    }
}

/// Record of one attempt, kept on the fetched page for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAttempt {
    pub url: String,
    pub proxy: Option<String>,
    pub status: Option<u16>,
    pub verdict: Verdict,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub attempts: Vec<FetchAttempt>,
    /// Proxy that served the final attempt (None for direct).
    pub proxy: Option<String>,
    /// Body was accepted although the last verdict was Blocked.
    pub lenient: bool,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Fetches URLs through the shared [ProxyPool] with retries. Cheap to share across
/// worker threads by reference.
pub struct FetchClient<'a> {
    transport: &'a dyn Transport,
    pool: &'a ProxyPool,
    sleeper: &'a dyn Sleeper,
    classifier: BlockClassifier,
    retry: RetrySettings,
}

impl<'a> FetchClient<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        pool: &'a ProxyPool,
        sleeper: &'a dyn Sleeper,
        settings: &Settings,
    ) -> Self {
        Self {
            transport,
            pool,
            sleeper,
            classifier: BlockClassifier::new(settings.detection.clone()),
            retry: settings.retry.clone(),
        }
    }

    pub fn pool(&self) -> &ProxyPool {
        self.pool
    }

    /// Fetch an HTML page, classifying the body for block pages.
    pub fn fetch(
        &self,
        url: &str,
        worker: WorkerId,
        token: &CancellationToken,
    ) -> Result<FetchedPage, FetchError> {
        self.run(url, worker, token, |r| self.classifier.classify(r.status, &r.body))
    }

    /// Fetch a binary resource (cover image); classification by status only.
    pub fn fetch_asset(
        &self,
        url: &str,
        worker: WorkerId,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        self.run(url, worker, token, |r| self.classifier.classify_status(r.status))
            .map(|page| page.body)
    }

    fn run<F>(
        &self,
        url: &str,
        worker: WorkerId,
        token: &CancellationToken,
        classify: F,
    ) -> Result<FetchedPage, FetchError>
    where
        F: Fn(&RawResponse) -> Verdict,
    {
        let mut machine = RetryMachine::new(&self.retry);
        let mut history: Vec<FetchAttempt> = Vec::new();
        let mut last_blocked_body: Option<Vec<u8>> = None;

        while let Some(attempt) = machine.begin_attempt() {
            if token.is_cancelled() {
                return Err(FetchError::Cancelled {
                    url: url.to_string(),
                });
            }
            let route = self
                .pool
                .acquire(worker)
                .map_err(|_| FetchError::ProxyExhausted {
                    url: url.to_string(),
                })?;

            let started = Instant::now();
            let result = self.transport.get(url, &route);
            let verdict = match &result {
                Ok(r) => classify(r),
                Err(e) => Verdict::NetworkError(e.to_string()),
            };
            let proxy = route.address().map(str::to_string);
            if let Some(ref addr) = proxy {
                self.pool.report_outcome(addr, verdict.outcome());
            }
            debug!(
                url,
                worker,
                attempt,
                proxy = proxy.as_deref().unwrap_or("direct"),
                status = result.as_ref().ok().map(|r| r.status),
                verdict = ?verdict,
                "fetch attempt"
            );
            history.push(FetchAttempt {
                url: url.to_string(),
                proxy: proxy.clone(),
                status: result.as_ref().ok().map(|r| r.status),
                verdict: verdict.clone(),
                elapsed: started.elapsed(),
            });
            let body = result.ok().map(|r| r.body);
            if matches!(verdict, Verdict::Blocked(_)) {
                // A blocked proxy is unlikely to recover for this URL; pick another.
                self.pool.release(worker);
                last_blocked_body = body.clone();
            }

            match machine.record(&verdict).clone() {
                AttemptState::Success { attempts } => {
                    if attempts > 1 {
                        info!(url, attempts, "fetched after retries");
                    }
                    return Ok(FetchedPage {
                        url: url.to_string(),
                        body: body.unwrap_or_default(),
                        attempts: history,
                        proxy,
                        lenient: false,
                    });
                }
                AttemptState::Backoff { delay, .. } => {
                    if !self.sleeper.sleep(delay, token) {
                        return Err(FetchError::Cancelled {
                            url: url.to_string(),
                        });
                    }
                }
                AttemptState::Blocked { attempts } => {
                    if self.retry.lenient_accept_on_block {
                        if let Some(body) = last_blocked_body {
                            warn!(url, attempts, "accepting blocked response (lenient mode)");
                            return Ok(FetchedPage {
                                url: url.to_string(),
                                body,
                                attempts: history,
                                proxy,
                                lenient: true,
                            });
                        }
                    }
                    warn!(url, attempts, "blocked");
                    return Err(FetchError::Blocked {
                        url: url.to_string(),
                        attempts,
                    });
                }
                AttemptState::Failed { attempts } => {
                    let last = match verdict {
                        Verdict::NetworkError(msg) => msg,
                        other => format!("{:?}", other),
                    };
                    warn!(url, attempts, error = %last, "fetch failed");
                    return Err(FetchError::Network {
                        url: url.to_string(),
                        attempts,
                        last,
                    });
                }
                AttemptState::Idle | AttemptState::Attempting { .. } => break,
            }
        }
        Err(FetchError::Network {
            url: url.to_string(),
            attempts: history.len() as u32,
            last: "attempt budget ended without a verdict".to_string(),
        })
    }
}
