//! Proxy-aware, retrying fetch layer.

pub mod classify;
pub mod client;
pub mod error;
pub mod proxy;
pub mod retry;

pub use classify::{BlockClassifier, BlockReason, Verdict};
pub use client::{FetchAttempt, FetchClient, FetchedPage, RawResponse, ReqwestTransport, Transport};
pub use error::{FetchError, FetchErrorKind, ProxyExhausted, TransportError};
pub use proxy::{Outcome, ProxyChoice, ProxyPool, ProxyRecord, WorkerId};
pub use retry::{AttemptState, Backoff, RecordingSleeper, RetryMachine, Sleeper, ThreadSleeper};

/// In-memory transport for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::{ProxyChoice, RawResponse, Transport, TransportError};
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    type Scripted = Result<RawResponse, TransportError>;

    /// Serves scripted responses per URL. The last scripted response for a URL repeats;
    /// unknown URLs get a 404.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<(String, ProxyChoice)>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        fn push(self, url: &str, r: Scripted) -> Self {
            self.routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(url.to_string())
                .or_default()
                .push_back(r);
            self
        }

        pub fn page(self, url: &str, status: u16, body: &[u8]) -> Self {
            self.push(
                url,
                Ok(RawResponse {
                    status,
                    body: body.to_vec(),
                }),
            )
        }

        pub fn error(self, url: &str, e: TransportError) -> Self {
            self.push(url, Err(e))
        }

        /// Hold every response for `url` this long before returning it.
        pub fn delay(mut self, url: &str, d: Duration) -> Self {
            self.delays.insert(url.to_string(), d);
            self
        }

        pub fn calls(&self) -> Vec<(String, ProxyChoice)> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn calls_to(&self, url: &str) -> usize {
            self.calls().iter().filter(|(u, _)| u == url).count()
        }
    }

    impl Transport for ScriptedTransport {
        fn get(&self, url: &str, route: &ProxyChoice) -> Result<RawResponse, TransportError> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((url.to_string(), route.clone()));
            if let Some(d) = self.delays.get(url) {
                std::thread::sleep(*d);
            }
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            match routes.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(not_found),
                Some(queue) => queue.front().cloned().unwrap_or_else(not_found),
                None => not_found(),
            }
        }
    }

    fn not_found() -> Scripted {
        Ok(RawResponse {
            status: 404,
            body: Vec::new(),
        })
    }

    /// A chapter page in the layout the HTML parser understands, padded past the
    /// tiny-content threshold outside the content container.
    pub fn html_page(title: &str, text: &str) -> Vec<u8> {
        format!(
            r#"<html><head><title>{title}</title></head><body>
<div class="m-read"><span class="chapter">{title}</span><p>{text}</p></div>
<footer><p>{pad}</p></footer>
</body></html>"#,
            title = title,
            text = text,
            pad = "Thanks for reading along with us. ".repeat(8)
        )
        .into_bytes()
    }
}
