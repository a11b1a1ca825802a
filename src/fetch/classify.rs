//! Response classification: genuine content, anti-bot block page, or network failure.
//!
//! Checks run in a fixed order and the first decisive one wins:
//! transport error, status code, block-signal scan, tiny-content check, then the two
//! override rules (adaptive accept and metadata accept) that can turn a heuristic
//! block back into a success. Status-code blocks are never overridden.

use crate::config::DetectionSettings;
use tracing::debug;

use super::proxy::Outcome;

/// Statuses that mean the server refused us rather than failed.
const BLOCK_STATUSES: [u16; 3] = [401, 403, 429];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Status(u16),
    /// Block-page signatures found in the leading part of the body.
    Signals { hits: usize },
    /// Body too small to be a chapter and containing no expected keyword.
    TinyContent { bytes: usize },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Status(s) => write!(f, "status {}", s),
            BlockReason::Signals { hits } => write!(f, "{} block signal(s)", hits),
            BlockReason::TinyContent { bytes } => write!(f, "tiny content ({} bytes)", bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Blocked(BlockReason),
    NetworkError(String),
}

impl Verdict {
    pub fn outcome(&self) -> Outcome {
        match self {
            Verdict::Success => Outcome::Success,
            Verdict::Blocked(_) => Outcome::Blocked,
            Verdict::NetworkError(_) => Outcome::NetworkError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }
}

#[derive(Debug, Clone)]
pub struct BlockClassifier {
    settings: DetectionSettings,
}

impl BlockClassifier {
    pub fn new(settings: DetectionSettings) -> Self {
        Self { settings }
    }

    /// Status-only classification, used for binary assets.
    pub fn classify_status(&self, status: u16) -> Verdict {
        if (200..300).contains(&status) {
            Verdict::Success
        } else if self.settings.enabled && BLOCK_STATUSES.contains(&status) {
            Verdict::Blocked(BlockReason::Status(status))
        } else {
            Verdict::NetworkError(format!("HTTP {}", status))
        }
    }

    pub fn classify(&self, status: u16, body: &[u8]) -> Verdict {
        let by_status = self.classify_status(status);
        if !by_status.is_success() || !self.settings.enabled {
            return by_status;
        }

        let text = String::from_utf8_lossy(body).to_lowercase();
        let head: String = text.chars().take(self.settings.scan_chars).collect();
        let signal_hits = self
            .settings
            .block_signals
            .iter()
            .filter(|s| head.contains(s.as_str()))
            .count();
        let keyword_hits = self
            .settings
            .expected_keywords
            .iter()
            .filter(|k| text.contains(k.as_str()))
            .count();

        let reason = if signal_hits > 0 && signal_hits >= self.settings.min_block_signal_hits {
            BlockReason::Signals { hits: signal_hits }
        } else if body.len() < self.settings.min_content_bytes && keyword_hits == 0 {
            BlockReason::TinyContent { bytes: body.len() }
        } else {
            return Verdict::Success;
        };

        if self.settings.adaptive_accept
            && body.len() >= self.settings.adaptive_min_content_bytes
            && keyword_hits >= 1
        {
            debug!(%reason, bytes = body.len(), keyword_hits, "adaptive accept overrides block");
            return Verdict::Success;
        }
        if self.settings.accept_if_metadata_present && has_metadata(&text) {
            debug!(%reason, "page metadata present, accepting");
            return Verdict::Success;
        }
        Verdict::Blocked(reason)
    }
}

/// Open Graph tags or JSON-LD: block pages rarely carry either.
fn has_metadata(lower_html: &str) -> bool {
    lower_html.contains("property=\"og:")
        || lower_html.contains("property='og:")
        || lower_html.contains("application/ld+json")
}
