//! Cooperative stop/cancel signal shared by every worker of a job.
//!
//! The token only moves forward: `Running -> StopRequested -> CancelRequested`, or
//! straight from `Running` to `CancelRequested`. A stop request after a cancel is a no-op.
//! Workers poll it at task boundaries and at retry boundaries; nothing interrupts a
//! socket operation that is already in progress.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

const RUNNING: u8 = 0;
const STOP_REQUESTED: u8 = 1;
const CANCEL_REQUESTED: u8 = 2;

/// Observable state of a [CancellationToken].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    Running,
    /// Finish in-flight chapters, schedule nothing new, return partial results.
    StopRequested,
    /// Abandon the job as soon as each worker reaches a checkpoint.
    CancelRequested,
}

#[derive(Debug, Default)]
pub struct CancellationToken {
    state: AtomicU8,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
        }
    }

    /// Request a graceful stop. Returns true if this call changed the state.
    pub fn request_stop(&self) -> bool {
        self.advance_to(STOP_REQUESTED)
    }

    /// Request cancellation. Returns true if this call changed the state.
    pub fn request_cancel(&self) -> bool {
        self.advance_to(CANCEL_REQUESTED)
    }

    pub fn state(&self) -> CancelState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => CancelState::Running,
            STOP_REQUESTED => CancelState::StopRequested,
            _ => CancelState::CancelRequested,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == CancelState::CancelRequested
    }

    /// True once either stop or cancel has been requested; no new work should start.
    pub fn should_halt(&self) -> bool {
        self.state() != CancelState::Running
    }

    fn advance_to(&self, target: u8) -> bool {
        // fetch_max keeps transitions monotonic under concurrent callers.
        self.state.fetch_max(target, Ordering::AcqRel) < target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_running() {
        let token = CancellationToken::new();
        assert_eq!(token.state(), CancelState::Running);
        assert!(!token.should_halt());
        assert!(!token.is_cancelled());
    }

    #[test]
    fn stop_then_cancel_advances() {
        let token = CancellationToken::new();
        assert!(token.request_stop());
        assert_eq!(token.state(), CancelState::StopRequested);
        assert!(token.should_halt());
        assert!(!token.is_cancelled());
        assert!(token.request_cancel());
        assert_eq!(token.state(), CancelState::CancelRequested);
    }

    #[test]
    fn stop_after_cancel_does_not_revert() {
        let token = CancellationToken::new();
        token.request_cancel();
        assert!(!token.request_stop());
        assert_eq!(token.state(), CancelState::CancelRequested);
    }

    #[test]
    fn repeated_requests_report_no_change() {
        let token = CancellationToken::new();
        assert!(token.request_stop());
        assert!(!token.request_stop());
    }

    #[test]
    fn concurrent_requests_settle_on_cancel() {
        let token = Arc::new(CancellationToken::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let token = Arc::clone(&token);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        token.request_stop();
                    } else {
                        token.request_cancel();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(token.state(), CancelState::CancelRequested);
    }
}
