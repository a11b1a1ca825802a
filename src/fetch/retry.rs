//! Backoff schedule and the per-URL attempt state machine.
//!
//! [RetryMachine] is pure: it never sleeps or reads the clock. The fetch loop asks it
//! what to do next and performs the sleep through a [Sleeper], so tests can drive the
//! whole schedule without waiting.

use crate::cancel::CancellationToken;
use crate::config::RetrySettings;
use rand::Rng;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::classify::Verdict;

/// Sleeps are cut into slices this long so a cancel request is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);
const JITTER_LOW: f64 = 0.75;
const JITTER_HIGH: f64 = 1.25;

/// Exponential backoff: attempt k waits `min(base * 2^(k-1), cap)`, optionally jittered.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self { base, cap, jitter }
    }

    pub fn from_settings(s: &RetrySettings) -> Self {
        Self::new(s.base, s.max_backoff, s.jitter)
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempt);
        if !self.jitter {
            return nominal;
        }
        nominal.mul_f64(rng.gen_range(JITTER_LOW..JITTER_HIGH))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptState {
    Idle,
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Success { attempts: u32 },
    /// Terminal: the last attempt was classified as blocked.
    Blocked { attempts: u32 },
    /// Terminal: the last attempt failed at the network level.
    Failed { attempts: u32 },
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Success { .. } | AttemptState::Blocked { .. } | AttemptState::Failed { .. }
        )
    }
}

/// Drives one logical fetch through its attempt budget.
#[derive(Debug, Clone)]
pub struct RetryMachine {
    state: AttemptState,
    max_attempts: u32,
    short_circuit_on_block: bool,
    backoff: Backoff,
}

impl RetryMachine {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            state: AttemptState::Idle,
            max_attempts: settings.max_attempts.max(1),
            short_circuit_on_block: settings.short_circuit_on_block,
            backoff: Backoff::from_settings(settings),
        }
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    /// Move to the next attempt and return its 1-based number, or None if the machine
    /// is terminal. Valid from Idle and Backoff.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        let next = match self.state {
            AttemptState::Idle => 1,
            AttemptState::Backoff { attempt, .. } => attempt + 1,
            AttemptState::Attempting { attempt } => attempt,
            _ => return None,
        };
        self.state = AttemptState::Attempting { attempt: next };
        Some(next)
    }

    /// Feed the verdict of the current attempt.
    pub fn record(&mut self, verdict: &Verdict) -> &AttemptState {
        let attempt = match self.state {
            AttemptState::Attempting { attempt } => attempt,
            _ => return &self.state,
        };
        let exhausted = attempt >= self.max_attempts;
        self.state = match verdict {
            Verdict::Success => AttemptState::Success { attempts: attempt },
            Verdict::Blocked(_) if self.short_circuit_on_block || exhausted => {
                AttemptState::Blocked { attempts: attempt }
            }
            Verdict::NetworkError(_) if exhausted => AttemptState::Failed { attempts: attempt },
            Verdict::Blocked(_) | Verdict::NetworkError(_) => AttemptState::Backoff {
                attempt,
                delay: self.backoff.delay(attempt),
            },
        };
        debug!(attempt, state = ?self.state, "attempt recorded");
        &self.state
    }
}

/// Injected sleep, so backoff never has to touch the wall clock in tests.
pub trait Sleeper: Send + Sync {
    /// Sleep for `dur`. Returns false if the token was cancelled before the time was up.
    fn sleep(&self, dur: Duration, token: &CancellationToken) -> bool;
}

/// Real sleeper: blocks the calling worker thread only, in short slices.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, dur: Duration, token: &CancellationToken) -> bool {
        let mut remaining = dur;
        while !remaining.is_zero() {
            if token.is_cancelled() {
                return false;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
        }
        !token.is_cancelled()
    }
}

/// Records requested sleeps and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, dur: Duration, token: &CancellationToken) -> bool {
        self.slept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dur);
        !token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::classify::BlockReason;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn settings(max_attempts: u32, short_circuit: bool) -> RetrySettings {
        RetrySettings {
            max_attempts,
            short_circuit_on_block: short_circuit,
            jitter: false,
            ..RetrySettings::default()
        }
    }

    fn blocked() -> Verdict {
        Verdict::Blocked(BlockReason::Status(403))
    }

    fn net() -> Verdict {
        Verdict::NetworkError("timeout".into())
    }

    #[test]
    fn nominal_schedule_doubles_then_caps() {
        let b = Backoff::new(Duration::from_millis(600), Duration::from_secs(4), false);
        let got: Vec<_> = (1..=6).map(|k| b.nominal(k)).collect();
        assert_eq!(
            got,
            vec![
                Duration::from_millis(600),
                Duration::from_millis(1200),
                Duration::from_millis(2400),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
        assert_eq!(b.nominal(200), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let b = Backoff::new(Duration::from_millis(600), Duration::from_secs(4), true);
        let mut rng = StdRng::seed_from_u64(7);
        for k in 1..=8 {
            let nominal = b.nominal(k).as_secs_f64();
            for _ in 0..50 {
                let d = b.delay_with(k, &mut rng).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-9 && d <= nominal * 1.25 + 1e-9);
            }
        }
    }

    #[test]
    fn success_on_first_attempt() {
        let mut m = RetryMachine::new(&settings(5, true));
        assert_eq!(m.state(), &AttemptState::Idle);
        assert_eq!(m.begin_attempt(), Some(1));
        assert_eq!(m.record(&Verdict::Success), &AttemptState::Success { attempts: 1 });
        assert_eq!(m.begin_attempt(), None);
    }

    #[test]
    fn short_circuit_stops_after_one_blocked_attempt() {
        let mut m = RetryMachine::new(&settings(5, true));
        m.begin_attempt();
        assert_eq!(m.record(&blocked()), &AttemptState::Blocked { attempts: 1 });
        assert!(m.state().is_terminal());
    }

    #[test]
    fn blocked_without_short_circuit_retries_to_budget() {
        let mut m = RetryMachine::new(&settings(3, false));
        for k in 1..=2 {
            assert_eq!(m.begin_attempt(), Some(k));
            assert!(matches!(m.record(&blocked()), AttemptState::Backoff { attempt, .. } if *attempt == k));
        }
        m.begin_attempt();
        assert_eq!(m.record(&blocked()), &AttemptState::Blocked { attempts: 3 });
    }

    #[test]
    fn network_errors_back_off_with_schedule() {
        let mut m = RetryMachine::new(&settings(4, true));
        let mut delays = Vec::new();
        loop {
            m.begin_attempt();
            match m.record(&net()).clone() {
                AttemptState::Backoff { delay, .. } => delays.push(delay),
                AttemptState::Failed { attempts } => {
                    assert_eq!(attempts, 4);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(600),
                Duration::from_millis(1200),
                Duration::from_millis(2400)
            ]
        );
    }

    #[test]
    fn terminal_kind_follows_last_verdict() {
        let mut m = RetryMachine::new(&settings(2, false));
        m.begin_attempt();
        m.record(&blocked());
        m.begin_attempt();
        assert_eq!(m.record(&net()), &AttemptState::Failed { attempts: 2 });
    }

    #[test]
    fn recording_sleeper_reports_cancel() {
        let s = RecordingSleeper::new();
        let token = CancellationToken::new();
        assert!(s.sleep(Duration::from_secs(1), &token));
        token.request_cancel();
        assert!(!s.sleep(Duration::from_secs(2), &token));
        assert_eq!(s.slept(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn thread_sleeper_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        token.request_cancel();
        let start = std::time::Instant::now();
        assert!(!ThreadSleeper.sleep(Duration::from_secs(5), &token));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn thread_sleeper_ignores_stop() {
        let token = CancellationToken::new();
        token.request_stop();
        assert!(ThreadSleeper.sleep(Duration::from_millis(10), &token));
    }
}
