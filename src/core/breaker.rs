//! Circuit breaker state machine.
//!
//! One breaker guards one `(service, api)` compartment. Completions feed a
//! sliding window of the last `request_volume` outcomes; when the window is
//! full and the failure share reaches `error_threshold_percent` the breaker
//! opens and sheds load until `sleep_window_ms` elapses, after which a single
//! trial call probes the upstream.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::config::models::CircuitConfig;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed circuit.
    Admit,
    /// The single half-open probe; its outcome decides the next state.
    AdmitTrial,
    /// Shed immediately; hint how long until the next trial.
    Reject { retry_after_ms: u64 },
}

struct BreakerInner {
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    state: CircuitState,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
    // Mirror of inner.state for lock-free reads on the status paths.
    state_tag: AtomicU8,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                state: CircuitState::Closed,
            }),
            state_tag: AtomicU8::new(STATE_CLOSED),
        }
    }

    pub fn current_state(&self) -> CircuitState {
        match self.state_tag.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.config.sleep_window_ms)
    }

    /// Decide whether a call may proceed. An open circuit whose sleep window
    /// has elapsed flips to half-open here and admits exactly one trial.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Admit,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.sleep_window() {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    self.state_tag.store(STATE_HALF_OPEN, Ordering::Release);
                    Admission::AdmitTrial
                } else {
                    let remaining = self.sleep_window() - elapsed;
                    Admission::Reject {
                        retry_after_ms: remaining.as_millis() as u64,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Reject {
                        retry_after_ms: self.config.sleep_window_ms,
                    }
                } else {
                    inner.trial_in_flight = true;
                    Admission::AdmitTrial
                }
            }
        }
    }

    /// Feed one completion back. `trial` must be true iff the call was
    /// admitted via [`Admission::AdmitTrial`].
    pub fn record(&self, success: bool, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            if success {
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                self.state_tag.store(STATE_CLOSED, Ordering::Release);
            } else {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                self.state_tag.store(STATE_OPEN, Ordering::Release);
            }
            return;
        }

        // Stragglers finishing after a trip do not disturb the open window.
        if inner.state != CircuitState::Closed {
            return;
        }

        if inner.window.len() == self.config.request_volume {
            inner.window.pop_front();
        }
        inner.window.push_back(success);

        if inner.window.len() >= self.config.request_volume {
            let failures = inner.window.iter().filter(|ok| !**ok).count();
            let failure_pct = failures * 100 / inner.window.len();
            if failure_pct >= self.config.error_threshold_percent as usize {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.window.clear();
                self.state_tag.store(STATE_OPEN, Ordering::Release);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker lock would mean a panic inside the tiny critical
        // sections above; recover the guard rather than wedging the compartment.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
