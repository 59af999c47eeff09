//! Per-provider circuit breaker shared by every worker.
//!
//! All transitions are compare-and-swap on atomics, so two workers racing to trip
//! the same breaker produce exactly one `Closed -> Open` transition.

use std::{
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(
        default = "default_failure_window",
        with = "crate::config::duration_str"
    )]
    pub failure_window: Duration,
    #[serde(default = "default_cooldown", with = "crate::config::duration_str")]
    pub cooldown: Duration,
    #[serde(
        default = "default_quota_cooldown",
        with = "crate::config::duration_str"
    )]
    pub quota_cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window: default_failure_window(),
            cooldown: default_cooldown(),
            quota_cooldown: default_quota_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> Duration {
    Duration::from_secs(60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_quota_cooldown() -> Duration {
    Duration::from_secs(300)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Whether a call may be issued right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single trial call after a cool-down.
    Trial,
    Rejected,
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left until an open circuit admits a trial call.
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    failure_window: Duration,
    cooldown: Duration,
    quota_cooldown: Duration,
    epoch: Instant,
    state: AtomicU8,
    failures: AtomicU32,
    window_start_ms: AtomicU64,
    open_until_ms: AtomicU64,
    trial_in_flight: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            failure_window: config.failure_window,
            cooldown: config.cooldown,
            quota_cooldown: config.quota_cooldown,
            epoch: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failures: AtomicU32::new(0),
            window_start_ms: AtomicU64::new(0),
            open_until_ms: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
        }
    }

    /// Observed state. An open circuit whose cool-down has elapsed reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        match self.raw_state() {
            CircuitState::Open if self.cooldown_elapsed() => CircuitState::HalfOpen,
            state => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let retry_in_ms = match self.raw_state() {
            CircuitState::Open => Some(
                self.open_until_ms
                    .load(Ordering::Acquire)
                    .saturating_sub(self.now_ms()),
            ),
            _ => None,
        };
        CircuitSnapshot {
            state,
            consecutive_failures: self.consecutive_failures(),
            retry_in_ms,
        }
    }

    /// Decide whether to route a call to this provider.
    pub fn try_acquire(&self) -> Admission {
        loop {
            match self.raw_state() {
                CircuitState::Closed => return Admission::Allowed,
                CircuitState::Open => {
                    if !self.cooldown_elapsed() {
                        return Admission::Rejected;
                    }
                    if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        info!(provider = %self.name, "circuit half-open; admitting trial call");
                        self.trial_in_flight.store(true, Ordering::Release);
                        return Admission::Trial;
                    }
                }
                CircuitState::HalfOpen => {
                    return if self
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        Admission::Trial
                    } else {
                        Admission::Rejected
                    };
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
            info!(provider = %self.name, "circuit closed after successful trial call");
        }
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Count a timeout or unavailability.
    pub fn record_failure(&self) {
        match self.raw_state() {
            CircuitState::HalfOpen => {
                self.trip(CircuitState::HalfOpen, self.cooldown, "trial call failed");
                self.trial_in_flight.store(false, Ordering::Release);
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let now = self.now_ms();
                let window = self.failure_window.as_millis() as u64;
                let current = self.failures.load(Ordering::Acquire);
                let start = self.window_start_ms.load(Ordering::Acquire);
                let expired = current == 0 || now.saturating_sub(start) > window;
                let count = if expired
                    && self
                        .window_start_ms
                        .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.failures.store(1, Ordering::Release);
                    1
                } else {
                    self.failures.fetch_add(1, Ordering::AcqRel) + 1
                };
                if count >= self.failure_threshold {
                    self.trip(
                        CircuitState::Closed,
                        self.cooldown,
                        "failure threshold reached",
                    );
                }
            }
        }
    }

    /// Quota exhaustion opens the circuit immediately for the quota cool-down.
    pub fn record_quota_exceeded(&self) {
        let until = self.now_ms() + self.quota_cooldown.as_millis() as u64;
        self.open_until_ms.fetch_max(until, Ordering::AcqRel);
        loop {
            let current = self.raw_state();
            if current == CircuitState::Open {
                break;
            }
            if self.transition(current, CircuitState::Open) {
                warn!(
                    provider = %self.name,
                    cooldown = %humantime::format_duration(self.quota_cooldown),
                    "circuit opened: quota exceeded"
                );
                break;
            }
        }
        self.failures.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Release a trial call whose outcome says nothing about provider health.
    pub fn record_neutral(&self) {
        if self.raw_state() == CircuitState::HalfOpen {
            self.trial_in_flight.store(false, Ordering::Release);
        }
    }

    fn trip(&self, from: CircuitState, cooldown: Duration, reason: &str) {
        // open_until must be visible before the state flips; a losing trip may only extend it.
        let until = self.now_ms() + cooldown.as_millis() as u64;
        self.open_until_ms.fetch_max(until, Ordering::AcqRel);
        if self.transition(from, CircuitState::Open) {
            self.failures.store(0, Ordering::Release);
            warn!(
                provider = %self.name,
                cooldown = %humantime::format_duration(cooldown),
                reason,
                "circuit opened"
            );
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let (from, to) = (from.as_u8(), to.as_u8());
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn raw_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cooldown_elapsed(&self) -> bool {
        self.now_ms() >= self.open_until_ms.load(Ordering::Acquire)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
