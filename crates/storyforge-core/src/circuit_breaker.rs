//! Circuit breaker in front of the generation backend.
//!
//! Only transient backend failures (timeouts, rate limits, outages) count
//! toward opening the circuit; a rejected prompt says nothing about backend
//! health. After the cooldown a single probe call is admitted, and its result
//! decides whether the circuit closes or re-opens. Shared across every
//! project's batches as `Arc<Mutex<CircuitBreaker>>`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::GenerationConfig;
use crate::generation::BackendErrorKind;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures before the circuit opens.
    pub failure_threshold: u32,
    pub open_cooldown: Duration,
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn new(failure_threshold: u32, open_cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_cooldown,
        }
    }

    #[must_use]
    pub fn generation(config: &GenerationConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            Duration::from_millis(config.circuit_cooldown_ms),
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    /// Cooldown elapsed; `probing` while the single probe call is out.
    HalfOpen { probing: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot reported through `StoryEngine::stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub open_cooldown_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<BackendErrorKind>,
    /// Times the circuit has opened since the engine started.
    pub trips: u32,
}

/// What a finished backend call tells the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure(BackendErrorKind),
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    phase: Phase,
    consecutive_failures: u32,
    last_failure: Option<BackendErrorKind>,
    trips: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(backend: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.into(),
            config,
            phase: Phase::Closed,
            consecutive_failures: 0,
            last_failure: None,
            trips: 0,
        }
    }

    /// Ask to issue one backend call. While half-open only the first caller
    /// gets through; it must later `record` or `abandon`.
    pub fn allow(&mut self) -> bool {
        match self.phase {
            Phase::Closed => true,
            Phase::Open { since } if since.elapsed() >= self.config.open_cooldown => {
                self.phase = Phase::HalfOpen { probing: true };
                info!(backend = %self.backend, "Circuit half-open; sending probe");
                true
            }
            Phase::Open { .. } => false,
            Phase::HalfOpen { probing: false } => {
                self.phase = Phase::HalfOpen { probing: true };
                true
            }
            Phase::HalfOpen { probing: true } => false,
        }
    }

    /// An admitted call was never issued (cancelled while queued).
    pub fn abandon(&mut self) {
        if let Phase::HalfOpen { probing: true } = self.phase {
            self.phase = Phase::HalfOpen { probing: false };
        }
    }

    pub fn record(&mut self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => self.on_success(),
            CallOutcome::Failure(kind) if kind.is_transient() => self.on_failure(kind),
            // a permanent error still proves the backend answered
            CallOutcome::Failure(_) => self.on_success(),
        }
    }

    fn on_success(&mut self) {
        self.consecutive_failures = 0;
        match self.phase {
            Phase::HalfOpen { .. } => {
                self.phase = Phase::Closed;
                info!(backend = %self.backend, "Circuit closed after successful probe");
            }
            // slots already in flight when the circuit opened may still succeed
            Phase::Open { .. } | Phase::Closed => {}
        }
    }

    fn on_failure(&mut self, kind: BackendErrorKind) {
        self.last_failure = Some(kind);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.phase {
            Phase::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.trip();
                warn!(
                    backend = %self.backend,
                    failures = self.consecutive_failures,
                    last_error = %kind,
                    "Circuit opened after consecutive backend failures"
                );
            }
            Phase::HalfOpen { .. } => {
                self.trip();
                warn!(backend = %self.backend, last_error = %kind, "Probe failed; circuit re-opened");
            }
            Phase::Closed | Phase::Open { .. } => {}
        }
    }

    fn trip(&mut self) {
        self.phase = Phase::Open {
            since: Instant::now(),
        };
        self.trips = self.trips.saturating_add(1);
    }

    /// Milliseconds until an open circuit admits a probe; zero otherwise.
    #[must_use]
    pub fn retry_after_ms(&self) -> u64 {
        self.status().cooldown_remaining_ms.unwrap_or(0)
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let (state, cooldown_remaining_ms) = match self.phase {
            Phase::Closed => (CircuitStateKind::Closed, None),
            Phase::Open { since } => (
                CircuitStateKind::Open,
                Some(
                    self.config
                        .open_cooldown
                        .saturating_sub(since.elapsed())
                        .as_millis() as u64,
                ),
            ),
            Phase::HalfOpen { .. } => (CircuitStateKind::HalfOpen, None),
        };
        CircuitBreakerStatus {
            state,
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            open_cooldown_ms: self.config.open_cooldown.as_millis() as u64,
            cooldown_remaining_ms,
            last_failure: self.last_failure,
            trips: self.trips,
        }
    }
}
