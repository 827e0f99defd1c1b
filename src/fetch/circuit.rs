//! Per-backend circuit breaking.
//!
//! After `failure_threshold` consecutive failures a backend is skipped for
//! `cooldown`. The first call after the cooldown is a probe: success closes
//! the circuit, another failure reopens it for a full cooldown. Other callers
//! keep skipping the backend while the probe is outstanding.

use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while a half-open probe is in flight. A probe that never reports
    /// back (cancelled call) expires after one cooldown.
    probe_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }

    /// False while the circuit is open. In half-open only the caller that
    /// claims the probe gets through.
    pub fn allows_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.opened_at {
            None => true,
            Some(at) if at.elapsed() < self.cooldown => false,
            Some(_) => match inner.probe_started {
                Some(started) if started.elapsed() < self.cooldown => false,
                _ => {
                    inner.probe_started = Some(Instant::now());
                    true
                },
            },
        }
    }

    /// Give back a probe whose outcome says nothing about backend health.
    pub fn release_probe(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.probe_started = None;
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;
        inner.probe_started = None;

        if inner.consecutive_failures >= self.failure_threshold {
            warn!(
                "[Circuit] {} opened after {} consecutive failures, pausing {:?}",
                self.name, inner.consecutive_failures, self.cooldown
            );
            inner.opened_at = Some(Instant::now());
        }
    }
}
