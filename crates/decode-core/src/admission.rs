//! Request admission gates: a per-IP fixed window and a per-user in-flight cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::LimitsConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimited { limit: u32, window_secs: u64 },
    #[error("Too many concurrent requests: limit {limit} per user")]
    TooManyInflight { limit: usize },
    #[error("Too many jobs running: limit {limit}")]
    JobCeiling { limit: usize },
}

impl AdmissionError {
    /// Short label for the gate that rejected the request.
    pub fn gate(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => "rate",
            AdmissionError::TooManyInflight { .. } => "inflight",
            AdmissionError::JobCeiling { .. } => "jobs",
        }
    }

    /// Seconds a client should wait before retrying.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            AdmissionError::RateLimited { window_secs, .. } => *window_secs,
            AdmissionError::TooManyInflight { .. } | AdmissionError::JobCeiling { .. } => 1,
        }
    }

    pub(crate) fn record(&self) {
        metrics::counter!("decode_admission_rejected_total", "gate" => self.gate()).increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
struct WindowRecord {
    count: u32,
    window_start: Instant,
}

struct RateState {
    records: HashMap<String, WindowRecord>,
    last_sweep: Instant,
}

/// Fixed (count, window-start) limiter keyed by client address.
pub struct RateLimiter {
    window: Duration,
    default_limit: u32,
    expensive_limit: u32,
    expensive_prefixes: Vec<String>,
    sweep_interval: Duration,
    stale_after: Duration,
    state: Mutex<RateState>,
}

impl RateLimiter {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            window: cfg.window(),
            default_limit: cfg.default_limit,
            expensive_limit: cfg.expensive_limit,
            expensive_prefixes: cfg.expensive_prefixes.clone(),
            sweep_interval: cfg.sweep_interval(),
            stale_after: cfg.stale_after(),
            state: Mutex::new(RateState {
                records: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn limit_for(&self, path: &str) -> u32 {
        if self
            .expensive_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            self.expensive_limit
        } else {
            self.default_limit
        }
    }

    pub fn check(&self, ip: &str, path: &str) -> Result<(), AdmissionError> {
        self.check_at(ip, path, Instant::now())
    }

    /// Admit or reject one request from `ip` observed at `now`.
    pub fn check_at(&self, ip: &str, path: &str, now: Instant) -> Result<(), AdmissionError> {
        let limit = self.limit_for(path);
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.last_sweep) >= self.sweep_interval {
            self.sweep(&mut state, now);
        }

        let rejected = AdmissionError::RateLimited {
            limit,
            window_secs: self.window.as_secs(),
        };
        let outcome = if limit == 0 {
            Err(rejected)
        } else {
            let record = state
                .records
                .entry(ip.to_string())
                .or_insert(WindowRecord {
                    count: 0,
                    window_start: now,
                });
            if record.count == 0 || now.saturating_duration_since(record.window_start) > self.window {
                *record = WindowRecord {
                    count: 1,
                    window_start: now,
                };
                Ok(())
            } else if record.count < limit {
                record.count += 1;
                Ok(())
            } else {
                Err(rejected)
            }
        };
        drop(state);

        if let Err(err) = &outcome {
            debug!(target: "decode::admission", ip, path, limit, "rate limit exceeded");
            err.record();
        }
        outcome
    }

    fn sweep(&self, state: &mut RateState, now: Instant) {
        let before = state.records.len();
        let stale_after = self.stale_after;
        state
            .records
            .retain(|_, record| now.saturating_duration_since(record.window_start) <= stale_after);
        state.last_sweep = now;
        let dropped = before - state.records.len();
        if dropped > 0 {
            info!(target: "decode::admission", dropped, "swept stale rate-limit records");
        }
    }

    /// Number of client addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.state.lock().records.len()
    }
}

/// Per-user in-flight request counter.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    max: usize,
    counters: Arc<Mutex<HashMap<String, usize>>>,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn try_acquire(&self, user: &str) -> Result<InflightPermit, AdmissionError> {
        {
            let mut counters = self.counters.lock();
            if counters.get(user).copied().unwrap_or(0) < self.max {
                *counters.entry(user.to_string()).or_insert(0) += 1;
                return Ok(InflightPermit {
                    user: user.to_string(),
                    counters: self.counters.clone(),
                });
            }
        }
        let err = AdmissionError::TooManyInflight { limit: self.max };
        debug!(target: "decode::admission", user, limit = self.max, "per-user cap reached");
        err.record();
        Err(err)
    }

    pub fn inflight(&self, user: &str) -> usize {
        self.counters.lock().get(user).copied().unwrap_or(0)
    }
}

/// Releases one in-flight slot when dropped, including during unwinding.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct InflightPermit {
    user: String,
    counters: Arc<Mutex<HashMap<String, usize>>>,
}

impl InflightPermit {
    pub fn user(&self) -> &str {
        &self.user
    }
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        let mut counters = self.counters.lock();
        if let Some(count) = counters.get_mut(&self.user) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.remove(&self.user);
            }
        }
    }
}
