//! Retry manager with jittered exponential back-off and escalation.
//!
//! Any transient operation in the loop runs under this manager. Errors
//! whose code is non-retryable fail immediately; retryable errors back off
//! exponentially until the attempt bound, at which point the escalation
//! handler receives the full error history and the caller gets
//! `Error::Escalated`. This is the only component that surfaces a thrown
//! error for control flow; the loop composer catches it in one place.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use va_domain::config::RetryConfig;
use va_domain::error::{Error, ErrorCode, Result};
use va_domain::trace::TraceEvent;

use crate::cancel::CancelToken;

/// Completed operations kept for diagnostics.
const COMPLETED_RING: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Add 0–25 % jitter to each delay.
    pub jitter: bool,
    pub max_attempts: u32,
    /// Error codes that fail immediately regardless of attempts left.
    pub non_retryable: HashSet<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
            max_attempts: 3,
            non_retryable: default_non_retryable(),
        }
    }
}

fn default_non_retryable() -> HashSet<ErrorCode> {
    [
        ErrorCode::ScopeViolation,
        ErrorCode::AuthenticationFailed,
        ErrorCode::InvalidInput,
    ]
    .into_iter()
    .collect()
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            max_attempts: config.max_attempts,
            non_retryable: default_non_retryable(),
        }
    }

    /// Quick policy for call sites with their own attempt/delay contract.
    pub fn with_attempts(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Default::default()
        }
    }

    /// Delay before the given retry (attempt is 1-indexed; the delay runs
    /// after attempt `n` fails).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        if !self.jitter {
            return Duration::from_millis(capped_ms as u64);
        }
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    fn is_retryable(&self, code: ErrorCode) -> bool {
        !self.non_retryable.contains(&code) && code.is_retryable()
    }
}

/// Cheap deterministic "random" fraction [0, 1) from the attempt number.
/// Not cryptographic, just enough to spread retry storms.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry state & stats
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RetryState {
    pub operation_id: String,
    pub attempt: u32,
    pub errors: Vec<String>,
    pub succeeded: bool,
    pub escalated: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub total_retries: u64,
    pub escalations: u64,
    pub successes: u64,
    pub failures: u64,
}

type EscalationHandler = Arc<dyn Fn(&RetryState) + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RetryManager {
    policy: RetryPolicy,
    active: Mutex<HashMap<String, RetryState>>,
    completed: Mutex<VecDeque<RetryState>>,
    escalation: RwLock<Option<EscalationHandler>>,
    total_retries: AtomicU64,
    escalations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            escalation: RwLock::new(None),
            total_retries: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Install the handler invoked with the full error history when an
    /// operation exhausts its attempts.
    pub fn set_escalation_handler(&self, handler: impl Fn(&RetryState) + Send + Sync + 'static) {
        *self.escalation.write() = Some(Arc::new(handler));
    }

    /// Run `op` under the manager's default policy.
    pub async fn run<T, F, Fut>(&self, operation_id: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = self.policy.clone();
        self.run_with_policy(operation_id, &policy, None, op).await
    }

    /// Run `op` under an explicit policy, optionally abort-aware: the
    /// cancel token is checked inside every back-off sleep.
    pub async fn run_with_policy<T, F, Fut>(
        &self,
        operation_id: &str,
        policy: &RetryPolicy,
        cancel: Option<&CancelToken>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState {
            operation_id: operation_id.to_owned(),
            attempt: 0,
            errors: Vec::new(),
            succeeded: false,
            escalated: false,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.active
            .lock()
            .insert(operation_id.to_owned(), state.clone());

        let max_attempts = policy.max_attempts.max(1);
        loop {
            state.attempt += 1;
            if let Some(active) = self.active.lock().get_mut(operation_id) {
                active.attempt = state.attempt;
            }

            match op().await {
                Ok(value) => {
                    state.succeeded = true;
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    self.finish(state);
                    return Ok(value);
                }
                Err(error) => {
                    let code = error.code();
                    state.errors.push(format!("{code}: {error}"));
                    tracing::debug!(
                        operation_id,
                        attempt = state.attempt,
                        code = %code,
                        error = %error,
                        "operation attempt failed"
                    );

                    if !policy.is_retryable(code) {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        self.finish(state);
                        return Err(error);
                    }

                    if state.attempt >= max_attempts {
                        state.escalated = true;
                        self.escalations.fetch_add(1, Ordering::Relaxed);
                        self.failures.fetch_add(1, Ordering::Relaxed);

                        TraceEvent::RetryEscalated {
                            operation_id: operation_id.to_owned(),
                            attempts: state.attempt,
                        }
                        .emit();
                        if let Some(handler) = self.escalation.read().clone() {
                            handler(&state);
                        }

                        let escalated = Error::Escalated {
                            operation_id: operation_id.to_owned(),
                            attempts: state.attempt,
                            last_error: error.to_string(),
                        };
                        self.finish(state);
                        return Err(escalated);
                    }

                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(policy.delay_for_attempt(state.attempt)).await;
                    if cancel.is_some_and(|c| c.is_cancelled()) {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        self.finish(state);
                        return Err(Error::Aborted);
                    }
                }
            }
        }
    }

    fn finish(&self, mut state: RetryState) {
        state.ended_at = Some(Utc::now());
        self.active.lock().remove(&state.operation_id);
        let mut completed = self.completed.lock();
        completed.push_back(state);
        while completed.len() > COMPLETED_RING {
            completed.pop_front();
        }
    }

    pub fn active_operations(&self) -> Vec<RetryState> {
        self.active.lock().values().cloned().collect()
    }

    pub fn completed_operations(&self) -> Vec<RetryState> {
        self.completed.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_retries: self.total_retries.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
