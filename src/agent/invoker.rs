//! Agent invoker: bounded retries with backoff and a persistent failure count
//!
//! The consecutive-failure counter survives across escalations (and
//! restarts, via the state manager). An escalation ends in `Exhausted` as
//! soon as the counter reaches `max_retries`, so a freshly reset invoker gets
//! `max_retries` attempts while one resumed with a partial count only gets
//! the remainder. Once exhausted, each later escalation still makes one
//! probing attempt so the loop can leave degraded mode when the agent
//! recovers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::{AgentRequest, AgentResponse, StrategyAgent};
use crate::audit::{AuditEvent, AuditRecord, AuditSink};
use crate::config::AgentSettings;
use crate::error::{AgentError, InvokeError};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Vec<Duration>,
    timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        RetryPolicy {
            max_retries: settings.max_retries.max(1),
            backoff: settings.backoff(),
            timeout: settings.timeout(),
        }
    }

    /// Set maximum attempts per escalation
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Set delays between attempts; the last one repeats
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set per-attempt deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

/// Persistent failure bookkeeping, owned by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from persisted values
    pub fn resume(consecutive_failures: u32, last_success: Option<DateTime<Utc>>) -> Self {
        RetryState {
            consecutive_failures,
            last_success,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.consecutive_failures >= policy.max_retries
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success = Some(at);
    }
}

/// Successful invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeSuccess {
    pub response: AgentResponse,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AgentInvoker {
    policy: RetryPolicy,
}

impl AgentInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        AgentInvoker { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call the agent, retrying retriable failures.
    ///
    /// Every attempt is appended to `audit`. Retriable errors never escape:
    /// they either end in a later success or in `InvokeError::Exhausted`.
    /// Non-retriable errors return after that single attempt and leave the
    /// failure counter untouched.
    pub async fn invoke(
        &self,
        agent: &dyn StrategyAgent,
        request: &AgentRequest,
        state: &mut RetryState,
        audit: &dyn AuditSink,
    ) -> Result<InvokeSuccess, InvokeError> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let started = Instant::now();
            let result = match timeout(self.policy.timeout, agent.invoke(request)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout(self.policy.timeout)),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(response) => {
                    state.record_success(Utc::now());
                    append(
                        audit,
                        AuditEvent::AgentAttempt {
                            attempt: attempts,
                            success: true,
                            error: None,
                            latency_ms,
                            usage: response.usage,
                        },
                    );
                    debug!("Agent responded on attempt {} in {}ms", attempts, latency_ms);
                    return Ok(InvokeSuccess { response, attempts });
                }
                Err(e) => {
                    append(
                        audit,
                        AuditEvent::AgentAttempt {
                            attempt: attempts,
                            success: false,
                            error: Some(e.to_string()),
                            latency_ms,
                            usage: None,
                        },
                    );

                    if !e.is_retriable() {
                        return Err(InvokeError::NonRetriable(e));
                    }

                    state.record_failure();
                    warn!(
                        "Agent request failed (attempt {}, {}/{} consecutive): {}",
                        attempts,
                        state.consecutive_failures,
                        self.policy.max_retries,
                        e
                    );

                    if state.is_exhausted(&self.policy) {
                        return Err(InvokeError::Exhausted {
                            attempts,
                            consecutive_failures: state.consecutive_failures,
                        });
                    }

                    let delay = self.policy.delay_after(attempts);
                    debug!("Retrying agent after {}ms", delay.as_millis());
                    sleep(delay).await;
                }
            }
        }
    }
}

fn append(audit: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = audit.append(&AuditRecord::now(event)) {
        warn!("Failed to audit agent attempt: {}", e);
    }
}
