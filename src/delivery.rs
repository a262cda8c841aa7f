//! Invocation delivery: wall-clock budget, redelivery and dead-lettering.
//!
//! The scheduler in front of the pipeline redelivers failed invocations a
//! bounded number of times inside a window, then parks them for manual
//! inspection. [`Dispatcher`] applies the same policy around in-process
//! invocations so the binary behaves like the deployed trigger.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::store::NormalizedStore;

/// Wall-clock budget of one invocation attempt.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn unbounded() -> Self {
        Self::start(Duration::MAX)
    }

    /// Budget in whole milliseconds, saturating for unbounded deadlines.
    pub fn budget_ms(&self) -> u64 {
        u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Fail with a transient timeout once the budget is spent. Called between
    /// units of work so nothing is abandoned half-committed.
    pub fn check(&self, stage: &str) -> PipelineResult<()> {
        if self.started.elapsed() >= self.budget {
            return Err(PipelineError::Timeout {
                stage: stage.to_string(),
                budget_ms: self.budget_ms(),
            });
        }
        Ok(())
    }
}

/// An invocation parked after it could not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub handler: String,
    pub attempts: u32,
    pub reason: String,
    pub payload: serde_json::Value,
}

#[derive(Debug)]
pub enum Delivery<T> {
    Completed { value: T, attempts: u32 },
    /// Malformed input: logged and discarded.
    Dropped { reason: String },
    DeadLettered { letter_id: String, attempts: u32 },
}

impl<T> Delivery<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Delivery::Completed { .. })
    }
}

pub struct Dispatcher<'a> {
    store: &'a NormalizedStore,
    policy: DeliveryConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a NormalizedStore, policy: DeliveryConfig) -> Self {
        Self { store, policy }
    }

    /// Run `handler` under the delivery policy. Each attempt gets a fresh
    /// [`Deadline`]; only transient failures are attempted again.
    pub fn dispatch<T, F>(
        &self,
        handler: &str,
        payload: &serde_json::Value,
        mut run: F,
    ) -> PipelineResult<Delivery<T>>
    where
        F: FnMut(&Deadline) -> PipelineResult<T>,
    {
        let first_attempt = Instant::now();
        let backoff = self.policy.retry_backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let deadline = Deadline::start(self.policy.invocation_budget());

            let err = match run(&deadline) {
                Ok(value) => {
                    info!(handler, attempts, "invocation completed");
                    return Ok(Delivery::Completed { value, attempts });
                }
                Err(err) => err,
            };

            if let PipelineError::Malformed { .. } = err {
                warn!(handler, error = %err, "dropping malformed invocation");
                return Ok(Delivery::Dropped {
                    reason: err.to_string(),
                });
            }

            let redeliveries = attempts - 1;
            let window_left = first_attempt.elapsed() + backoff < self.policy.redelivery_window();
            if err.is_transient() && redeliveries < self.policy.max_redeliveries && window_left {
                warn!(handler, attempts, error = %err, "transient failure, redelivering");
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
                continue;
            }

            return self.dead_letter(handler, payload, attempts, &err);
        }
    }

    fn dead_letter<T>(
        &self,
        handler: &str,
        payload: &serde_json::Value,
        attempts: u32,
        err: &PipelineError,
    ) -> PipelineResult<Delivery<T>> {
        let letter = DeadLetter {
            id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            handler: handler.to_string(),
            attempts,
            reason: err.to_string(),
            payload: payload.clone(),
        };
        self.store.push_dead_letter(&letter)?;
        error!(handler, attempts, letter_id = %letter.id, error = %err, "invocation dead-lettered");
        Ok(Delivery::DeadLettered {
            letter_id: letter.id,
            attempts,
        })
    }
}
