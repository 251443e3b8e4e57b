//! Consumption executor
//!
//! Runs one claimed message through interceptors and its handler with
//! in-place retry. Every message ends in exactly one terminal state:
//! `Finish` (handler succeeded) or `Cancelled` (attempts exhausted, or the
//! body did not fit the handler).

use futures::FutureExt;
use rmq_common::Message;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::ConsumeError;
use crate::handler::Handler;
use crate::interceptor::InterceptorChain;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeState {
    Created,
    Starting,
    Running,
    Finish,
    Cancelled,
}

impl ConsumeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConsumeState::Finish | ConsumeState::Cancelled)
    }

    /// Move forward. Terminal states never change.
    pub fn advance(&mut self, next: ConsumeState) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self = next;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Finished { attempts: u32 },
    Cancelled { attempts: u32, reason: String },
}

impl ConsumeOutcome {
    pub fn state(&self) -> ConsumeState {
        match self {
            ConsumeOutcome::Finished { .. } => ConsumeState::Finish,
            ConsumeOutcome::Cancelled { .. } => ConsumeState::Cancelled,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ConsumeOutcome::Finished { attempts } | ConsumeOutcome::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ConsumeOutcome::Finished { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `retry_max + 1`.
    pub retry_max: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_max: 2,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct ConsumptionExecutor {
    queue: String,
    tag: String,
    handler: Handler,
    interceptors: Arc<InterceptorChain>,
    retry: RetryPolicy,
}

impl ConsumptionExecutor {
    pub fn new(
        queue: impl Into<String>,
        tag: impl Into<String>,
        handler: Handler,
        interceptors: Arc<InterceptorChain>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            queue: queue.into(),
            tag: tag.into(),
            handler,
            interceptors,
            retry,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Consume `message`. The caller's copy is never modified.
    pub async fn execute(&self, message: &Message) -> ConsumeOutcome {
        let started = Instant::now();
        let mut state = ConsumeState::Created;
        let mut working = message.clone();

        state.advance(ConsumeState::Starting);
        self.interceptors.before_consume(&mut working).await;
        state.advance(ConsumeState::Running);

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let error = match self.attempt(&working).await {
                Ok(()) => {
                    state.advance(ConsumeState::Finish);
                    self.interceptors.after_consume(&working).await;
                    break ConsumeOutcome::Finished { attempts };
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempts > self.retry.retry_max {
                state.advance(ConsumeState::Cancelled);
                error!(
                    queue = %self.queue,
                    message_id = %working.id,
                    attempts,
                    error = %error,
                    "Consumption failed, message cancelled"
                );
                self.interceptors.on_fail(&working, &error).await;
                break ConsumeOutcome::Cancelled {
                    attempts,
                    reason: error.to_string(),
                };
            }

            warn!(
                queue = %self.queue,
                message_id = %working.id,
                attempt = attempts,
                retry_max = self.retry.retry_max,
                error = %error,
                "Consumption attempt failed, retrying"
            );
            metrics::record_retry(&self.queue);
            tokio::time::sleep(self.retry.interval).await;
        };

        debug!(
            queue = %self.queue,
            message_id = %working.id,
            state = ?state,
            attempts,
            "Consumption complete"
        );
        metrics::record_consume_duration(&self.queue, started.elapsed());
        metrics::record_message_consumed(
            &self.queue,
            if outcome.is_finished() { "finish" } else { "cancelled" },
        );
        outcome
    }

    async fn attempt(&self, message: &Message) -> Result<(), ConsumeError> {
        let call = self.handler.invoke(message.clone())?;
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConsumeError::Handler(e)),
            Err(panic) => Err(ConsumeError::Panicked(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
