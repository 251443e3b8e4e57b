//! Consume interceptors
//!
//! Observers run around every consumption in registration order. They may
//! decorate the executor's copy of a message but can never fail it.

use async_trait::async_trait;
use rmq_common::Message;
use std::sync::Arc;
use tracing::warn;

use crate::error::ConsumeError;

/// Hooks around every consumption.
///
/// `before_consume` sees the executor's private copy of the message and may
/// modify it; the handler receives the modified copy. Hook errors are logged
/// and never change the consumption outcome.
#[async_trait]
pub trait ConsumeInterceptor: Send + Sync {
    fn name(&self) -> &str {
        "interceptor"
    }

    async fn before_consume(&self, _message: &mut Message) -> anyhow::Result<()> {
        Ok(())
    }

    async fn after_consume(&self, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once, after the final failed attempt.
    async fn on_fail(&self, _message: &Message, _error: &ConsumeError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered interceptor list shared by every executor of a client.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn ConsumeInterceptor>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn ConsumeInterceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn before_consume(&self, message: &mut Message) {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.before_consume(message).await {
                warn!(
                    interceptor = interceptor.name(),
                    message_id = %message.id,
                    error = %e,
                    "before_consume failed"
                );
            }
        }
    }

    pub async fn after_consume(&self, message: &Message) {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.after_consume(message).await {
                warn!(
                    interceptor = interceptor.name(),
                    message_id = %message.id,
                    error = %e,
                    "after_consume failed"
                );
            }
        }
    }

    pub async fn on_fail(&self, message: &Message, error: &ConsumeError) {
        for interceptor in &self.interceptors {
            if let Err(e) = interceptor.on_fail(message, error).await {
                warn!(
                    interceptor = interceptor.name(),
                    message_id = %message.id,
                    error = %e,
                    "on_fail failed"
                );
            }
        }
    }
}
