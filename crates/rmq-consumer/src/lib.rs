//! RedisMQ consumer side
//!
//! - [`MqClient`]: joins the cluster, owns one [`ListenerContainer`] per
//!   consumed queue and keeps their virtual-queue assignment current
//! - [`ListenerContainer`]: claims ready messages from its assigned virtual
//!   queues and runs them on a bounded worker pool
//! - [`ConsumptionExecutor`]: interceptors, handler adaptation and retry
//! - [`WakeScheduler`]: earliest-ready wake-ups for delay queues
//! - [`PendingLocks`] / [`LeaseRenewer`]: manual-ack lock tracking

pub mod client;
pub mod container;
pub mod error;
pub mod executor;
pub mod handler;
pub mod interceptor;
pub mod lifecycle;
pub mod metrics;
pub mod pending;
pub mod scheduler;

pub use client::{ListenerOptions, MqClient, MqClientBuilder};
pub use container::{ContainerContext, ContainerMode, ContainerStats, ListenerContainer};
pub use error::{ConsumeError, ConsumerError, Result};
pub use executor::{ConsumeOutcome, ConsumeState, ConsumptionExecutor, RetryPolicy};
pub use handler::{Handler, HandlerResult};
pub use interceptor::{ConsumeInterceptor, InterceptorChain};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use pending::{LeaseRenewer, LeaseSettings, PendingEntry, PendingLocks};
pub use scheduler::{WakeScheduler, WakeTarget};
