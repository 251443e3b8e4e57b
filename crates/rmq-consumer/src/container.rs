//! Listener container - claims and dispatches messages for one queue
//!
//! Handles:
//! - Polling the virtual queues currently assigned to this client
//! - Claiming entries (ZREM in auto mode, lock in manual mode)
//! - Bounded worker pool (one semaphore permit per in-flight message)
//! - Immediate mode: push hint or idle poll drives the next pass
//! - Delay mode: wake at the earliest ready time via [`WakeScheduler`]
//! - Pausing while the client rebalances
//! - Graceful stop with drain timeout

use async_trait::async_trait;
use rmq_common::{
    parse_virtual_queue, AckMode, Clock, Keys, Message, MessageStatus, Queue, ANY_TAG,
};
use rmq_config::ConsumerConfig;
use rmq_store::{MessageStore, QueueStore, StoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, RwLock, RwLockWriteGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{ConsumerError, Result};
use crate::executor::{ConsumeOutcome, ConsumptionExecutor};
use crate::metrics;
use crate::pending::{LeaseRenewer, LeaseSettings, PendingEntry, PendingLocks};
use crate::scheduler::{WakeScheduler, WakeTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    Immediate,
    Delay,
}

impl ContainerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerMode::Immediate => "immediate",
            ContainerMode::Delay => "delay",
        }
    }
}

/// Shared dependencies handed to every container of a client.
#[derive(Clone)]
pub struct ContainerContext {
    pub client_id: String,
    pub store: Arc<dyn QueueStore>,
    pub keys: Keys,
    pub clock: Arc<dyn Clock>,
    pub config: ConsumerConfig,
    pub scheduler: Arc<WakeScheduler>,
    pub message_store: Option<Arc<dyn MessageStore>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStats {
    pub queue: String,
    pub mode: ContainerMode,
    pub running: bool,
    pub failed: bool,
    pub assigned: Vec<String>,
    pub in_flight: u32,
    pub max_in_flight: u32,
    pub pending_locks: usize,
    pub claimed: u64,
    pub finished: u64,
    pub cancelled: u64,
}

pub struct ListenerContainer {
    queue: Queue,
    mode: ContainerMode,
    ctx: ContainerContext,
    /// tag -> executor, `*` is the catch-all
    executors: HashMap<String, Arc<ConsumptionExecutor>>,

    /// Owned virtual queues. Poll passes hold the read lock; rebalance takes
    /// the write lock, which pauses the container.
    assignment: RwLock<Vec<String>>,
    cursor: AtomicUsize,

    semaphore: Arc<Semaphore>,
    workers: parking_lot::Mutex<JoinSet<()>>,
    pending: Arc<PendingLocks>,
    wake: Notify,

    running: AtomicBool,
    stopped: AtomicBool,
    failed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,

    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    claimed: AtomicU64,
    finished: AtomicU64,
    cancelled: AtomicU64,
}

impl ListenerContainer {
    pub fn new(
        queue: Queue,
        executors: HashMap<String, Arc<ConsumptionExecutor>>,
        ctx: ContainerContext,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mode = if queue.delay {
            ContainerMode::Delay
        } else {
            ContainerMode::Immediate
        };
        Self {
            semaphore: Arc::new(Semaphore::new(queue.max_concurrency as usize)),
            mode,
            queue,
            ctx,
            executors,
            assignment: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            workers: parking_lot::Mutex::new(JoinSet::new()),
            pending: Arc::new(PendingLocks::new()),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            shutdown_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            claimed: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn mode(&self) -> ContainerMode {
        self.mode
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stopped permanently after a non-recoverable store error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> &Arc<PendingLocks> {
        &self.pending
    }

    pub async fn assigned(&self) -> Vec<String> {
        self.assignment.read().await.clone()
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyStarted);
        }
        self.stopped.store(false, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);

        let mut tasks = self.tasks.lock();
        if self.ctx.config.ack_mode == AckMode::Manual {
            let renewer = LeaseRenewer::new(
                self.queue.name.clone(),
                self.ctx.client_id.clone(),
                self.ctx.store.clone(),
                self.pending.clone(),
                LeaseSettings {
                    ttl: self.ctx.config.lock_ttl(),
                    warmup: self.ctx.config.lease_warmup(),
                    interval: self.ctx.config.lease_renew_interval(),
                },
            );
            tasks.push(renewer.spawn(self.shutdown_tx.subscribe()));
        }

        match self.mode {
            ContainerMode::Immediate => {
                let container = Arc::clone(self);
                let shutdown_rx = self.shutdown_tx.subscribe();
                tasks.push(tokio::spawn(async move {
                    container.run_poller(shutdown_rx).await;
                }));
            }
            ContainerMode::Delay => {
                let target = Arc::new(DelayTarget(Arc::downgrade(self)));
                self.ctx.scheduler.get_or_create(&self.queue.name, target);
                self.ctx
                    .scheduler
                    .schedule(&self.queue.name, self.ctx.clock.now_millis());
            }
        }

        info!(
            queue = %self.queue.name,
            mode = self.mode.as_str(),
            max_concurrency = self.queue.max_concurrency,
            ack_mode = ?self.ctx.config.ack_mode,
            "Listener container started"
        );
        Ok(())
    }

    /// Stop accepting work, give in-flight handlers the shutdown timeout to
    /// finish, then cancel what is left. Unfinished manual-mode claims stay
    /// locked until their lease lapses and are then redelivered.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        // Wait out a pass in progress; later passes observe running == false
        drop(self.assignment.write().await);

        let mut workers = std::mem::take(&mut *self.workers.lock());
        let in_flight = workers.len();
        let timeout = self.ctx.config.shutdown_timeout();
        if tokio::time::timeout(timeout, drain_workers(&mut workers)).await.is_err() {
            warn!(
                queue = %self.queue.name,
                remaining = workers.len(),
                timeout_ms = timeout.as_millis() as u64,
                "Workers did not finish in time, cancelling"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.ctx.scheduler.remove(&self.queue.name);
        self.pending.clear();
        self.in_flight.store(0, Ordering::SeqCst);
        metrics::set_in_flight(&self.queue.name, 0);

        info!(queue = %self.queue.name, drained = in_flight, "Listener container stopped");
    }

    /// Take the assignment write lock. No poll pass runs until the guard is
    /// dropped.
    pub async fn pause(&self) -> AssignmentGuard<'_> {
        AssignmentGuard {
            queue: &self.queue.name,
            guard: self.assignment.write().await,
        }
    }

    /// Trigger a pass now, e.g. after a rebalance.
    pub fn wake(&self) {
        match self.mode {
            ContainerMode::Immediate => self.wake.notify_one(),
            ContainerMode::Delay => {
                self.ctx
                    .scheduler
                    .schedule(&self.queue.name, self.ctx.clock.now_millis());
            }
        }
    }

    /// A producer enqueued into this queue, ready at `ready_at`.
    pub fn on_push_hint(&self, ready_at: Option<i64>) {
        match self.mode {
            ContainerMode::Immediate => self.wake.notify_one(),
            ContainerMode::Delay => {
                let at = ready_at.unwrap_or_else(|| self.ctx.clock.now_millis());
                self.ctx.scheduler.schedule(&self.queue.name, at);
            }
        }
    }

    pub async fn stats(&self) -> ContainerStats {
        ContainerStats {
            queue: self.queue.name.clone(),
            mode: self.mode,
            running: self.is_running(),
            failed: self.is_failed(),
            assigned: self.assigned().await,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            pending_locks: self.pending.len(),
            claimed: self.claimed.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }

    async fn run_poller(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        debug!(queue = %self.queue.name, "Poller started");

        loop {
            if !self.is_running() {
                break;
            }
            self.reap_workers();

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_rx.recv() => break,
            };

            match self.poll_assigned(Some(permit)).await {
                Ok(dispatched) if dispatched > 0 => continue,
                Ok(_) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.ctx.config.idle_poll_interval()) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
                Err(e) if e.is_wrong_type() => {
                    self.fail(&e);
                    break;
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue.name,
                        error = %e,
                        backoff_ms = self.ctx.config.error_backoff_ms,
                        "Poll failed, backing off"
                    );
                    metrics::record_poll_error(&self.queue.name, "transient");
                    tokio::select! {
                        _ = tokio::time::sleep(self.ctx.config.error_backoff()) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }

        debug!(queue = %self.queue.name, "Poller stopped");
    }

    /// Delay mode: dispatch everything due, then report the next wake time.
    async fn drain_due(self: &Arc<Self>) -> Option<i64> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if !self.is_running() {
                return None;
            }
            self.reap_workers();

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return None,
                },
                _ = shutdown_rx.recv() => return None,
            };

            match self.poll_assigned(Some(permit)).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => return self.retry_after(e),
            }
        }

        match self.next_wake().await {
            Ok(next) => next,
            Err(e) => self.retry_after(e),
        }
    }

    fn retry_after(&self, error: StoreError) -> Option<i64> {
        if error.is_wrong_type() {
            self.fail(&error);
            return None;
        }
        warn!(
            queue = %self.queue.name,
            error = %error,
            backoff_ms = self.ctx.config.error_backoff_ms,
            "Delay poll failed, backing off"
        );
        metrics::record_poll_error(&self.queue.name, "transient");
        Some(self.ctx.clock.now_millis() + self.ctx.config.error_backoff_ms as i64)
    }

    /// Earliest ready time among entries this container could still claim.
    /// Entries already due (contended, or waiting on capacity) retry shortly.
    async fn next_wake(&self) -> std::result::Result<Option<i64>, StoreError> {
        let assignment = self.assignment.read().await;
        let manual = self.ctx.config.ack_mode == AckMode::Manual;
        let mut earliest: Option<i64> = None;

        for virtual_queue in assignment.iter() {
            let head = self
                .ctx
                .store
                .peek(&self.ctx.keys.queue(virtual_queue), self.ctx.config.peek_window)
                .await?;
            let candidate = head.into_iter().find(|entry| {
                !(manual && self.pending.contains_member(&entry.member))
                    && self.handles_member(&entry.member)
            });
            if let Some(entry) = candidate {
                earliest = Some(earliest.map_or(entry.score, |at| at.min(entry.score)));
            }
        }

        let now = self.ctx.clock.now_millis();
        Ok(earliest.map(|at| {
            if at <= now {
                now + self.ctx.config.contended_retry_ms as i64
            } else {
                at
            }
        }))
    }

    /// One pass over the assignment, starting one queue further each time so
    /// a saturated pool does not always favour the first virtual queue.
    async fn poll_assigned(
        self: &Arc<Self>,
        first: Option<OwnedSemaphorePermit>,
    ) -> std::result::Result<usize, StoreError> {
        let mut permit = first;
        let assignment = self.assignment.read().await;
        if !self.is_running() || assignment.is_empty() {
            return Ok(0);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % assignment.len();
        let mut dispatched = 0;
        for i in 0..assignment.len() {
            if !self.is_running() {
                break;
            }
            let virtual_queue = &assignment[(start + i) % assignment.len()];
            dispatched += self.poll_virtual_queue(virtual_queue, &mut permit).await?;
            if permit.is_none() && self.semaphore.available_permits() == 0 {
                break;
            }
        }
        Ok(dispatched)
    }

    async fn poll_virtual_queue(
        self: &Arc<Self>,
        virtual_queue: &str,
        permit: &mut Option<OwnedSemaphorePermit>,
    ) -> std::result::Result<usize, StoreError> {
        let capacity = usize::from(permit.is_some()) + self.semaphore.available_permits();
        if capacity == 0 {
            return Ok(0);
        }

        let manual = self.ctx.config.ack_mode == AckMode::Manual;
        let key = self.ctx.keys.queue(virtual_queue);
        let offset = if manual {
            self.pending.count_for(virtual_queue)
        } else {
            0
        };
        let now = self.ctx.clock.now_millis();
        let entries = self
            .ctx
            .store
            .range_by_score(&key, now, offset, capacity)
            .await?;

        let mut dispatched = 0;
        for entry in entries {
            let message = match Message::from_member(&entry.member) {
                Ok(message) => message,
                Err(e) => {
                    error!(
                        queue = %self.queue.name,
                        virtual_queue,
                        error = %e,
                        "Dropping undecodable message"
                    );
                    metrics::record_malformed_message(&self.queue.name);
                    self.ctx.store.remove(&key, &entry.member).await?;
                    continue;
                }
            };

            let Some(executor) = self.executor_for(&message.tag) else {
                debug!(
                    queue = %self.queue.name,
                    message_id = %message.id,
                    tag = %message.tag,
                    "No listener for tag, leaving message"
                );
                continue;
            };
            if manual && self.pending.contains(&message.id) {
                continue;
            }

            let slot = match permit.take() {
                Some(slot) => slot,
                None => match self.semaphore.clone().try_acquire_owned() {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            if self.claim(virtual_queue, &key, &entry.member, &message).await? {
                self.dispatch(message, entry.member, virtual_queue.to_string(), executor, slot);
                dispatched += 1;
            } else {
                debug!(queue = %self.queue.name, message_id = %message.id, "Claim lost");
                metrics::record_claim_contended(&self.queue.name);
                *permit = Some(slot);
            }
        }
        Ok(dispatched)
    }

    async fn claim(
        &self,
        virtual_queue: &str,
        key: &str,
        member: &str,
        message: &Message,
    ) -> std::result::Result<bool, StoreError> {
        match self.ctx.config.ack_mode {
            AckMode::Auto => self.ctx.store.remove(key, member).await,
            AckMode::Manual => {
                let lock_key = self.ctx.keys.lock(&message.id);
                let locked = self
                    .ctx
                    .store
                    .try_lock(&lock_key, &self.ctx.client_id, self.ctx.config.lock_ttl())
                    .await?;
                if locked {
                    self.pending.track(PendingEntry {
                        message_id: message.id.clone(),
                        member: member.to_string(),
                        virtual_queue: virtual_queue.to_string(),
                        lock_key,
                        claimed_at: self.ctx.clock.now_millis(),
                        lease_lost: false,
                    });
                }
                Ok(locked)
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        message: Message,
        member: String,
        virtual_queue: String,
        executor: Arc<ConsumptionExecutor>,
        permit: OwnedSemaphorePermit,
    ) {
        self.claimed.fetch_add(1, Ordering::SeqCst);
        metrics::record_message_claimed(&self.queue.name, self.mode.as_str());
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        metrics::set_in_flight(&self.queue.name, in_flight);

        debug!(
            queue = %self.queue.name,
            virtual_queue = %virtual_queue,
            message_id = %message.id,
            tag = %message.tag,
            "Message claimed"
        );

        let container = Arc::clone(self);
        self.workers.lock().spawn(async move {
            let _permit = permit;
            container
                .record_status(&message.id, MessageStatus::Consuming)
                .await;
            let outcome = executor.execute(&message).await;
            container
                .complete(&message, &member, &virtual_queue, &outcome)
                .await;
        });
    }

    async fn complete(
        &self,
        message: &Message,
        member: &str,
        virtual_queue: &str,
        outcome: &ConsumeOutcome,
    ) {
        if self.ctx.config.ack_mode == AckMode::Manual {
            let key = self.ctx.keys.queue(virtual_queue);
            if let Err(e) = self.ctx.store.remove(&key, member).await {
                warn!(queue = %self.queue.name, message_id = %message.id, error = %e, "Failed to remove consumed message");
            }
            let lock_key = self.ctx.keys.lock(&message.id);
            if let Err(e) = self.ctx.store.release_lock(&lock_key, &self.ctx.client_id).await {
                warn!(queue = %self.queue.name, message_id = %message.id, error = %e, "Failed to release lock");
            }
            if let Some(entry) = self.pending.release(&message.id) {
                if entry.lease_lost {
                    warn!(
                        queue = %self.queue.name,
                        message_id = %message.id,
                        "Finished after losing the lease"
                    );
                }
            }
        }

        let status = if outcome.is_finished() {
            self.finished.fetch_add(1, Ordering::SeqCst);
            MessageStatus::Finish
        } else {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            MessageStatus::Cancelled
        };
        self.record_status(&message.id, status).await;

        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_in_flight(&self.queue.name, in_flight);
    }

    async fn record_status(&self, message_id: &str, status: MessageStatus) {
        let Some(message_store) = &self.ctx.message_store else {
            return;
        };
        if let Err(e) = message_store
            .update_status(&[message_id.to_string()], status)
            .await
        {
            warn!(message_id, status = ?status, error = %e, "Failed to record message status");
        }
    }

    fn executor_for(&self, tag: &str) -> Option<Arc<ConsumptionExecutor>> {
        self.executors
            .get(tag)
            .or_else(|| self.executors.get(ANY_TAG))
            .cloned()
    }

    fn handles_member(&self, member: &str) -> bool {
        match Message::from_member(member) {
            Ok(message) => self.executor_for(&message.tag).is_some(),
            // The next pass drops it
            Err(_) => true,
        }
    }

    fn reap_workers(&self) {
        let mut workers = self.workers.lock();
        while let Some(result) = workers.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(queue = %self.queue.name, "Worker panicked");
                }
            }
        }
    }

    fn fail(&self, error: &StoreError) {
        error!(
            queue = %self.queue.name,
            error = %error,
            "Non-recoverable store error, container stopped"
        );
        metrics::record_poll_error(&self.queue.name, "wrong_type");
        self.failed.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn drain_workers(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Worker panicked during shutdown");
            }
        }
    }
}

struct DelayTarget(Weak<ListenerContainer>);

#[async_trait]
impl WakeTarget for DelayTarget {
    async fn on_wake(&self) -> Option<i64> {
        let container = self.0.upgrade()?;
        container.drain_due().await
    }
}

/// Write access to a paused container's assignment.
pub struct AssignmentGuard<'a> {
    queue: &'a str,
    guard: RwLockWriteGuard<'a, Vec<String>>,
}

impl AssignmentGuard<'_> {
    pub fn current(&self) -> &[String] {
        &self.guard
    }

    /// Keep the virtual queues of `owned` that belong to this container's
    /// queue. Returns true when the assignment changed.
    pub fn replace(&mut self, owned: &[String]) -> bool {
        let mine: Vec<String> = owned
            .iter()
            .filter(|vq| parse_virtual_queue(vq).is_some_and(|(name, _)| name == self.queue))
            .cloned()
            .collect();
        if *self.guard == mine {
            return false;
        }
        *self.guard = mine;
        true
    }
}
