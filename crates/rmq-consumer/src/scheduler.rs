//! Wake scheduling for delay queues
//!
//! One task per queue holds the earliest requested wake time. A request only
//! ever moves the wake earlier; when it fires, the target drains whatever is
//! due and returns its next wake time, if any.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rmq_common::Clock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[async_trait]
pub trait WakeTarget: Send + Sync {
    /// Handle a wake-up. Returns the next absolute wake time in epoch millis.
    async fn on_wake(&self) -> Option<i64>;
}

struct Slot {
    requests: mpsc::UnboundedSender<i64>,
    task: JoinHandle<()>,
}

pub struct WakeScheduler {
    clock: Arc<dyn Clock>,
    slots: DashMap<String, Slot>,
}

impl WakeScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: DashMap::new(),
        }
    }

    /// Start the wake task for `queue` unless one already runs.
    pub fn get_or_create(&self, queue: &str, target: Arc<dyn WakeTarget>) {
        if let Entry::Vacant(entry) = self.slots.entry(queue.to_string()) {
            let (requests, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_wake_loop(
                queue.to_string(),
                self.clock.clone(),
                target,
                rx,
            ));
            entry.insert(Slot { requests, task });
            debug!(queue, "Wake task registered");
        }
    }

    /// Request a wake at `at_millis` or earlier. False when `queue` has no
    /// wake task.
    pub fn schedule(&self, queue: &str, at_millis: i64) -> bool {
        match self.slots.get(queue) {
            Some(slot) => slot.requests.send(at_millis).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, queue: &str) {
        if let Some((_, slot)) = self.slots.remove(queue) {
            slot.task.abort();
            info!(queue, "Wake task stopped");
        }
    }

    pub fn stop(&self) {
        let queues: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        for queue in queues {
            self.remove(&queue);
        }
    }
}

impl Drop for WakeScheduler {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            slot.task.abort();
        }
    }
}

async fn run_wake_loop(
    queue: String,
    clock: Arc<dyn Clock>,
    target: Arc<dyn WakeTarget>,
    mut requests: mpsc::UnboundedReceiver<i64>,
) {
    let mut next: Option<i64> = None;

    loop {
        match next {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep(clock.until(at)) => {
                        next = target.on_wake().await;
                        debug!(queue = %queue, next = ?next, "Woke");
                    }
                    request = requests.recv() => match request {
                        Some(requested) => next = Some(at.min(requested)),
                        None => break,
                    },
                }
            }
            None => match requests.recv().await {
                Some(requested) => next = Some(requested),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rmq_common::TokioClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Recorder {
        clock: Arc<TokioClock>,
        wakes: Mutex<Vec<i64>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl WakeTarget for Recorder {
        async fn on_wake(&self) -> Option<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.wakes.lock().push(self.clock.now_millis());
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_keeps_minimum() {
        let clock = Arc::new(TokioClock::starting_at(0));
        let recorder = Arc::new(Recorder {
            clock: clock.clone(),
            wakes: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        });
        let scheduler = WakeScheduler::new(clock.clone());
        scheduler.get_or_create("reminders", recorder.clone());

        assert!(scheduler.schedule("reminders", 5_000));
        assert!(scheduler.schedule("reminders", 2_000));
        assert!(scheduler.schedule("reminders", 9_000));
        assert!(!scheduler.schedule("unknown", 1_000));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.wakes.lock(), vec![2_000]);
    }

    fn recorder(clock: &Arc<TokioClock>) -> Arc<Recorder> {
        Arc::new(Recorder {
            clock: clock.clone(),
            wakes: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_create_keeps_first_task() {
        let clock = Arc::new(TokioClock::starting_at(0));
        let first = recorder(&clock);
        let second = recorder(&clock);
        let scheduler = WakeScheduler::new(clock.clone());
        scheduler.get_or_create("reminders", first.clone());
        scheduler.schedule("reminders", 3_000);
        scheduler.get_or_create("reminders", second.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*first.wakes.lock(), vec![3_000]);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_wake_fires_immediately() {
        let clock = Arc::new(TokioClock::starting_at(10_000));
        let recorder = Arc::new(Recorder {
            clock: clock.clone(),
            wakes: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        });
        let scheduler = WakeScheduler::new(clock.clone());
        scheduler.get_or_create("reminders", recorder.clone());
        scheduler.schedule("reminders", 1);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        scheduler.remove("reminders");
        assert!(!scheduler.schedule("reminders", 20_000));
    }
}
