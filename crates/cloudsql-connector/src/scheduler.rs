//! Delayed-task scheduler for background refreshes.
//!
//! A thin lifecycle layer over the tokio runtime: tasks are spawned with
//! a delay and a per-task shutdown signal, tracked so that `close()` can
//! guarantee nothing fires afterwards. The registry owns one scheduler
//! and shares it with every instance entry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifies a scheduled task so it can be cancelled before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle(u64);

struct TaskSlot {
    /// Set once the task is spawned; `None` only during the brief window
    /// between registration and spawn.
    handle: Option<JoinHandle<()>>,
    cancel_tx: watch::Sender<bool>,
}

impl TaskSlot {
    fn stop(self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.handle {
            handle.abort();
        }
    }
}

struct SchedulerState {
    closed: bool,
    next_id: u64,
    tasks: HashMap<u64, TaskSlot>,
}

/// Delayed-task executor with a one-way `close()`.
pub struct RefreshScheduler {
    state: Mutex<SchedulerState>,
    weak: Weak<RefreshScheduler>,
}

impl RefreshScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(SchedulerState {
                closed: false,
                next_id: 0,
                tasks: HashMap::new(),
            }),
            weak: weak.clone(),
        })
    }

    /// Run `task` after `delay`. Returns `None` when the scheduler has
    /// been closed; the task is then dropped without running.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl Future<Output = ()> + Send + 'static,
    ) -> Option<TaskHandle> {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let id = {
            let mut state = self.state.lock().expect("scheduler lock");
            if state.closed {
                return None;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.tasks.insert(
                id,
                TaskSlot {
                    handle: None,
                    cancel_tx,
                },
            );
            id
        };

        let weak: Weak<Self> = self.weak.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel_rx.changed() => {}
                _ = tokio::time::sleep(delay) => {
                    // Re-check under close(): nothing runs afterwards.
                    let closed = weak.upgrade().map_or(true, |s| s.is_closed());
                    if !closed {
                        task.await;
                    }
                }
            }
            if let Some(scheduler) = weak.upgrade() {
                let mut state = scheduler.state.lock().expect("scheduler lock");
                state.tasks.remove(&id);
            }
        });

        let mut state = self.state.lock().expect("scheduler lock");
        if let Some(slot) = state.tasks.get_mut(&id) {
            slot.handle = Some(handle);
        }
        // When the slot is already gone the task finished (or close()
        // drained it); there is nothing left to track.
        Some(TaskHandle(id))
    }

    /// Cancel a pending task. A task that already ran is a no-op.
    pub fn cancel(&self, handle: TaskHandle) {
        let slot = {
            let mut state = self.state.lock().expect("scheduler lock");
            state.tasks.remove(&handle.0)
        };
        if let Some(slot) = slot {
            slot.stop();
        }
    }

    /// Close the scheduler: cancel every pending task and refuse new
    /// ones. Idempotent.
    pub fn close(&self) {
        let drained: Vec<TaskSlot> = {
            let mut state = self.state.lock().expect("scheduler lock");
            if state.closed {
                return;
            }
            state.closed = true;
            state.tasks.drain().map(|(_, slot)| slot).collect()
        };
        debug!(cancelled = drained.len(), "refresh scheduler closed");
        for slot in drained {
            slot.stop();
        }
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("scheduler lock").closed
    }

    /// Number of tasks currently pending or running.
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().expect("scheduler lock").tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn scheduled_task_runs_after_delay() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        scheduler
            .schedule(Duration::from_millis(10), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn cancelled_task_does_not_run() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        let handle = scheduler
            .schedule(Duration::from_millis(30), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.cancel(handle);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_cancels_pending_tasks_and_refuses_new_ones() {
        let scheduler = RefreshScheduler::new();
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let count = count.clone();
            scheduler
                .schedule(Duration::from_millis(30), async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.close();
        assert!(scheduler.is_closed());

        let late = count.clone();
        assert!(scheduler
            .schedule(Duration::from_millis(1), async move {
                late.fetch_add(1, Ordering::SeqCst);
            })
            .is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let scheduler = RefreshScheduler::new();
        scheduler.close();
        scheduler.close();
        assert!(scheduler.is_closed());
    }

    #[tokio::test]
    async fn zero_delay_runs_promptly() {
        let scheduler = RefreshScheduler::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();

        scheduler
            .schedule(Duration::ZERO, async move {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
