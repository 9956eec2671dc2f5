// Copyright 2025 plexus Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-worker maintenance queue.
//!
//! All structural mutations of cache eviction structures are funneled through
//! one dedicated thread per database environment, so lookup paths never
//! contend with list bookkeeping and the bookkeeping structures need no
//! per-access locking of their own. The price is eventual consistency between
//! a cache's logical recency and its list position, which the caches accept.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};

/// A unit of maintenance work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct State {
    tasks: VecDeque<Task>,
    running: bool,
    paused: bool,
    /// Worker acknowledged a pause and parked between two tasks.
    parked: bool,
    /// A task was popped but its completion is not counted yet.
    in_flight: bool,
    completed: u64,
}

struct Shared {
    state: Mutex<State>,
    /// Signaled for the worker: new task, resume, stop.
    available: Condvar,
    /// Signaled for callers: task completed, worker parked.
    progress: Condvar,
}

/// An ordered queue of maintenance tasks executed by a single dedicated
/// worker thread.
///
/// The queue is owned by the enclosing database environment and shared by
/// every cache of that environment. Tasks run strictly in submission order,
/// one at a time. Submitting never blocks. There is no guarantee that a task
/// has completed by the time the submitting call returns; [`drain`] provides
/// that barrier when a caller must observe a task's effect.
///
/// [`drain`]: MaintenanceQueue::drain
pub struct MaintenanceQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceQueue {
    /// Start the maintenance worker and return a handle to the queue.
    pub fn start(name: &str) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                running: true,
                ..Default::default()
            }),
            available: Condvar::new(),
            progress: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || Self::worker_loop(&shared))
                .expect("spawn maintenance worker")
        };

        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let task = {
                let mut state = shared.state.lock();
                loop {
                    if state.paused && state.running {
                        state.parked = true;
                        shared.progress.notify_all();
                        shared.available.wait(&mut state);
                        state.parked = false;
                        continue;
                    }
                    if let Some(task) = state.tasks.pop_front() {
                        state.in_flight = true;
                        break Some(task);
                    }
                    if !state.running {
                        break None;
                    }
                    shared.available.wait(&mut state);
                }
            };

            let Some(task) = task else { break };

            // A fault in one task must not kill the worker: that would stop
            // all future eviction for the lifetime of the environment.
            if let Err(e) = catch_unwind(AssertUnwindSafe(task)) {
                tracing::error!("maintenance task panicked: {}", panic_message(&e));
            }

            let mut state = shared.state.lock();
            state.in_flight = false;
            state.completed += 1;
            shared.progress.notify_all();
        }
    }

    /// Enqueue a task. Never blocks; the task runs after everything queued
    /// before it.
    ///
    /// Tasks submitted after [`stop`](MaintenanceQueue::stop) are dropped.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock();
        if !state.running {
            tracing::debug!("maintenance task dropped: queue is stopped");
            return;
        }
        state.tasks.push_back(Box::new(task));
        self.shared.available.notify_one();
    }

    /// Cooperatively pause the worker.
    ///
    /// Returns once the worker has parked between two tasks, so the caller
    /// may run a synchronous eviction sweep without racing ordinary
    /// maintenance. Must be balanced by [`resume`](MaintenanceQueue::resume).
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        state.paused = true;
        self.shared.available.notify_all();
        while !state.parked && state.running {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Resume a paused worker.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        state.paused = false;
        self.shared.available.notify_all();
    }

    /// Block until every task queued at the time of the call has completed.
    ///
    /// Tasks submitted while draining are not waited upon.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        let target = state.completed + state.tasks.len() as u64 + state.in_flight as u64;
        while state.completed < target && (state.running || state.in_flight || !state.tasks.is_empty())
        {
            self.shared.progress.wait(&mut state);
        }
    }

    /// Hint that the backlog should drain promptly.
    ///
    /// Thread priorities are not portable; this wakes the worker if it is
    /// parked and records the request for telemetry.
    pub fn expedite(&self) {
        tracing::trace!(backlog = self.len(), "maintenance queue expedited");
        self.shared.available.notify_all();
    }

    /// Number of tasks currently waiting.
    pub fn len(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Whether no tasks are currently waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of tasks executed by the worker, whether or not they
    /// panicked.
    pub fn completed(&self) -> u64 {
        self.shared.state.lock().completed
    }

    /// Whether the worker is accepting tasks.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Stop the queue: run every remaining task, then join the worker.
    ///
    /// Deterministic and idempotent. Tasks submitted afterwards are dropped.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.paused = false;
            self.shared.available.notify_all();
            // Wake any caller stuck in drain/pause against a stopping queue.
            self.shared.progress.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("maintenance worker terminated abnormally");
            }
        }
    }
}

impl Drop for MaintenanceQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best-effort extraction of a panic payload message.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_submission_order() {
        let queue = MaintenanceQueue::start("mq-order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = seen.clone();
            queue.submit(move || seen.lock().push(i));
        }
        queue.drain();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        queue.stop();
    }

    #[test]
    fn test_drain_observes_completion() {
        let queue = MaintenanceQueue::start("mq-drain");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            queue.submit(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(queue.completed(), 10);
        queue.stop();
    }

    #[test_log::test]
    fn test_panicking_task_does_not_kill_worker() {
        let queue = MaintenanceQueue::start("mq-panic");
        let counter = Arc::new(AtomicUsize::new(0));
        queue.submit(|| panic!("boom"));
        let c = counter.clone();
        queue.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.completed(), 2);
        queue.stop();
    }

    #[test]
    fn test_pause_excludes_maintenance() {
        let queue = MaintenanceQueue::start("mq-pause");
        let counter = Arc::new(AtomicUsize::new(0));
        queue.pause();
        let c = counter.clone();
        queue.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // The worker is parked: nothing runs while paused.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        queue.resume();
        queue.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        queue.stop();
    }

    #[test]
    fn test_stop_runs_remaining_tasks() {
        let queue = MaintenanceQueue::start("mq-stop");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let c = counter.clone();
            queue.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        // Submissions after stop are dropped.
        let c = counter.clone();
        queue.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
