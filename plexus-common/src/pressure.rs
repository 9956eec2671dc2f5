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

//! Memory pressure monitor.
//!
//! Caches that evict on memory pressure rather than on a fixed element count
//! register a listener here and shrink when the observed used-memory fraction
//! crosses the configured threshold. Because every listener shrinks
//! independently, crossing the threshold may clean up more cached state than
//! strictly necessary; listeners are expected to drop a bounded share of
//! their contents per notification, not everything.

use std::{sync::Arc, thread::JoinHandle, time::Duration};

use parking_lot::{Condvar, Mutex};
use sysinfo::System;

/// A snapshot of memory usage handed to pressure listeners.
#[derive(Debug, Clone, Copy)]
pub struct PressureReport {
    /// Bytes of memory currently in use.
    pub used_bytes: u64,
    /// Total bytes of memory available to the process.
    pub total_bytes: u64,
}

impl PressureReport {
    /// Used fraction in `[0, 1]`.
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Identifies a registered listener for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Callback invoked when memory usage crosses the monitor threshold.
pub type PressureListener = Arc<dyn Fn(&PressureReport) + Send + Sync + 'static>;

/// Source of `(used, total)` byte readings. Injectable for tests.
pub type MemoryGauge = Box<dyn FnMut() -> (u64, u64) + Send + 'static>;

/// Memory monitor options.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Used-memory fraction above which listeners fire. Must be in `(0, 1]`.
    pub threshold: f64,
    /// Sampling period.
    pub period: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            period: Duration::from_secs(1),
        }
    }
}

struct Registry {
    next_id: u64,
    listeners: Vec<(ListenerId, PressureListener)>,
}

struct Inner {
    registry: Mutex<Registry>,
    lifecycle: Mutex<bool>,
    stopped: Condvar,
    threshold: f64,
}

/// Samples the used-memory fraction on a background thread and notifies
/// registered listeners whenever it exceeds the configured threshold.
pub struct MemoryMonitor {
    inner: Arc<Inner>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryMonitor {
    /// Start a monitor backed by process/system memory readings.
    pub fn start(options: MonitorOptions) -> Arc<Self> {
        let mut system = System::new();
        Self::start_with_gauge(
            options,
            Box::new(move || {
                system.refresh_memory();
                (system.used_memory(), system.total_memory())
            }),
        )
    }

    /// Start a monitor backed by an arbitrary gauge. Used by tests and by
    /// embedders with their own accounting.
    pub fn start_with_gauge(options: MonitorOptions, mut gauge: MemoryGauge) -> Arc<Self> {
        assert!(
            options.threshold > 0.0 && options.threshold <= 1.0,
            "threshold must be in (0, 1], given: {}",
            options.threshold
        );

        let inner = Arc::new(Inner {
            registry: Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            }),
            lifecycle: Mutex::new(true),
            stopped: Condvar::new(),
            threshold: options.threshold,
        });

        let sampler = {
            let inner = inner.clone();
            let period = options.period;
            std::thread::Builder::new()
                .name("plexus-memory-monitor".to_owned())
                .spawn(move || loop {
                    {
                        let mut running = inner.lifecycle.lock();
                        if !*running {
                            return;
                        }
                        // Bounded wait doubles as the stop signal check.
                        if !inner.stopped.wait_for(&mut running, period).timed_out() && !*running {
                            return;
                        }
                    }

                    let (used_bytes, total_bytes) = gauge();
                    let report = PressureReport {
                        used_bytes,
                        total_bytes,
                    };
                    if report.used_fraction() < inner.threshold {
                        continue;
                    }

                    tracing::debug!(
                        used = used_bytes,
                        total = total_bytes,
                        "memory threshold exceeded, notifying listeners"
                    );
                    let listeners: Vec<_> = inner
                        .registry
                        .lock()
                        .listeners
                        .iter()
                        .map(|(_, l)| l.clone())
                        .collect();
                    for listener in listeners {
                        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || listener(&report),
                        )) {
                            tracing::error!(
                                "memory pressure listener panicked: {}",
                                crate::queue::panic_message(&e)
                            );
                        }
                    }
                })
                .expect("spawn memory monitor")
        };

        Arc::new(Self {
            inner,
            sampler: Mutex::new(Some(sampler)),
        })
    }

    /// Register a listener. Fires on every sample above the threshold.
    pub fn add_listener(&self, listener: PressureListener) -> ListenerId {
        let mut registry = self.inner.registry.lock();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.listeners.push((id, listener));
        id
    }

    /// Remove a previously registered listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner
            .registry
            .lock()
            .listeners
            .retain(|(lid, _)| *lid != id);
    }

    /// Stop sampling and join the sampler thread. Idempotent.
    pub fn stop(&self) {
        {
            let mut running = self.inner.lifecycle.lock();
            *running = false;
            self.inner.stopped.notify_all();
        }
        if let Some(sampler) = self.sampler.lock().take() {
            let _ = sampler.join();
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
