//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared scheduler backend: one thread scans every registered streamer and
//! hands ready functions to a thread pool.
//!
//! `submit(n)` on any streamer releases the shared counting signal by `n`.
//! Each dispatch consumes one unit, so the scheduler never dispatches more
//! readiness than was announced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use super::signal::{CountingSignal, WaitSignal};
use super::thread_pool::{HostFunctionThreadPool, PoolJob};
use super::{Backoff, HostFunctionWorker};
use crate::config::BridgeConfig;
use crate::error::{HostFnError, Result};
use crate::host_function::HOST_FUNCTION_COMPLETED;
use crate::platform::set_thread_affinity_if_requested;
use crate::streamer::HostFunctionStreamer;

struct SchedulerShared {
    streamers: Mutex<Vec<Arc<HostFunctionStreamer>>>,
    signal: CountingSignal,
    stop: AtomicBool,
}

impl SchedulerShared {
    fn streamers(&self) -> MutexGuard<'_, Vec<Arc<HostFunctionStreamer>>> {
        self.streamers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Scan {
    /// Every held unit was spent on a dispatch.
    Drained,
    /// Units remain; `true` if anything was dispatched this pass.
    Partial(bool),
}

/// One pass over the registry. The registry stays locked for the pass so an
/// unregistered streamer is never dispatched afterwards.
fn scan_streamers(
    shared: &SchedulerShared,
    pool: &HostFunctionThreadPool,
    units: &mut u32,
) -> Scan {
    let streamers = shared.streamers();
    let mut dispatched = false;
    for streamer in streamers.iter() {
        let id = streamer.host_function_ready_to_execute();
        if id == HOST_FUNCTION_COMPLETED {
            continue;
        }
        if *units > 0 {
            *units -= 1;
        } else if !shared.signal.try_acquire() {
            break;
        }
        // Claimed: from here the pool runs or releases it, never drops it.
        let function = streamer.host_function(id);
        streamer.prepare_for_execution();
        log::trace!("HostFunctionScheduler: dispatching host function {}", id);
        pool.enqueue(PoolJob {
            streamer: Arc::clone(streamer),
            function,
        });
        dispatched = true;
    }
    if *units == 0 {
        Scan::Drained
    } else {
        Scan::Partial(dispatched)
    }
}

fn scheduler_loop(
    shared: Arc<SchedulerShared>,
    pool: Arc<HostFunctionThreadPool>,
    cpu_id: Option<usize>,
) {
    set_thread_affinity_if_requested(cpu_id);
    while shared.signal.acquire(&shared.stop) {
        let mut units: u32 = 1;
        let mut backoff = Backoff::new();
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            match scan_streamers(&shared, &pool, &mut units) {
                Scan::Drained => break,
                Scan::Partial(true) => backoff.reset(),
                // Hinted work not yet visible in the status words.
                Scan::Partial(false) => backoff.snooze(),
            }
        }
    }
}

/// Scheduler thread plus its executor pool, shared by every streamer of a bridge.
pub struct HostFunctionScheduler {
    shared: Arc<SchedulerShared>,
    pool: Arc<HostFunctionThreadPool>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl HostFunctionScheduler {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let pool = Arc::new(HostFunctionThreadPool::new(
            config.thread_pool_size,
            config.skip_execution,
        )?);
        let shared = Arc::new(SchedulerShared {
            streamers: Mutex::new(Vec::new()),
            signal: CountingSignal::new(),
            stop: AtomicBool::new(false),
        });

        let name = "hostfn-scheduler".to_string();
        let join = {
            let shared = Arc::clone(&shared);
            let pool = Arc::clone(&pool);
            let cpu_id = config.scheduler_cpu_id;
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || scheduler_loop(shared, pool, cpu_id))
                .map_err(|source| HostFnError::ThreadSpawn { name, source })?
        };
        log::debug!(
            "HostFunctionScheduler: started (pool {:?}, {} thread(s))",
            config.thread_pool_size,
            pool.thread_count()
        );
        Ok(Self {
            shared,
            pool,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn register_streamer(&self, streamer: Arc<HostFunctionStreamer>) -> Result<()> {
        if self.shared.stop.load(Ordering::SeqCst) {
            return Err(HostFnError::ShutDown);
        }
        self.pool.register_streamer()?;
        self.shared.streamers().push(streamer);
        Ok(())
    }

    /// Remove `streamer` and wait for its dispatched function, if any. Once
    /// this returns nothing of `streamer` runs or is queued.
    pub fn unregister_streamer(&self, streamer: &Arc<HostFunctionStreamer>) {
        let removed = {
            let mut streamers = self.shared.streamers();
            let before = streamers.len();
            streamers.retain(|s| !Arc::ptr_eq(s, streamer));
            streamers.len() != before
        };
        streamer.wait_until_idle();
        if removed {
            self.pool.unregister_streamer();
        }
    }

    pub fn submit(&self, n_hints: u32) {
        self.shared.signal.release(n_hints);
    }

    pub fn registered_count(&self) -> usize {
        self.shared.streamers().len()
    }

    pub fn pool(&self) -> &HostFunctionThreadPool {
        &self.pool
    }

    /// Stop the scheduler and the pool, join them, then clear queue and registry.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.signal.wake_all();
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(join) = join else {
            return;
        };
        if join.join().is_err() {
            log::warn!("HostFunctionScheduler: scheduler thread panicked");
        }
        self.pool.shutdown();
        self.shared.streamers().clear();
        log::debug!("HostFunctionScheduler: stopped");
    }
}

impl Drop for HostFunctionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-streamer handle onto the shared scheduler.
pub struct ScheduledWorker {
    scheduler: Arc<HostFunctionScheduler>,
    streamer: Mutex<Option<Arc<HostFunctionStreamer>>>,
    started: AtomicBool,
}

impl ScheduledWorker {
    pub fn new(scheduler: Arc<HostFunctionScheduler>) -> Self {
        Self {
            scheduler,
            streamer: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

impl HostFunctionWorker for ScheduledWorker {
    fn start(&self, streamer: Arc<HostFunctionStreamer>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HostFnError::WorkerAlreadyStarted);
        }
        self.scheduler.register_streamer(Arc::clone(&streamer))?;
        *self.streamer.lock().unwrap_or_else(PoisonError::into_inner) = Some(streamer);
        Ok(())
    }

    fn finish(&self) {
        let streamer = self
            .streamer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(streamer) = streamer {
            self.scheduler.unregister_streamer(&streamer);
        }
    }

    fn submit(&self, n_hints: u32) {
        self.scheduler.submit(n_hints);
    }
}

impl Drop for ScheduledWorker {
    fn drop(&mut self) {
        self.finish();
    }
}
