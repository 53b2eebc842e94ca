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

//! One thread per streamer, parked on a `WaitSignal` while idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use super::signal::{AtomicSignal, CondvarSignal, CountingSignal, WaitSignal};
use super::{Backoff, HostFunctionWorker, claim_ready_function, execute_host_function};
use crate::error::{HostFnError, Result};
use crate::streamer::HostFunctionStreamer;

pub type CountingSignalWorker = DedicatedWorker<CountingSignal>;
pub type ConditionVariableWorker = DedicatedWorker<CondvarSignal>;
pub type AtomicWaitWorker = DedicatedWorker<AtomicSignal>;

pub struct DedicatedWorker<S: WaitSignal> {
    signal: Arc<S>,
    stop: Arc<AtomicBool>,
    started: AtomicBool,
    join: Mutex<Option<thread::JoinHandle<()>>>,
    skip_execution: bool,
}

impl<S: WaitSignal + Default> DedicatedWorker<S> {
    pub fn new(skip_execution: bool) -> Self {
        Self::with_signal(S::default(), skip_execution)
    }
}

impl<S: WaitSignal> DedicatedWorker<S> {
    pub fn with_signal(signal: S, skip_execution: bool) -> Self {
        Self {
            signal: Arc::new(signal),
            stop: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
            join: Mutex::new(None),
            skip_execution,
        }
    }

    pub fn is_running(&self) -> bool {
        self.join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// One hint = one execution: after a wake the worker polls, with backoff,
/// until a function is ready or stop is requested.
fn worker_loop<S: WaitSignal>(
    streamer: Arc<HostFunctionStreamer>,
    signal: Arc<S>,
    stop: Arc<AtomicBool>,
    skip_execution: bool,
) {
    while signal.acquire(&stop) {
        let mut backoff = Backoff::new();
        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            // A claimed function always runs to completion, stop or not.
            if let Some(function) = claim_ready_function(&streamer) {
                execute_host_function(&streamer, function, skip_execution);
                break;
            }
            backoff.snooze();
        }
    }
}

impl<S: WaitSignal> HostFunctionWorker for DedicatedWorker<S> {
    fn start(&self, streamer: Arc<HostFunctionStreamer>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(HostFnError::WorkerAlreadyStarted);
        }
        let signal = Arc::clone(&self.signal);
        let stop = Arc::clone(&self.stop);
        let skip_execution = self.skip_execution;
        let name = "hostfn-worker".to_string();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(streamer, signal, stop, skip_execution))
            .map_err(|source| HostFnError::ThreadSpawn { name, source })?;
        *self.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
        log::debug!("DedicatedWorker: started ({})", std::any::type_name::<S>());
        Ok(())
    }

    fn finish(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.signal.wake_all();
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            if join.join().is_err() {
                log::warn!("DedicatedWorker: worker thread panicked");
            }
            log::debug!("DedicatedWorker: stopped");
        }
    }

    fn submit(&self, n_hints: u32) {
        self.signal.release(n_hints);
    }
}

impl<S: WaitSignal> Drop for DedicatedWorker<S> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_function::HostFunction;
    use crate::memory::{ExecutionMode, HostFunctionAllocator};
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn runs_one_function<S: WaitSignal + Default>() {
        let allocator = HostFunctionAllocator::new(2, 1).unwrap();
        let streamer = Arc::new(HostFunctionStreamer::new(
            allocator.obtain_chunk(2).unwrap(),
            ExecutionMode::Hardware,
        ));
        let worker = DedicatedWorker::<S>::new(false);
        worker.start(Arc::clone(&streamer)).unwrap();
        assert!(matches!(
            worker.start(Arc::clone(&streamer)),
            Err(HostFnError::WorkerAlreadyStarted)
        ));

        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let id = streamer.next_function_id_and_increment();
        streamer.add_host_function(id, HostFunction::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        worker.submit(1);
        for word in streamer.status_words().words() {
            word.store(id, Ordering::SeqCst);
        }

        assert!(wait_until(Duration::from_secs(5), || streamer.is_completed()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(worker.is_running());
        worker.finish();
        worker.finish();
        assert!(!worker.is_running());
    }

    #[test]
    fn counting_worker_runs_function() {
        runs_one_function::<CountingSignal>();
    }

    #[test]
    fn condvar_worker_runs_function() {
        runs_one_function::<CondvarSignal>();
    }

    #[test]
    fn atomic_worker_runs_function() {
        runs_one_function::<AtomicSignal>();
    }

    #[test]
    fn finish_without_start_is_noop() {
        let worker = CountingSignalWorker::new(false);
        worker.finish();
        assert!(!worker.is_running());
    }

    #[test]
    fn finish_while_polling_returns_promptly() {
        let allocator = HostFunctionAllocator::new(1, 1).unwrap();
        let streamer = Arc::new(HostFunctionStreamer::new(
            allocator.obtain_chunk(1).unwrap(),
            ExecutionMode::Hardware,
        ));
        let worker = AtomicWaitWorker::new(false);
        worker.start(Arc::clone(&streamer)).unwrap();
        let id = streamer.next_function_id_and_increment();
        streamer.add_host_function(id, HostFunction::new(|| {}));
        // Hint without a GPU write: the worker keeps polling.
        worker.submit(1);
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        worker.finish();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(streamer.registered_count(), 1);
    }
}
