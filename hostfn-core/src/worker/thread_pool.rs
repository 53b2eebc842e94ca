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

//! Executor threads of the scheduler backend draining one FIFO queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::{abandon_host_function, execute_host_function};
use crate::config::ThreadPoolSize;
use crate::error::{HostFnError, Result};
use crate::host_function::HostFunction;
use crate::streamer::HostFunctionStreamer;

/// A claimed function and the streamer to signal once it ran.
pub struct PoolJob {
    pub streamer: Arc<HostFunctionStreamer>,
    pub function: HostFunction,
}

enum PoolMessage {
    Execute(PoolJob),
    Shutdown,
}

fn pool_loop(job_rx: Receiver<PoolMessage>, stop: Arc<AtomicBool>, skip_execution: bool) {
    while let Ok(message) = job_rx.recv() {
        match message {
            PoolMessage::Execute(job) if stop.load(Ordering::SeqCst) => {
                abandon_host_function(&job.streamer, job.function);
            }
            PoolMessage::Execute(job) => {
                execute_host_function(&job.streamer, job.function, skip_execution);
            }
            PoolMessage::Shutdown => break,
        }
    }
}

pub struct HostFunctionThreadPool {
    size: ThreadPoolSize,
    job_tx: Sender<PoolMessage>,
    job_rx: Receiver<PoolMessage>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    spawned: AtomicUsize,
    stop: Arc<AtomicBool>,
    skip_execution: bool,
}

impl HostFunctionThreadPool {
    /// Create the pool. A fixed pool spawns its threads now; an unlimited pool
    /// grows by one thread per `register_streamer`.
    pub fn new(size: ThreadPoolSize, skip_execution: bool) -> Result<Self> {
        if size == ThreadPoolSize::Fixed(0) {
            return Err(HostFnError::InvalidConfig(
                "fixed thread pool size must be at least 1".to_string(),
            ));
        }
        let (job_tx, job_rx) = unbounded();
        let pool = Self {
            size,
            job_tx,
            job_rx,
            workers: Mutex::new(Vec::new()),
            spawned: AtomicUsize::new(0),
            stop: Arc::new(AtomicBool::new(false)),
            skip_execution,
        };
        if let ThreadPoolSize::Fixed(n) = size {
            for _ in 0..n {
                pool.spawn_worker()?;
            }
        }
        Ok(pool)
    }

    fn spawn_worker(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stop.load(Ordering::SeqCst) {
            return Err(HostFnError::ShutDown);
        }
        workers.retain(|h| !h.is_finished());
        let name = format!("hostfn-pool-{}", self.spawned.fetch_add(1, Ordering::Relaxed));
        let job_rx = self.job_rx.clone();
        let stop = Arc::clone(&self.stop);
        let skip_execution = self.skip_execution;
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || pool_loop(job_rx, stop, skip_execution))
            .map_err(|source| HostFnError::ThreadSpawn { name, source })?;
        workers.push(join);
        Ok(())
    }

    /// Account for a new streamer; grows an unlimited pool by one thread.
    pub fn register_streamer(&self) -> Result<()> {
        match self.size {
            ThreadPoolSize::Unlimited => {
                self.spawn_worker()?;
                log::debug!("HostFunctionThreadPool: grew to {} thread(s)", self.thread_count());
                Ok(())
            }
            ThreadPoolSize::Fixed(_) => Ok(()),
        }
    }

    /// Streamer gone; an unlimited pool retires one thread once the jobs
    /// queued ahead of it have run.
    pub fn unregister_streamer(&self) {
        if self.size != ThreadPoolSize::Unlimited || self.stop.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.job_tx.send(PoolMessage::Shutdown);
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !h.is_finished());
    }

    /// Queue a claimed function; `job.streamer` must already be marked in flight.
    /// After shutdown the function is released without running.
    pub fn enqueue(&self, job: PoolJob) {
        if self.stop.load(Ordering::SeqCst) {
            abandon_host_function(&job.streamer, job.function);
            return;
        }
        // The pool owns a receiver, so the channel never disconnects.
        let _ = self.job_tx.send(PoolMessage::Execute(job));
    }

    /// Live executor threads.
    pub fn thread_count(&self) -> usize {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|h| !h.is_finished());
        workers.len()
    }

    /// Jobs queued but not yet picked up.
    pub fn queued(&self) -> usize {
        self.job_rx.len()
    }

    /// Stop and join every thread, then release the jobs still queued without
    /// running them. Idempotent.
    pub fn shutdown(&self) {
        let workers = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            self.stop.store(true, Ordering::SeqCst);
            std::mem::take(&mut *workers)
        };
        for _ in 0..workers.len() {
            let _ = self.job_tx.send(PoolMessage::Shutdown);
        }
        for join in workers {
            if join.join().is_err() {
                log::warn!("HostFunctionThreadPool: executor thread panicked");
            }
        }
        let mut released = 0;
        for message in self.job_rx.try_iter() {
            if let PoolMessage::Execute(job) = message {
                abandon_host_function(&job.streamer, job.function);
                released += 1;
            }
        }
        if released > 0 {
            log::debug!("HostFunctionThreadPool: released {} queued job(s) at shutdown", released);
        }
    }
}

impl Drop for HostFunctionThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
