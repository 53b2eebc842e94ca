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

//! Host function execution bridge.
//!
//! A GPU command stream requests a host callback by writing the callback's id
//! into one status word per partition and waiting for the words to return to
//! zero. Host workers detect the request, run the callback exactly once and
//! write the zeros back.

pub mod channel;
pub mod config;
pub mod error;
pub mod host_function;
pub mod memory;
mod platform;
pub mod streamer;
pub mod worker;

pub use channel::HostFunctionChannel;
pub use config::{BridgeConfig, ThreadPoolSize, WorkerMode};
pub use error::{HostFnError, Result};
pub use host_function::{HOST_FUNCTION_COMPLETED, HostFunction, HostFunctionAddress};
pub use memory::{
    DeviceMemory, ExecutionMode, HostFunctionAllocator, SimulatedDeviceMemory, StatusChunk,
};
pub use streamer::HostFunctionStreamer;
pub use worker::{HostFunctionScheduler, HostFunctionWorker};

use std::sync::{Arc, Mutex, PoisonError};

use crate::worker::{
    AtomicWaitWorker, ConditionVariableWorker, CountingSignalWorker, ScheduledWorker,
};

/// Owns the status-word pool and, in scheduler mode, the shared scheduler of
/// one execution environment.
pub struct HostFunctionBridge {
    config: BridgeConfig,
    allocator: HostFunctionAllocator,
    execution_mode: ExecutionMode,
    scheduler: Mutex<Option<Arc<HostFunctionScheduler>>>,
}

impl HostFunctionBridge {
    /// Create a bridge for hardware execution (status words visible in place).
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_execution_mode(config, ExecutionMode::Hardware)
    }

    /// Create a bridge from `BridgeConfig::from_env()`.
    pub fn from_env() -> Result<Self> {
        Self::new(BridgeConfig::from_env())
    }

    /// Create a bridge with an explicit execution mode.
    ///
    /// # Arguments
    /// * `config` - Validated before use
    /// * `execution_mode` - `Simulated` adds a download before every readiness
    ///   check and an upload after every completion
    pub fn with_execution_mode(
        config: BridgeConfig,
        execution_mode: ExecutionMode,
    ) -> Result<Self> {
        config.validate()?;
        let allocator =
            HostFunctionAllocator::new(config.max_partitions, config.chunks_per_allocation)?;
        log::debug!(
            "HostFunctionBridge: {:?} worker, {:?} execution, up to {} partition(s)",
            config.worker_mode,
            execution_mode,
            config.max_partitions
        );
        Ok(Self {
            config,
            allocator,
            execution_mode,
            scheduler: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn allocator(&self) -> &HostFunctionAllocator {
        &self.allocator
    }

    pub fn execution_mode(&self) -> &ExecutionMode {
        &self.execution_mode
    }

    /// Streamer with its own status-word chunk of `partition_count` words.
    pub fn create_streamer(&self, partition_count: usize) -> Result<Arc<HostFunctionStreamer>> {
        let chunk = self.allocator.obtain_chunk(partition_count)?;
        Ok(Arc::new(HostFunctionStreamer::new(
            chunk,
            self.execution_mode.clone(),
        )))
    }

    /// Worker for the configured `WorkerMode`, not yet started.
    pub fn create_worker(&self) -> Result<Box<dyn HostFunctionWorker>> {
        let skip = self.config.skip_execution;
        let worker: Box<dyn HostFunctionWorker> = match self.config.worker_mode {
            WorkerMode::CountingSignal => Box::new(CountingSignalWorker::new(skip)),
            WorkerMode::ConditionVariable => Box::new(ConditionVariableWorker::new(skip)),
            WorkerMode::AtomicWait => Box::new(AtomicWaitWorker::new(skip)),
            WorkerMode::SchedulerWithThreadPool => {
                Box::new(ScheduledWorker::new(self.scheduler()?))
            }
        };
        Ok(worker)
    }

    /// Streamer plus a started worker for one command stream.
    pub fn create_channel(&self, partition_count: usize) -> Result<HostFunctionChannel> {
        let streamer = self.create_streamer(partition_count)?;
        HostFunctionChannel::new(streamer, self.create_worker()?)
    }

    /// Shared scheduler, created on first use.
    pub fn scheduler(&self) -> Result<Arc<HostFunctionScheduler>> {
        let mut slot = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scheduler) = slot.as_ref() {
            return Ok(Arc::clone(scheduler));
        }
        let scheduler = Arc::new(HostFunctionScheduler::new(&self.config)?);
        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    pub fn has_scheduler(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop and release the shared scheduler, if one was created. The next
    /// `scheduler()` call creates a fresh one.
    pub fn teardown_scheduler(&self) {
        let scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
    }
}

impl Drop for HostFunctionBridge {
    fn drop(&mut self) {
        self.teardown_scheduler();
    }
}
