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

//! Bridge configuration with environment overrides.

use crate::error::{HostFnError, Result};

pub const DEFAULT_MAX_PARTITIONS: usize = 4;
pub const DEFAULT_CHUNKS_PER_ALLOCATION: usize = 64;
const MAX_PARTITIONS_LIMIT: usize = 64;
/// CPU ids must fit a `cpu_set_t` (CPU_SETSIZE).
pub const MAX_SCHEDULER_CPU_ID: usize = 1023;

/// How workers wait for work and who executes host functions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// Dedicated thread per streamer, blocked on a counting signal.
    #[default]
    CountingSignal,
    /// Dedicated thread per streamer, blocked on a condition variable.
    ConditionVariable,
    /// Dedicated thread per streamer, parked on an atomic counter.
    AtomicWait,
    /// One shared scheduler thread feeding a thread pool.
    SchedulerWithThreadPool,
}

impl WorkerMode {
    /// Accepts names (`counting`, `condvar`, `atomic`, `scheduler`) or `0`..`3`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "0" || s.eq_ignore_ascii_case("counting") {
            Some(WorkerMode::CountingSignal)
        } else if s == "1" || s.eq_ignore_ascii_case("condvar") {
            Some(WorkerMode::ConditionVariable)
        } else if s == "2" || s.eq_ignore_ascii_case("atomic") {
            Some(WorkerMode::AtomicWait)
        } else if s == "3" || s.eq_ignore_ascii_case("scheduler") {
            Some(WorkerMode::SchedulerWithThreadPool)
        } else {
            None
        }
    }
}

/// Executor thread count of the scheduler backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ThreadPoolSize {
    /// One executor thread per registered streamer.
    #[default]
    Unlimited,
    Fixed(usize),
}

impl ThreadPoolSize {
    /// `-1` or `unlimited`, otherwise a thread count.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s == "-1" || s.eq_ignore_ascii_case("unlimited") {
            return Some(ThreadPoolSize::Unlimited);
        }
        s.parse().ok().map(ThreadPoolSize::Fixed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    pub worker_mode: WorkerMode,
    pub thread_pool_size: ThreadPoolSize,
    /// Skip callback invocation; completion is still signaled.
    pub skip_execution: bool,
    /// Status words per chunk, i.e. the largest partition count of a streamer.
    pub max_partitions: usize,
    /// Chunks per backing allocation; sized for the number of live contexts.
    pub chunks_per_allocation: usize,
    /// CPU the scheduler thread pins itself to (`thread_affinity` feature).
    pub scheduler_cpu_id: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_mode: WorkerMode::default(),
            thread_pool_size: ThreadPoolSize::default(),
            skip_execution: false,
            max_partitions: DEFAULT_MAX_PARTITIONS,
            chunks_per_allocation: DEFAULT_CHUNKS_PER_ALLOCATION,
            scheduler_cpu_id: None,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_flag(s: &str) -> Option<bool> {
    let s = s.trim();
    if s == "1" || s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s == "0" || s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

impl BridgeConfig {
    /// Defaults overridden by HOSTFN_WORKER_MODE, HOSTFN_THREAD_POOL_SIZE,
    /// HOSTFN_SKIP_EXECUTION, HOSTFN_MAX_PARTITIONS, HOSTFN_CHUNKS_PER_ALLOCATION
    /// and HOSTFN_SCHEDULER_CPU_ID. Parse failure => keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_mode: env_var("HOSTFN_WORKER_MODE")
                .and_then(|s| WorkerMode::parse(&s))
                .unwrap_or(defaults.worker_mode),
            thread_pool_size: env_var("HOSTFN_THREAD_POOL_SIZE")
                .and_then(|s| ThreadPoolSize::parse(&s))
                .unwrap_or(defaults.thread_pool_size),
            skip_execution: env_var("HOSTFN_SKIP_EXECUTION")
                .and_then(|s| parse_flag(&s))
                .unwrap_or(defaults.skip_execution),
            max_partitions: env_var("HOSTFN_MAX_PARTITIONS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_partitions),
            chunks_per_allocation: env_var("HOSTFN_CHUNKS_PER_ALLOCATION")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.chunks_per_allocation),
            scheduler_cpu_id: env_var("HOSTFN_SCHEDULER_CPU_ID")
                .and_then(|s| s.trim().parse().ok()),
        }
    }

    /// Validate: partitions 1..=64, chunks per allocation >= 1, fixed pool >= 1,
    /// scheduler CPU id <= 1023.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PARTITIONS_LIMIT).contains(&self.max_partitions) {
            return Err(HostFnError::InvalidConfig(format!(
                "max_partitions must be 1..={}, got {}",
                MAX_PARTITIONS_LIMIT, self.max_partitions
            )));
        }
        if self.chunks_per_allocation == 0 {
            return Err(HostFnError::InvalidConfig(
                "chunks_per_allocation must be at least 1".to_string(),
            ));
        }
        if self.thread_pool_size == ThreadPoolSize::Fixed(0) {
            return Err(HostFnError::InvalidConfig(
                "fixed thread pool size must be at least 1".to_string(),
            ));
        }
        if let Some(cpu_id) = self.scheduler_cpu_id.filter(|&id| id > MAX_SCHEDULER_CPU_ID) {
            return Err(HostFnError::InvalidConfig(format!(
                "scheduler_cpu_id must be 0..={}, got {}",
                MAX_SCHEDULER_CPU_ID, cpu_id
            )));
        }
        Ok(())
    }

    pub fn with_worker_mode(mut self, worker_mode: WorkerMode) -> Self {
        self.worker_mode = worker_mode;
        self
    }

    pub fn with_thread_pool_size(mut self, thread_pool_size: ThreadPoolSize) -> Self {
        self.thread_pool_size = thread_pool_size;
        self
    }

    pub fn with_skip_execution(mut self, skip_execution: bool) -> Self {
        self.skip_execution = skip_execution;
        self
    }
}
