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

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use hostfn_core::streamer::FIRST_FUNCTION_ID;
use hostfn_core::{
    BridgeConfig, ExecutionMode, HostFunctionBridge, HostFunctionStreamer, SimulatedDeviceMemory,
    ThreadPoolSize, WorkerMode,
};

pub const TIMEOUT: Duration = Duration::from_secs(20);

pub const ALL_MODES: [WorkerMode; 4] = [
    WorkerMode::CountingSignal,
    WorkerMode::ConditionVariable,
    WorkerMode::AtomicWait,
    WorkerMode::SchedulerWithThreadPool,
];

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_micros(200));
    }
    cond()
}

/// The n-th id a fresh streamer hands out.
pub fn nth_id(n: usize) -> u64 {
    FIRST_FUNCTION_ID + 2 * n as u64
}

/// Device side of the status words.
#[derive(Clone)]
pub enum Gpu {
    /// Writes land directly in host-visible memory.
    Direct,
    /// Writes land in a device image the host has to download.
    Simulated(Arc<SimulatedDeviceMemory>),
}

impl Gpu {
    /// Write `id` into every partition, one partition at a time.
    pub fn signal(&self, streamer: &HostFunctionStreamer, id: u64) {
        for partition in 0..streamer.partition_count() {
            match self {
                Gpu::Direct => streamer
                    .status_words()
                    .word_at(partition)
                    .unwrap()
                    .store(id, Ordering::SeqCst),
                Gpu::Simulated(memory) => memory
                    .gpu_write(streamer.status_words(), partition, id)
                    .unwrap(),
            }
        }
    }

    /// Every partition reads completed from the device's point of view.
    pub fn completed(&self, streamer: &HostFunctionStreamer) -> bool {
        match self {
            Gpu::Direct => streamer.is_completed(),
            Gpu::Simulated(memory) => (0..streamer.partition_count())
                .all(|p| memory.gpu_read(streamer.status_words(), p).unwrap() == 0),
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        match self {
            Gpu::Direct => ExecutionMode::Hardware,
            Gpu::Simulated(memory) => ExecutionMode::simulated(memory.clone()),
        }
    }
}

/// Play the GPU for `streamers`: request ids 0..count in order on each one,
/// waiting for the host to reset every partition between two requests.
/// Returns true once every request was retired.
pub fn spawn_gpu(
    gpu: Gpu,
    streamers: Vec<Arc<HostFunctionStreamer>>,
    count: usize,
) -> thread::JoinHandle<bool> {
    thread::spawn(move || {
        let mut next = vec![0usize; streamers.len()];
        let mut in_flight = vec![false; streamers.len()];
        let start = Instant::now();
        while start.elapsed() < TIMEOUT {
            for (i, streamer) in streamers.iter().enumerate() {
                if in_flight[i] && gpu.completed(streamer) {
                    in_flight[i] = false;
                    next[i] += 1;
                }
                if !in_flight[i] && next[i] < count {
                    gpu.signal(streamer, nth_id(next[i]));
                    in_flight[i] = true;
                }
            }
            if next.iter().all(|&n| n == count) {
                return true;
            }
            thread::sleep(Duration::from_micros(50));
        }
        false
    })
}

pub fn bridge(mode: WorkerMode, gpu: &Gpu) -> HostFunctionBridge {
    bridge_with(BridgeConfig::default().with_worker_mode(mode), gpu)
}

pub fn bridge_with(config: BridgeConfig, gpu: &Gpu) -> HostFunctionBridge {
    let config = BridgeConfig {
        max_partitions: 2,
        ..config
    };
    HostFunctionBridge::with_execution_mode(config, gpu.execution_mode()).unwrap()
}

pub fn fixed_pool(mode: WorkerMode, threads: usize) -> BridgeConfig {
    BridgeConfig::default()
        .with_worker_mode(mode)
        .with_thread_pool_size(ThreadPoolSize::Fixed(threads))
}
