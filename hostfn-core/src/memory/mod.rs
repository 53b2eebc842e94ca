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

//! Shared status storage: partitioned status-word chunks and the device memory boundary.

pub mod allocator;
pub mod simulated;

use std::fmt;
use std::sync::{Arc, Mutex};

pub use allocator::{AllocationHandle, HostFunctionAllocator, PARTITION_OFFSET_BYTES, StatusChunk};
pub use simulated::SimulatedDeviceMemory;

/// Memory/runtime layer used when status words live in a simulated device image.
pub trait DeviceMemory: Send + Sync {
    /// Pull GPU-written status words of `chunk` into host-visible memory.
    fn download_allocation(&self, chunk: &StatusChunk);

    /// Push host-written status words of `chunk` back to the device image.
    fn upload_allocation(&self, chunk: &StatusChunk);
}

/// Whether status words are directly host-visible or need download/upload.
#[derive(Clone, Default)]
pub enum ExecutionMode {
    /// Status words are shared memory the GPU reads and writes in place.
    #[default]
    Hardware,
    /// Status words mirror a device image (TBX/simulated execution).
    Simulated {
        memory: Arc<dyn DeviceMemory>,
        /// Serializes download/upload pairs of one execution context.
        download_lock: Arc<Mutex<()>>,
    },
}

impl ExecutionMode {
    /// Simulated mode with a fresh download lock.
    pub fn simulated(memory: Arc<dyn DeviceMemory>) -> Self {
        ExecutionMode::Simulated {
            memory,
            download_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, ExecutionMode::Simulated { .. })
    }
}

impl fmt::Debug for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Hardware => f.write_str("Hardware"),
            ExecutionMode::Simulated { .. } => f.write_str("Simulated"),
        }
    }
}
