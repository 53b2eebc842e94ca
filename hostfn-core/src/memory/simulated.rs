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

//! Device image for simulated (TBX-style) execution.
//!
//! The "GPU" writes into a private image keyed by status-word address. Host
//! words only see those writes after `download_allocation`, and host completion
//! writes only reach the image after `upload_allocation`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::DeviceMemory;
use super::allocator::{StatusChunk, address_of};
use crate::error::Result;

#[derive(Default)]
pub struct SimulatedDeviceMemory {
    image: Mutex<HashMap<u64, u64>>,
    downloads: AtomicU64,
    uploads: AtomicU64,
}

impl SimulatedDeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device-side write of a status word, invisible to the host until downloaded.
    pub fn gpu_write(&self, chunk: &StatusChunk, partition: usize, value: u64) -> Result<()> {
        let address = chunk.gpu_address(partition)?;
        self.image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, value);
        Ok(())
    }

    /// Device-side read of a status word.
    pub fn gpu_read(&self, chunk: &StatusChunk, partition: usize) -> Result<u64> {
        let address = chunk.gpu_address(partition)?;
        Ok(self
            .image
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    pub fn download_count(&self) -> u64 {
        self.downloads.load(Ordering::Relaxed)
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }
}

impl DeviceMemory for SimulatedDeviceMemory {
    fn download_allocation(&self, chunk: &StatusChunk) {
        let image = self.image.lock().unwrap_or_else(PoisonError::into_inner);
        for word in chunk.words() {
            let value = image.get(&address_of(word)).copied().unwrap_or(0);
            word.store(value, Ordering::Release);
        }
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    fn upload_allocation(&self, chunk: &StatusChunk) {
        let mut image = self.image.lock().unwrap_or_else(PoisonError::into_inner);
        for word in chunk.words() {
            image.insert(address_of(word), word.load(Ordering::Acquire));
        }
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }
}
