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

//! Per command-stream host function bookkeeping and the status-word handshake.
//!
//! Lifecycle of one function id:
//! registered -> ready (every partition holds the id) -> claimed (removed from
//! the table, in-order flag set) -> executing -> completed (every partition
//! back to 0, in-order flag cleared).

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use crate::error::Result;
use crate::host_function::{HOST_FUNCTION_COMPLETED, HostFunction};
use crate::memory::{ExecutionMode, StatusChunk};

/// First id handed out; ids advance by 2 so bit 0 is never part of an id.
pub const FIRST_FUNCTION_ID: u64 = 2;
const FUNCTION_ID_STEP: u64 = 2;

pub struct HostFunctionStreamer {
    status: StatusChunk,
    functions: Mutex<HashMap<u64, HostFunction>>,
    next_function_id: AtomicU64,
    pending: AtomicU64,
    in_order_execution: AtomicBool,
    // Guards the in-flight -> idle transition for `wait_until_idle`.
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
    execution_mode: ExecutionMode,
}

impl HostFunctionStreamer {
    pub fn new(status: StatusChunk, execution_mode: ExecutionMode) -> Self {
        log::debug!(
            "HostFunctionStreamer: created ({} partition(s), {:?} mode, status at {:?})",
            status.partition_count(),
            execution_mode,
            status.host_ptr()
        );
        Self {
            status,
            functions: Mutex::new(HashMap::new()),
            next_function_id: AtomicU64::new(FIRST_FUNCTION_ID),
            pending: AtomicU64::new(0),
            in_order_execution: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            execution_mode,
        }
    }

    /// Next function id; every call returns a distinct, even, non-zero value.
    pub fn next_function_id_and_increment(&self) -> u64 {
        self.next_function_id
            .fetch_add(FUNCTION_ID_STEP, Ordering::Relaxed)
    }

    /// Register `function` under `id` and count it as pending.
    ///
    /// # Panics
    /// If `id` is already registered.
    pub fn add_host_function(&self, id: u64, function: HostFunction) {
        {
            let mut functions = self.functions.lock().unwrap_or_else(PoisonError::into_inner);
            match functions.entry(id) {
                Entry::Occupied(_) => panic!("host function id {} registered twice", id),
                Entry::Vacant(slot) => {
                    slot.insert(function);
                }
            }
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Id every partition agrees is ready, or `HOST_FUNCTION_COMPLETED`.
    pub fn host_function_ready_to_execute(&self) -> u64 {
        if self.pending.load(Ordering::Acquire) == 0
            || self.in_order_execution.load(Ordering::Acquire)
        {
            return HOST_FUNCTION_COMPLETED;
        }

        if let ExecutionMode::Simulated {
            memory,
            download_lock,
        } = &self.execution_mode
        {
            let _guard = download_lock.lock().unwrap_or_else(PoisonError::into_inner);
            memory.download_allocation(&self.status);
        }

        let mut words = self.status.words().map(|w| w.load(Ordering::Acquire));
        let Some(id) = words.next() else {
            return HOST_FUNCTION_COMPLETED;
        };
        if id == HOST_FUNCTION_COMPLETED {
            return HOST_FUNCTION_COMPLETED;
        }
        // Partitions still catching up with the id report not-ready.
        if words.all(|other| other == id) {
            id
        } else {
            HOST_FUNCTION_COMPLETED
        }
    }

    /// Remove the function registered under `id`.
    ///
    /// # Panics
    /// If nothing is registered under `id`: the status words and the table
    /// have diverged.
    pub fn host_function(&self, id: u64) -> HostFunction {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .unwrap_or_else(|| panic!("host function id {} is not registered", id))
    }

    /// Mark a claimed function as in flight. Call before invoking it.
    pub fn prepare_for_execution(&self) {
        let was_executing = self.in_order_execution.swap(true, Ordering::AcqRel);
        debug_assert!(!was_executing, "host function already in flight");
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Publish completion to every partition, then allow the next function.
    pub fn signal_host_function_completion(&self) {
        match &self.execution_mode {
            ExecutionMode::Hardware => self.clear_status_words(),
            ExecutionMode::Simulated {
                memory,
                download_lock,
            } => {
                let _guard = download_lock.lock().unwrap_or_else(PoisonError::into_inner);
                self.clear_status_words();
                memory.upload_allocation(&self.status);
            }
        }
        let _idle = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.in_order_execution.store(false, Ordering::Release);
        self.idle_cv.notify_all();
    }

    /// Block until no claimed function of this streamer is in flight.
    pub fn wait_until_idle(&self) {
        let mut idle = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        while self.in_order_execution.load(Ordering::Acquire) {
            idle = self.idle_cv.wait(idle).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn clear_status_words(&self) {
        for word in self.status.words() {
            word.store(HOST_FUNCTION_COMPLETED, Ordering::Release);
        }
    }

    pub fn partition_count(&self) -> usize {
        self.status.partition_count()
    }

    pub fn status_words(&self) -> &StatusChunk {
        &self.status
    }

    /// GPU addresses of the per-partition status words, in partition order.
    pub fn status_addresses(&self) -> Result<Vec<u64>> {
        (0..self.status.partition_count())
            .map(|p| self.status.gpu_address(p))
            .collect()
    }

    /// True when every host-visible status word reads completed.
    pub fn is_completed(&self) -> bool {
        self.status
            .words()
            .all(|w| w.load(Ordering::Acquire) == HOST_FUNCTION_COMPLETED)
    }

    pub fn pending_count(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_executing(&self) -> bool {
        self.in_order_execution.load(Ordering::Acquire)
    }

    pub fn registered_count(&self) -> usize {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl std::fmt::Debug for HostFunctionStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunctionStreamer")
            .field("status", &self.status)
            .field("pending", &self.pending_count())
            .field("executing", &self.is_executing())
            .field("mode", &self.execution_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{HostFunctionAllocator, SimulatedDeviceMemory};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn streamer(partitions: usize) -> (HostFunctionAllocator, HostFunctionStreamer) {
        let allocator = HostFunctionAllocator::new(4, 4).unwrap();
        let chunk = allocator.obtain_chunk(partitions).unwrap();
        (allocator, HostFunctionStreamer::new(chunk, ExecutionMode::Hardware))
    }

    fn gpu_write_all(streamer: &HostFunctionStreamer, id: u64) {
        for word in streamer.status_words().words() {
            word.store(id, Ordering::SeqCst);
        }
    }

    #[test]
    fn ids_are_even_and_step_by_two() {
        let (_a, s) = streamer(1);
        assert_eq!(s.next_function_id_and_increment(), 2);
        assert_eq!(s.next_function_id_and_increment(), 4);
        assert_eq!(s.next_function_id_and_increment(), 6);
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let (_a, s) = streamer(1);
        let s = Arc::new(s);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| s.next_function_id_and_increment())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut ids = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert_eq!(id % 2, 0);
                assert_ne!(id, HOST_FUNCTION_COMPLETED);
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 4000);
        assert_eq!(*ids.iter().max().unwrap(), FIRST_FUNCTION_ID + 2 * 3999);
    }

    #[test]
    fn nothing_ready_without_pending_work() {
        let (_a, s) = streamer(1);
        gpu_write_all(&s, 2);
        assert_eq!(s.host_function_ready_to_execute(), HOST_FUNCTION_COMPLETED);
    }

    #[test]
    fn ready_requires_every_partition() {
        let (_a, s) = streamer(2);
        let id = s.next_function_id_and_increment();
        s.add_host_function(id, HostFunction::new(|| {}));
        assert_eq!(s.host_function_ready_to_execute(), HOST_FUNCTION_COMPLETED);

        s.status_words().word_at(0).unwrap().store(id, Ordering::SeqCst);
        assert_eq!(s.host_function_ready_to_execute(), HOST_FUNCTION_COMPLETED);

        s.status_words().word_at(1).unwrap().store(id, Ordering::SeqCst);
        assert_eq!(s.host_function_ready_to_execute(), id);
    }

    #[test]
    fn disagreeing_partitions_are_not_ready() {
        let (_a, s) = streamer(2);
        s.add_host_function(2, HostFunction::new(|| {}));
        s.status_words().word_at(0).unwrap().store(2, Ordering::SeqCst);
        s.status_words().word_at(1).unwrap().store(4, Ordering::SeqCst);
        assert_eq!(s.host_function_ready_to_execute(), HOST_FUNCTION_COMPLETED);
    }

    #[test]
    fn claimed_function_blocks_rescan_until_completion() {
        let (_a, s) = streamer(2);
        let first = s.next_function_id_and_increment();
        let second = s.next_function_id_and_increment();
        s.add_host_function(first, HostFunction::new(|| {}));
        s.add_host_function(second, HostFunction::new(|| {}));
        gpu_write_all(&s, first);

        assert_eq!(s.host_function_ready_to_execute(), first);
        let f = s.host_function(first);
        s.prepare_for_execution();
        assert!(s.is_executing());
        assert_eq!(s.pending_count(), 1);
        assert_eq!(s.host_function_ready_to_execute(), HOST_FUNCTION_COMPLETED);

        f.invoke();
        s.signal_host_function_completion();
        assert!(!s.is_executing());
        assert!(s.is_completed());
        // Completed and no new id written yet: stays not-ready.
        for _ in 0..3 {
            assert_eq!(s.host_function_ready_to_execute(), HOST_FUNCTION_COMPLETED);
        }

        gpu_write_all(&s, second);
        assert_eq!(s.host_function_ready_to_execute(), second);
    }

    #[test]
    fn wait_until_idle_blocks_for_in_flight_function() {
        let (_a, s) = streamer(1);
        let s = Arc::new(s);
        s.wait_until_idle();

        let id = s.next_function_id_and_increment();
        s.add_host_function(id, HostFunction::new(|| {}));
        gpu_write_all(&s, id);
        assert_eq!(s.host_function_ready_to_execute(), id);
        let f = s.host_function(id);
        s.prepare_for_execution();

        let finisher = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                f.invoke();
                s.signal_host_function_completion();
            })
        };
        s.wait_until_idle();
        assert!(!s.is_executing());
        assert!(s.is_completed());
        finisher.join().unwrap();
    }

    #[test]
    fn pending_never_underflows() {
        let (_a, s) = streamer(1);
        s.prepare_for_execution();
        assert_eq!(s.pending_count(), 0);
        s.signal_host_function_completion();
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_id_panics() {
        let (_a, s) = streamer(1);
        s.add_host_function(2, HostFunction::new(|| {}));
        s.add_host_function(2, HostFunction::new(|| {}));
    }

    #[test]
    #[should_panic(expected = "not registered")]
    fn unknown_id_panics() {
        let (_a, s) = streamer(1);
        let _ = s.host_function(8);
    }

    #[test]
    fn function_is_returned_once() {
        let (_a, s) = streamer(1);
        s.add_host_function(2, HostFunction::new(|| {}));
        assert_eq!(s.registered_count(), 1);
        let _f = s.host_function(2);
        assert_eq!(s.registered_count(), 0);
    }

    #[test]
    fn simulated_mode_downloads_and_uploads() {
        let allocator = HostFunctionAllocator::new(2, 1).unwrap();
        let chunk = allocator.obtain_chunk(2).unwrap();
        let memory = Arc::new(SimulatedDeviceMemory::new());
        let s = HostFunctionStreamer::new(chunk, ExecutionMode::simulated(memory.clone()));

        let id = s.next_function_id_and_increment();
        s.add_host_function(id, HostFunction::new(|| {}));
        memory.gpu_write(s.status_words(), 0, id).unwrap();
        memory.gpu_write(s.status_words(), 1, id).unwrap();
        assert!(s.is_completed());

        assert_eq!(s.host_function_ready_to_execute(), id);
        assert!(memory.download_count() >= 1);

        let f = s.host_function(id);
        s.prepare_for_execution();
        f.invoke();
        s.signal_host_function_completion();
        assert_eq!(memory.upload_count(), 1);
        assert_eq!(memory.gpu_read(s.status_words(), 0).unwrap(), 0);
        assert_eq!(memory.gpu_read(s.status_words(), 1).unwrap(), 0);
    }

    #[test]
    fn status_addresses_follow_partitions() {
        let (_a, s) = streamer(3);
        let addresses = s.status_addresses().unwrap();
        assert_eq!(addresses.len(), 3);
        assert_eq!(addresses[0], s.status_words().host_ptr() as u64);
    }
}
