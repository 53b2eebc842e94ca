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

//! Chunked pool of per-partition status words.
//!
//! A backing allocation holds `chunks_per_allocation` chunks; a chunk holds one
//! 64-byte line per partition, the status word at the start of each line.
//! Chunks go back to a free list when dropped. Backing allocations are only
//! released together with the allocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::{HostFnError, Result};

/// Distance between the status words of two consecutive partitions.
pub const PARTITION_OFFSET_BYTES: usize = 64;

#[derive(Default)]
#[repr(C, align(64))]
struct StatusLine {
    word: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<StatusLine>() == PARTITION_OFFSET_BYTES);

/// Identifies one backing allocation of the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationHandle {
    pub id: u64,
    pub size_bytes: usize,
}

struct StatusAllocation {
    handle: AllocationHandle,
    lines: Box<[StatusLine]>,
}

struct PoolState {
    allocations: Vec<Arc<StatusAllocation>>,
    // (allocation index, chunk index)
    free: Vec<(usize, usize)>,
    in_use: usize,
}

struct AllocatorShared {
    partitions_per_chunk: usize,
    chunks_per_allocation: usize,
    pool: Mutex<PoolState>,
    next_allocation_id: AtomicU64,
}

impl AllocatorShared {
    fn allocate_backing(&self, state: &mut PoolState) -> Result<()> {
        let line_count = self.partitions_per_chunk * self.chunks_per_allocation;
        let mut lines = Vec::new();
        lines.try_reserve_exact(line_count).map_err(|e| {
            HostFnError::MemoryAllocation(format!(
                "failed to reserve {} status lines ({} bytes): {}",
                line_count,
                line_count * PARTITION_OFFSET_BYTES,
                e
            ))
        })?;
        lines.resize_with(line_count, StatusLine::default);

        let handle = AllocationHandle {
            id: self.next_allocation_id.fetch_add(1, Ordering::Relaxed),
            size_bytes: line_count * PARTITION_OFFSET_BYTES,
        };
        let index = state.allocations.len();
        state.allocations.push(Arc::new(StatusAllocation {
            handle,
            lines: lines.into_boxed_slice(),
        }));
        // Reverse so chunks are handed out in address order.
        state
            .free
            .extend((0..self.chunks_per_allocation).rev().map(|chunk| (index, chunk)));
        log::debug!(
            "HostFunctionAllocator: new backing allocation {} ({} chunks x {} partitions)",
            handle.id,
            self.chunks_per_allocation,
            self.partitions_per_chunk
        );
        Ok(())
    }

    fn release(&self, allocation_index: usize, chunk_index: usize) {
        let mut state = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        state.free.push((allocation_index, chunk_index));
        state.in_use -= 1;
    }
}

/// Hands out zero-initialized status-word chunks, one per streamer.
#[derive(Clone)]
pub struct HostFunctionAllocator {
    shared: Arc<AllocatorShared>,
}

impl HostFunctionAllocator {
    /// Create an allocator whose chunks hold `partitions_per_chunk` status words.
    ///
    /// No memory is reserved until the first `obtain_chunk`.
    pub fn new(partitions_per_chunk: usize, chunks_per_allocation: usize) -> Result<Self> {
        if partitions_per_chunk == 0 {
            return Err(HostFnError::InvalidConfig(
                "partitions_per_chunk must be at least 1".to_string(),
            ));
        }
        if chunks_per_allocation == 0 {
            return Err(HostFnError::InvalidConfig(
                "chunks_per_allocation must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            shared: Arc::new(AllocatorShared {
                partitions_per_chunk,
                chunks_per_allocation,
                pool: Mutex::new(PoolState {
                    allocations: Vec::new(),
                    free: Vec::new(),
                    in_use: 0,
                }),
                next_allocation_id: AtomicU64::new(0),
            }),
        })
    }

    pub fn partitions_per_chunk(&self) -> usize {
        self.shared.partitions_per_chunk
    }

    /// Obtain a chunk exposing `partition_count` status words, all zero.
    pub fn obtain_chunk(&self, partition_count: usize) -> Result<StatusChunk> {
        if partition_count == 0 || partition_count > self.shared.partitions_per_chunk {
            return Err(HostFnError::InvalidConfig(format!(
                "partition count must be 1..={}, got {}",
                self.shared.partitions_per_chunk, partition_count
            )));
        }
        let mut state = self
            .shared
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.free.is_empty() {
            self.shared.allocate_backing(&mut state)?;
        }
        let Some((allocation_index, chunk_index)) = state.free.pop() else {
            return Err(HostFnError::MemoryAllocation(
                "status chunk pool exhausted".to_string(),
            ));
        };
        state.in_use += 1;
        let allocation = Arc::clone(&state.allocations[allocation_index]);
        drop(state);

        let chunk = StatusChunk {
            allocation,
            allocation_index,
            chunk_index,
            first_line: chunk_index * self.shared.partitions_per_chunk,
            partition_count,
            pool: Arc::downgrade(&self.shared),
        };
        for word in chunk.words() {
            word.store(0, Ordering::Release);
        }
        Ok(chunk)
    }

    /// (chunks in use, chunks backed by memory)
    pub fn stats(&self) -> (usize, usize) {
        let state = self
            .shared
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (
            state.in_use,
            state.allocations.len() * self.shared.chunks_per_allocation,
        )
    }
}

/// Status words of one streamer, one per partition, bounds checked.
pub struct StatusChunk {
    allocation: Arc<StatusAllocation>,
    allocation_index: usize,
    chunk_index: usize,
    first_line: usize,
    partition_count: usize,
    pool: Weak<AllocatorShared>,
}

impl StatusChunk {
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Status word of `partition`.
    pub fn word_at(&self, partition: usize) -> Result<&AtomicU64> {
        if partition >= self.partition_count {
            return Err(HostFnError::PartitionOutOfRange {
                index: partition,
                count: self.partition_count,
            });
        }
        Ok(&self.allocation.lines[self.first_line + partition].word)
    }

    /// All partition words in partition order.
    pub fn words(&self) -> impl Iterator<Item = &AtomicU64> + '_ {
        self.allocation.lines[self.first_line..self.first_line + self.partition_count]
            .iter()
            .map(|line| &line.word)
    }

    /// Address the GPU uses for the status word of `partition`.
    ///
    /// Status memory is shared host/device memory with a unified virtual
    /// address, so this is also the host address of the word.
    pub fn gpu_address(&self, partition: usize) -> Result<u64> {
        self.word_at(partition).map(address_of)
    }

    /// Backing allocation of this chunk.
    pub fn allocation(&self) -> AllocationHandle {
        self.allocation.handle
    }

    /// Byte offset of the chunk inside its backing allocation.
    pub fn offset_bytes(&self) -> usize {
        self.first_line * PARTITION_OFFSET_BYTES
    }

    /// Host pointer to the first status word.
    pub fn host_ptr(&self) -> *const AtomicU64 {
        &self.allocation.lines[self.first_line].word
    }
}

impl Drop for StatusChunk {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.allocation_index, self.chunk_index);
        }
    }
}

impl std::fmt::Debug for StatusChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusChunk")
            .field("allocation", &self.allocation.handle)
            .field("offset_bytes", &self.offset_bytes())
            .field("partition_count", &self.partition_count)
            .finish()
    }
}

pub(crate) fn address_of(word: &AtomicU64) -> u64 {
    word as *const AtomicU64 as u64
}
