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

//! One command stream's view of the bridge: a streamer and the worker serving it.

use std::sync::Arc;

use crate::error::Result;
use crate::host_function::HostFunction;
use crate::streamer::HostFunctionStreamer;
use crate::worker::HostFunctionWorker;

pub struct HostFunctionChannel {
    streamer: Arc<HostFunctionStreamer>,
    worker: Box<dyn HostFunctionWorker>,
}

impl HostFunctionChannel {
    /// Start `worker` on `streamer`.
    pub fn new(
        streamer: Arc<HostFunctionStreamer>,
        worker: Box<dyn HostFunctionWorker>,
    ) -> Result<Self> {
        worker.start(Arc::clone(&streamer))?;
        Ok(Self { streamer, worker })
    }

    /// Register `function` under a fresh id and return the id the GPU-side
    /// command must write into every partition's status word.
    pub fn enqueue(&self, function: HostFunction) -> u64 {
        let id = self.streamer.next_function_id_and_increment();
        self.streamer.add_host_function(id, function);
        id
    }

    /// Hint that up to `n_hints` enqueued functions may become ready.
    pub fn submit(&self, n_hints: u32) {
        self.worker.submit(n_hints);
    }

    pub fn streamer(&self) -> &Arc<HostFunctionStreamer> {
        &self.streamer
    }

    /// GPU addresses of the per-partition status words.
    pub fn status_addresses(&self) -> Result<Vec<u64>> {
        self.streamer.status_addresses()
    }

    /// Stop the worker. Idempotent.
    pub fn finish(&self) {
        self.worker.finish();
    }
}

impl Drop for HostFunctionChannel {
    fn drop(&mut self) {
        self.worker.finish();
    }
}
