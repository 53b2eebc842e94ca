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

//! Host function workers: detect a ready function, run it, signal completion.

pub mod dedicated;
pub mod scheduler;
pub mod signal;
pub mod thread_pool;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::host_function::{HOST_FUNCTION_COMPLETED, HostFunction};
use crate::streamer::HostFunctionStreamer;

pub use dedicated::{
    AtomicWaitWorker, ConditionVariableWorker, CountingSignalWorker, DedicatedWorker,
};
pub use scheduler::{HostFunctionScheduler, ScheduledWorker};
pub use signal::{AtomicSignal, CondvarSignal, CountingSignal, WaitSignal};
pub use thread_pool::HostFunctionThreadPool;

/// Drives one streamer's host functions.
pub trait HostFunctionWorker: Send + Sync {
    /// Begin serving `streamer`. A worker serves exactly one streamer.
    fn start(&self, streamer: Arc<HostFunctionStreamer>) -> Result<()>;

    /// Stop serving. Idempotent. Returns only once no callback of the streamer
    /// is running or queued; a claimed function still runs to completion.
    fn finish(&self);

    /// Hint that up to `n_hints` more functions may become ready.
    fn submit(&self, n_hints: u32);
}

/// Take the ready function of `streamer`, if any, and mark it in flight.
pub(crate) fn claim_ready_function(streamer: &HostFunctionStreamer) -> Option<HostFunction> {
    let id = streamer.host_function_ready_to_execute();
    if id == HOST_FUNCTION_COMPLETED {
        return None;
    }
    let function = streamer.host_function(id);
    streamer.prepare_for_execution();
    log::trace!("claimed host function {}", id);
    Some(function)
}

/// Invoke a claimed function and publish its completion.
///
/// A panicking callback is logged; completion is signaled either way.
pub(crate) fn execute_host_function(
    streamer: &HostFunctionStreamer,
    function: HostFunction,
    skip_execution: bool,
) {
    if skip_execution {
        drop(function);
    } else if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| function.invoke())) {
        log::warn!("host function panicked: {}", panic_message(&payload));
    }
    streamer.signal_host_function_completion();
}

/// Release a claimed function without running it, so the device side still
/// sees completion.
pub(crate) fn abandon_host_function(streamer: &HostFunctionStreamer, function: HostFunction) {
    drop(function);
    streamer.signal_host_function_completion();
    log::debug!("host function released without running (shutdown)");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;
const MIN_SLEEP: Duration = Duration::from_micros(20);
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Adaptive wait used while a hinted function is not yet visible:
/// spin, then yield, then sleep with doubling intervals up to 1 ms.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else if self.step <= YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let exp = (self.step - YIELD_LIMIT - 1).min(16);
            let sleep = MIN_SLEEP.saturating_mul(1u32 << exp).min(MAX_SLEEP);
            std::thread::sleep(sleep);
        }
        if self.step < YIELD_LIMIT + 17 {
            self.step += 1;
        }
    }
}
