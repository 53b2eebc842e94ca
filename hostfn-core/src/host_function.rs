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

//! Host callbacks requested by a GPU command stream.

use std::ffi::c_void;
use std::fmt;

/// C-ABI entry point of a host function, called with its user data.
pub type HostFunctionAddress = unsafe extern "C" fn(*mut c_void);

/// Sentinel status word value: completed, nothing pending.
pub const HOST_FUNCTION_COMPLETED: u64 = 0;

enum Callback {
    Raw {
        address: HostFunctionAddress,
        user_data: *mut c_void,
    },
    Closure(Box<dyn FnOnce() + Send + 'static>),
}

/// A registered host callback.
///
/// Invoking consumes the function, so a registered entry can run at most once.
pub struct HostFunction {
    callback: Callback,
}

// Raw user data is owned by the caller of `from_raw`, who guarantees it may be
// used from the executing worker thread.
unsafe impl Send for HostFunction {}

impl HostFunction {
    /// Wrap a C-ABI `(address, user_data)` pair.
    ///
    /// # Safety
    /// `address` must be safe to call with `user_data` from any thread, and
    /// `user_data` must stay valid until the function has been invoked or dropped.
    pub unsafe fn from_raw(address: HostFunctionAddress, user_data: *mut c_void) -> Self {
        Self {
            callback: Callback::Raw { address, user_data },
        }
    }

    /// Wrap a Rust closure.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            callback: Callback::Closure(Box::new(f)),
        }
    }

    /// Raw address and user data, if this function came from `from_raw`.
    pub fn raw_parts(&self) -> Option<(HostFunctionAddress, *mut c_void)> {
        match self.callback {
            Callback::Raw { address, user_data } => Some((address, user_data)),
            Callback::Closure(_) => None,
        }
    }

    /// Run the callback on the current thread.
    pub fn invoke(self) {
        match self.callback {
            Callback::Raw { address, user_data } => unsafe { address(user_data) },
            Callback::Closure(f) => f(),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.callback {
            Callback::Raw { address, user_data } => f
                .debug_struct("HostFunction")
                .field("address", &(*address as *const c_void))
                .field("user_data", user_data)
                .finish(),
            Callback::Closure(_) => f.debug_struct("HostFunction").finish_non_exhaustive(),
        }
    }
}
