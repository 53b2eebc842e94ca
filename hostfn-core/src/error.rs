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

use thiserror::Error;

/// Errors surfaced by the host function bridge.
///
/// Protocol violations (duplicate ids, retrieval of an unknown id) are not
/// represented here; they panic at the call site.
#[derive(Error, Debug)]
pub enum HostFnError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Status memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error("Partition {index} out of range for {count} partition(s)")]
    PartitionOutOfRange { index: usize, count: usize },

    #[error("Worker already started")]
    WorkerAlreadyStarted,

    #[error("Bridge is shut down")]
    ShutDown,

    #[error("Failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, HostFnError>;
