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

//! Thread placement helpers.

#[cfg(all(target_os = "linux", feature = "thread_affinity"))]
pub(crate) fn set_thread_affinity_if_requested(cpu_id: Option<usize>) {
    let Some(cpu_id) = cpu_id else {
        return;
    };
    if cpu_id >= libc::CPU_SETSIZE as usize {
        log::warn!("hostfn: cpu_id {} exceeds CPU_SETSIZE, not pinning", cpu_id);
        return;
    }
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu_id, &mut cpuset);
        let r = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset);
        if r != 0 {
            log::warn!(
                "hostfn: sched_setaffinity(cpu_id={}) failed (errno {})",
                cpu_id,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
            );
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "thread_affinity")))]
pub(crate) fn set_thread_affinity_if_requested(cpu_id: Option<usize>) {
    if let Some(cpu_id) = cpu_id {
        log::debug!(
            "hostfn: scheduler CPU {} requested but thread_affinity is not enabled",
            cpu_id
        );
    }
}
