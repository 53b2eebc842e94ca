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

//! Wait/notify strategies between "nothing to do" and "maybe something to do".
//!
//! A unit released by `release` is consumed by exactly one `acquire`. Units are
//! hints: the woken worker still checks the status words.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::sync::{Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, Thread};

use crossbeam_channel::{Receiver, Sender, select, unbounded};

pub trait WaitSignal: Send + Sync + 'static {
    /// Make `n` more units available.
    fn release(&self, n: u32);

    /// Block until a unit is taken (`true`) or `stop` is observed (`false`).
    fn acquire(&self, stop: &AtomicBool) -> bool;

    /// Take a unit if one is available, without blocking.
    fn try_acquire(&self) -> bool;

    /// Wake every blocked `acquire`. Call after setting `stop`.
    fn wake_all(&self);
}

/// Counting semaphore over a crossbeam channel of unit tokens.
///
/// `wake_all` drops the shutdown sender, which disconnects the shutdown
/// channel and wakes every waiter at once.
pub struct CountingSignal {
    units_tx: Sender<()>,
    units_rx: Receiver<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl CountingSignal {
    pub fn new() -> Self {
        let (units_tx, units_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        Self {
            units_tx,
            units_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
        }
    }

    /// Units released but not yet acquired.
    pub fn available(&self) -> usize {
        self.units_rx.len()
    }
}

impl Default for CountingSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSignal for CountingSignal {
    fn release(&self, n: u32) {
        for _ in 0..n {
            // Both channel ends live in `self`; send cannot fail.
            let _ = self.units_tx.send(());
        }
    }

    fn acquire(&self, stop: &AtomicBool) -> bool {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        select! {
            recv(self.units_rx) -> unit => unit.is_ok() && !stop.load(Ordering::SeqCst),
            recv(self.shutdown_rx) -> _ => false,
        }
    }

    fn try_acquire(&self) -> bool {
        self.units_rx.try_recv().is_ok()
    }

    fn wake_all(&self) {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Pending-unit counter under a mutex plus a condition variable.
#[derive(Default)]
pub struct CondvarSignal {
    units: Mutex<u64>,
    cv: Condvar,
}

impl CondvarSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitSignal for CondvarSignal {
    fn release(&self, n: u32) {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        *units += u64::from(n);
        if n == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    fn acquire(&self, stop: &AtomicBool) -> bool {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            if *units > 0 {
                *units -= 1;
                return true;
            }
            units = self.cv.wait(units).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn try_acquire(&self) -> bool {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        if *units > 0 {
            *units -= 1;
            true
        } else {
            false
        }
    }

    fn wake_all(&self) {
        // Taking the lock orders this after any waiter's stop check.
        let _units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        self.cv.notify_all();
    }
}

/// Lock-free counter; the single waiting thread parks and `release` unparks it.
///
/// Only one thread may call `acquire` (the dedicated worker thread).
#[derive(Default)]
pub struct AtomicSignal {
    units: AtomicU64,
    waiter: OnceLock<Thread>,
}

impl AtomicSignal {
    pub fn new() -> Self {
        Self::default()
    }

    fn wake_waiter(&self) {
        fence(Ordering::SeqCst);
        if let Some(waiter) = self.waiter.get() {
            waiter.unpark();
        }
    }
}

impl WaitSignal for AtomicSignal {
    fn release(&self, n: u32) {
        self.units.fetch_add(u64::from(n), Ordering::SeqCst);
        self.wake_waiter();
    }

    fn acquire(&self, stop: &AtomicBool) -> bool {
        let me = self.waiter.get_or_init(thread::current);
        debug_assert_eq!(me.id(), thread::current().id(), "AtomicSignal has a single waiter");
        fence(Ordering::SeqCst);
        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            if self.try_acquire() {
                return true;
            }
            // An unpark issued since the last check makes this return at once.
            thread::park();
        }
    }

    fn try_acquire(&self) -> bool {
        self.units
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn wake_all(&self) {
        self.wake_waiter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn releases_then_acquires<S: WaitSignal>(signal: S) {
        let stop = AtomicBool::new(false);
        signal.release(3);
        assert!(signal.acquire(&stop));
        assert!(signal.try_acquire());
        assert!(signal.acquire(&stop));
        assert!(!signal.try_acquire());
    }

    fn wakes_blocked_waiter<S: WaitSignal + Default>() {
        let signal = Arc::new(S::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (s, st) = (Arc::clone(&signal), Arc::clone(&stop));
        let waiter = thread::spawn(move || s.acquire(&st));
        thread::sleep(Duration::from_millis(20));
        signal.release(1);
        assert!(waiter.join().unwrap());
    }

    fn stop_unblocks_waiter<S: WaitSignal + Default>() {
        let signal = Arc::new(S::default());
        let stop = Arc::new(AtomicBool::new(false));
        let (s, st) = (Arc::clone(&signal), Arc::clone(&stop));
        let waiter = thread::spawn(move || s.acquire(&st));
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        stop.store(true, Ordering::SeqCst);
        signal.wake_all();
        assert!(!waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn counting_signal() {
        releases_then_acquires(CountingSignal::new());
        wakes_blocked_waiter::<CountingSignal>();
        stop_unblocks_waiter::<CountingSignal>();
    }

    #[test]
    fn condvar_signal() {
        releases_then_acquires(CondvarSignal::new());
        wakes_blocked_waiter::<CondvarSignal>();
        stop_unblocks_waiter::<CondvarSignal>();
    }

    #[test]
    fn atomic_signal() {
        releases_then_acquires(AtomicSignal::new());
        wakes_blocked_waiter::<AtomicSignal>();
        stop_unblocks_waiter::<AtomicSignal>();
    }

    #[test]
    fn counting_signal_wakes_every_waiter() {
        let signal = Arc::new(CountingSignal::new());
        let stop = Arc::new(AtomicBool::new(false));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let (s, st) = (Arc::clone(&signal), Arc::clone(&stop));
                thread::spawn(move || s.acquire(&st))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::SeqCst);
        signal.wake_all();
        for w in waiters {
            assert!(!w.join().unwrap());
        }
    }

    #[test]
    fn no_missed_wake_under_load() {
        let signal = Arc::new(AtomicSignal::new());
        let stop = Arc::new(AtomicBool::new(false));
        let (s, st) = (Arc::clone(&signal), Arc::clone(&stop));
        let consumer = thread::spawn(move || {
            let mut taken = 0;
            while taken < 10_000 && s.acquire(&st) {
                taken += 1;
            }
            taken
        });
        for _ in 0..10_000 {
            signal.release(1);
        }
        assert_eq!(consumer.join().unwrap(), 10_000);
        assert_eq!(signal.units.load(Ordering::SeqCst), 0);
    }
}
