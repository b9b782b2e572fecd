// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admission (freeze) and dispatch (quiesce) barriers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use thiserror::Error;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EnterError {
    #[error("queue frozen")]
    Frozen,
    #[error("queue dying")]
    Dying,
}

/// Count of live requests, gating admission while frozen.
///
/// Every allocated request holds one reference from allocation until it is
/// freed.  Freezing blocks further admission and waits for the count to
/// drain to zero.
pub(crate) struct UsageCounter {
    live: AtomicUsize,
    depth: AtomicUsize,
    dying: AtomicBool,
    lock: Mutex<()>,
    drained: Condvar,
    thawed: Condvar,
}
impl UsageCounter {
    pub fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
            lock: Mutex::new(()),
            drained: Condvar::new(),
            thawed: Condvar::new(),
        }
    }

    /// Take a reference, optionally waiting out a freeze
    pub fn enter(&self, wait: bool) -> Result<(), EnterError> {
        loop {
            self.live.fetch_add(1, Ordering::SeqCst);
            let frozen = self.depth.load(Ordering::SeqCst) != 0;
            let dying = self.dying.load(Ordering::SeqCst);
            if !frozen && !dying {
                return Ok(());
            }
            self.exit();
            if dying {
                return Err(EnterError::Dying);
            }
            if !wait {
                return Err(EnterError::Frozen);
            }

            let mut guard = self.lock.lock().unwrap();
            while self.depth.load(Ordering::SeqCst) != 0
                && !self.dying.load(Ordering::SeqCst)
            {
                guard = self.thawed.wait(guard).unwrap();
            }
        }
    }

    pub fn exit(&self) {
        let prev = self.live.fetch_sub(1, Ordering::SeqCst);
        assert_ne!(prev, 0, "usage count underflow");
        if prev == 1 {
            let _guard = self.lock.lock().unwrap();
            self.drained.notify_all();
        }
    }

    /// Raise the freeze depth, returning the new depth
    pub fn freeze_start(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        self.depth.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Wait for every live reference to be dropped
    pub fn freeze_wait(&self) {
        let mut guard = self.lock.lock().unwrap();
        while self.live.load(Ordering::SeqCst) != 0 {
            guard = self.drained.wait(guard).unwrap();
        }
    }

    /// Lower the freeze depth, returning the new depth
    pub fn unfreeze(&self) -> usize {
        let _guard = self.lock.lock().unwrap();
        let prev = self.depth.fetch_sub(1, Ordering::SeqCst);
        assert_ne!(prev, 0, "unfreeze of unfrozen queue");
        if prev == 1 {
            self.thawed.notify_all();
        }
        prev - 1
    }

    pub fn freeze_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn mark_dying(&self) {
        let _guard = self.lock.lock().unwrap();
        self.dying.store(true, Ordering::SeqCst);
        self.thawed.notify_all();
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }
}

/// Read-side gate around dispatch, closed by quiesce.
///
/// Dispatch enters the gate before pulling any request.  Quiescing closes the
/// gate and then waits for every dispatcher already inside to leave.
pub(crate) struct DispatchGate {
    quiesced: AtomicBool,
    readers: AtomicUsize,
    lock: Mutex<()>,
    cv: Condvar,
}
impl DispatchGate {
    pub fn new() -> Self {
        Self {
            quiesced: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Enter the gate, unless the queue is quiesced
    pub fn enter(&self) -> Option<GateGuard<'_>> {
        self.readers.fetch_add(1, Ordering::SeqCst);
        if self.quiesced.load(Ordering::SeqCst) {
            self.leave();
            return None;
        }
        Some(GateGuard(self))
    }

    fn leave(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.quiesced.load(Ordering::SeqCst) {
            let _guard = self.lock.lock().unwrap();
            self.cv.notify_all();
        }
    }

    /// Close the gate and wait for dispatchers inside it to finish
    pub fn quiesce(&self) {
        self.quiesced.store(true, Ordering::SeqCst);
        let mut guard = self.lock.lock().unwrap();
        while self.readers.load(Ordering::SeqCst) != 0 {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    pub fn unquiesce(&self) {
        self.quiesced.store(false, Ordering::SeqCst);
    }

    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
    }
}

pub(crate) struct GateGuard<'a>(&'a DispatchGate);
impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}
