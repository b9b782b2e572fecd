// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU software staging queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::request::Request;
use crate::{CpuId, HctxId};

/// FIFO of requests issued from one CPU, awaiting dispatch by the hardware
/// queue that CPU maps to.
pub struct SoftwareQueue {
    cpu: CpuId,
    list: Mutex<VecDeque<Arc<Request>>>,

    /// Hardware queue this software queue feeds, and its index within that
    /// hardware queue's pending map.  Only changed under a queue freeze.
    hctx: AtomicUsize,
    index_hw: AtomicUsize,

    dispatched: AtomicU64,
    completed: AtomicU64,
    queued: AtomicU64,
    merged: AtomicU64,
}

/// Counters for a [SoftwareQueue]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CtxStats {
    pub dispatched: u64,
    pub completed: u64,
    pub queued: u64,
    pub merged: u64,
}

impl SoftwareQueue {
    pub(crate) fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            list: Mutex::new(VecDeque::new()),
            hctx: AtomicUsize::new(0),
            index_hw: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            merged: AtomicU64::new(0),
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn hctx(&self) -> HctxId {
        self.hctx.load(Ordering::Acquire)
    }

    pub(crate) fn index_hw(&self) -> usize {
        self.index_hw.load(Ordering::Acquire)
    }

    pub(crate) fn set_mapping(&self, hctx: HctxId, index_hw: usize) {
        self.hctx.store(hctx, Ordering::Release);
        self.index_hw.store(index_hw, Ordering::Release);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Request>>> {
        self.list.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn account_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_dispatched(&self, n: usize) {
        self.dispatched.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn account_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a collaborator coalesced an incoming I/O into a request
    /// already staged on this queue.
    pub fn account_merge(&self) {
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CtxStats {
        CtxStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
        }
    }
}
