// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware queues: the submission channels into a device.
//!
//! Each [HardwareQueue] gathers requests from the [SoftwareQueue]s mapped to
//! it, tracking which of them hold staged requests in a pending bitmap.  The
//! invariant tying the two together is that a software queue's pending bit is
//! set if and only if its FIFO is non-empty; both are only changed while
//! holding that software queue's lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use slog::Logger;

use crate::bitmap::AtomicBitmap;
use crate::ctx::SoftwareQueue;
use crate::queue::RequestQueue;
use crate::request::{Request, RequestState};
use crate::tag::{TagPool, TagWaitHook};
use crate::{HctxId, MAX_DISPATCH_ORDER};

bitflags! {
    /// Run-time state of a [HardwareQueue]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct HctxState: u32 {
        /// Dispatch suspended by the driver
        const STOPPED = 1 << 0;
        /// Dispatch ran out of resources; re-run when a request is freed
        const NEEDS_RESTART = 1 << 1;
        /// Counted as an active user of a shared tag pool
        const TAG_ACTIVE = 1 << 2;
        /// Registered on the driver tag pool's wait list
        const TAG_WAITING = 1 << 3;
    }
}

bitflags! {
    /// Configuration flags of a [HardwareQueue]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct HctxFlags: u32 {
        /// Driver tags are shared with other request queues
        const TAG_SHARED = 1 << 0;
        /// Driver submission may sleep
        const BLOCKING = 1 << 1;
    }
}

const EWMA_WEIGHT: u32 = 8;
const EWMA_FACTOR: u32 = 4;

/// Histogram bucket for a dispatch batch of `n` requests
pub(crate) fn queued_to_index(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    (n.ilog2() as usize + 1).min(MAX_DISPATCH_ORDER - 1)
}

/// Snapshot of [HardwareQueue] counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HctxStats {
    pub queued: u64,
    pub runs: u64,
    /// Re-runs scheduled for immediate execution by the dispatcher
    pub runs_immediate: u64,
    /// Re-runs scheduled after a busy backoff delay
    pub runs_delayed: u64,
    pub dispatched: [u64; MAX_DISPATCH_ORDER],
    pub dispatch_busy: u32,
    pub nr_active: usize,
    pub dispatch_list: usize,
}

pub struct HardwareQueue {
    idx: HctxId,
    pub(crate) log: Logger,
    state: AtomicU32,
    flags: AtomicU32,

    pending: AtomicBitmap,
    ctxs: RwLock<Vec<Arc<SoftwareQueue>>>,
    /// Where `dequeue_one` resumes its round-robin walk of the pending map
    dispatch_from: AtomicUsize,

    /// Requests which could not be issued to the driver, retried first
    dispatch: Mutex<VecDeque<Arc<Request>>>,

    tags: RwLock<Option<Arc<TagPool>>>,
    sched_tags: Option<Arc<TagPool>>,

    /// Busy estimate, updated after each dispatch pass
    dispatch_busy: AtomicU32,
    /// Driver tags held while in shared-tag mode
    nr_active: AtomicUsize,

    dispatched: [AtomicU64; MAX_DISPATCH_ORDER],
    queued: AtomicU64,
    runs: AtomicU64,
    runs_immediate: AtomicU64,
    runs_delayed: AtomicU64,

    pub(crate) wait_hook: Arc<dyn TagWaitHook>,
    pub(crate) runner: Arc<Runner>,
}
impl HardwareQueue {
    pub(crate) fn new(
        idx: HctxId,
        nr_cpus: usize,
        queue: Weak<RequestQueue>,
        tags: Arc<TagPool>,
        sched_tags: Option<Arc<TagPool>>,
        flags: HctxFlags,
        log: Logger,
    ) -> Self {
        Self {
            idx,
            log,
            state: AtomicU32::new(0),
            flags: AtomicU32::new(flags.bits()),
            pending: AtomicBitmap::new(nr_cpus),
            ctxs: RwLock::new(Vec::new()),
            dispatch_from: AtomicUsize::new(0),
            dispatch: Mutex::new(VecDeque::new()),
            tags: RwLock::new(Some(tags)),
            sched_tags,
            dispatch_busy: AtomicU32::new(0),
            nr_active: AtomicUsize::new(0),
            dispatched: Default::default(),
            queued: AtomicU64::new(0),
            runs: AtomicU64::new(0),
            runs_immediate: AtomicU64::new(0),
            runs_delayed: AtomicU64::new(0),
            wait_hook: Arc::new(HctxWaitHook { queue, idx }),
            runner: Arc::new(Runner::new()),
        }
    }

    pub fn idx(&self) -> HctxId {
        self.idx
    }

    pub fn state(&self) -> HctxState {
        HctxState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }
    pub(crate) fn test_state(&self, bits: HctxState) -> bool {
        self.state().contains(bits)
    }
    /// Set `bits`, returning true if they were all already set
    pub(crate) fn set_state(&self, bits: HctxState) -> bool {
        let prev = self.state.fetch_or(bits.bits(), Ordering::AcqRel);
        HctxState::from_bits_truncate(prev).contains(bits)
    }
    /// Clear `bits`, returning true if any of them had been set
    pub(crate) fn clear_state(&self, bits: HctxState) -> bool {
        let prev = self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
        HctxState::from_bits_truncate(prev).intersects(bits)
    }

    pub fn flags(&self) -> HctxFlags {
        HctxFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }
    pub(crate) fn set_flags(&self, bits: HctxFlags, on: bool) {
        if on {
            self.flags.fetch_or(bits.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!bits.bits(), Ordering::AcqRel);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.test_state(HctxState::STOPPED)
    }

    pub fn is_shared(&self) -> bool {
        self.flags().contains(HctxFlags::TAG_SHARED)
    }

    /// Mapped hardware queues have a driver tag pool and at least one software
    /// queue feeding them, with queue 0 always kept as a fallback.
    pub fn is_mapped(&self) -> bool {
        let has_tags = self.tags.read().unwrap().is_some();
        has_tags && (self.idx == 0 || !self.ctxs.read().unwrap().is_empty())
    }

    /// Driver tag pool (absent while unmapped)
    pub fn tags(&self) -> Option<Arc<TagPool>> {
        self.tags.read().unwrap().clone()
    }
    pub(crate) fn set_tags(&self, tags: Option<Arc<TagPool>>) {
        *self.tags.write().unwrap() = tags;
    }

    pub fn sched_tags(&self) -> Option<&Arc<TagPool>> {
        self.sched_tags.as_ref()
    }

    /// Pool from which requests on this queue are allocated
    pub(crate) fn alloc_pool(&self) -> Option<Arc<TagPool>> {
        match &self.sched_tags {
            Some(pool) => Some(pool.clone()),
            None => self.tags(),
        }
    }

    pub(crate) fn ctxs(&self) -> Vec<Arc<SoftwareQueue>> {
        self.ctxs.read().unwrap().clone()
    }
    pub(crate) fn set_ctxs(&self, ctxs: Vec<Arc<SoftwareQueue>>) {
        let mut guard = self.ctxs.write().unwrap();
        for (n, ctx) in ctxs.iter().enumerate() {
            ctx.set_mapping(self.idx, n);
        }
        *guard = ctxs;
        self.dispatch_from.store(0, Ordering::Relaxed);
    }

    /// Flag `ctx` as holding staged requests.  Caller holds the ctx lock.
    pub(crate) fn mark_pending(&self, ctx: &SoftwareQueue) {
        let idx = ctx.index_hw();
        if !self.pending.test(idx) {
            self.pending.set(idx);
        }
    }

    /// Clear the pending flag of `ctx`.  Caller holds the ctx lock and has
    /// found its FIFO empty.
    pub(crate) fn clear_pending(&self, ctx: &SoftwareQueue) {
        self.pending.clear(ctx.index_hw());
    }

    pub(crate) fn has_pending_ctx(&self) -> bool {
        self.pending.any()
    }

    /// Stage `rq` on software queue `ctx`
    pub(crate) fn insert_request(
        &self,
        ctx: &SoftwareQueue,
        rq: Arc<Request>,
        at_head: bool,
    ) {
        rq.set_state(RequestState::Queued);
        let mut list = ctx.lock();
        if at_head {
            list.push_front(rq);
        } else {
            list.push_back(rq);
        }
        self.mark_pending(ctx);
        drop(list);
        ctx.account_queued();
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain every pending software queue into a single batch, holding at
    /// most one software queue lock at a time.
    pub(crate) fn flush_busy(&self) -> VecDeque<Arc<Request>> {
        let mut batch = VecDeque::new();
        let ctxs = self.ctxs.read().unwrap();
        for idx in self.pending.iter_set() {
            let Some(ctx) = ctxs.get(idx) else {
                self.pending.clear(idx);
                continue;
            };
            let mut list = ctx.lock();
            ctx.account_dispatched(list.len());
            batch.extend(list.drain(..));
            self.clear_pending(ctx);
        }
        batch
    }

    /// Take a single request, walking the pending software queues round-robin
    /// from where the previous call left off.
    pub(crate) fn dequeue_one(&self) -> Option<Arc<Request>> {
        let ctxs = self.ctxs.read().unwrap();
        let start = self.dispatch_from.load(Ordering::Relaxed);
        for idx in self.pending.iter_set_from(start) {
            let Some(ctx) = ctxs.get(idx) else {
                self.pending.clear(idx);
                continue;
            };
            let mut list = ctx.lock();
            let rq = list.pop_front();
            if list.is_empty() {
                self.clear_pending(ctx);
            }
            drop(list);
            if let Some(rq) = rq {
                ctx.account_dispatched(1);
                let next = if idx + 1 >= ctxs.len() { 0 } else { idx + 1 };
                self.dispatch_from.store(next, Ordering::Relaxed);
                return Some(rq);
            }
        }
        None
    }

    pub(crate) fn lock_dispatch(
        &self,
    ) -> MutexGuard<'_, VecDeque<Arc<Request>>> {
        self.dispatch.lock().unwrap()
    }

    pub(crate) fn has_dispatch(&self) -> bool {
        !self.lock_dispatch().is_empty()
    }

    /// Fold the outcome of a dispatch pass into the busy estimate
    pub(crate) fn update_dispatch_busy(&self, busy: bool) {
        let mut ewma = self.dispatch_busy.load(Ordering::Relaxed);
        if ewma == 0 && !busy {
            return;
        }
        ewma *= EWMA_WEIGHT - 1;
        if busy {
            ewma += 1 << EWMA_FACTOR;
        }
        ewma /= EWMA_WEIGHT;
        self.dispatch_busy.store(ewma, Ordering::Relaxed);
    }

    pub fn dispatch_busy(&self) -> u32 {
        self.dispatch_busy.load(Ordering::Relaxed)
    }

    pub(crate) fn account_batch(&self, queued: usize) {
        self.dispatched[queued_to_index(queued)]
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_rerun(&self, delayed: bool) {
        if delayed {
            self.runs_delayed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_immediate.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn inc_active(&self) {
        self.nr_active.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn dec_active(&self) {
        self.nr_active.fetch_sub(1, Ordering::AcqRel);
    }
    pub fn nr_active(&self) -> usize {
        self.nr_active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HctxStats {
        let mut dispatched = [0; MAX_DISPATCH_ORDER];
        for (out, v) in dispatched.iter_mut().zip(self.dispatched.iter()) {
            *out = v.load(Ordering::Relaxed);
        }
        HctxStats {
            queued: self.queued.load(Ordering::Relaxed),
            runs: self.runs.load(Ordering::Relaxed),
            runs_immediate: self.runs_immediate.load(Ordering::Relaxed),
            runs_delayed: self.runs_delayed.load(Ordering::Relaxed),
            dispatched,
            dispatch_busy: self.dispatch_busy(),
            nr_active: self.nr_active(),
            dispatch_list: self.lock_dispatch().len(),
        }
    }
}

/// Re-runs a hardware queue once its driver tag pool frees up
struct HctxWaitHook {
    queue: Weak<RequestQueue>,
    idx: HctxId,
}
impl TagWaitHook for HctxWaitHook {
    fn tag_available(&self) {
        if let Some(queue) = self.queue.upgrade() {
            if let Some(hctx) = queue.hctx(self.idx) {
                hctx.clear_state(HctxState::TAG_WAITING);
            }
            queue.run_hw_queue(self.idx, true);
        }
    }
}

#[derive(Default)]
struct RunnerState {
    pending: bool,
    run_at: Option<Instant>,
    exit: bool,
}

/// Wakeup state for the thread performing asynchronous and delayed runs of
/// one hardware queue.
pub(crate) struct Runner {
    state: Mutex<RunnerState>,
    cv: Condvar,
}
impl Runner {
    fn new() -> Self {
        Self { state: Mutex::new(RunnerState::default()), cv: Condvar::new() }
    }

    /// Request a run as soon as possible
    pub fn kick(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = true;
        self.cv.notify_one();
    }

    /// Request a run after `delay`, unless one is already due sooner
    pub fn kick_after(&self, delay: Duration) {
        let at = Instant::now() + delay;
        let mut state = self.state.lock().unwrap();
        match state.run_at {
            Some(existing) if existing <= at => {}
            _ => {
                state.run_at = Some(at);
                self.cv.notify_one();
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.exit = true;
        self.cv.notify_all();
    }

    /// Wait for a run to be due.  Returns false once the runner should exit.
    pub fn wait_work(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.exit {
                return false;
            }
            if state.pending {
                state.pending = false;
                return true;
            }
            match state.run_at {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        state.run_at = None;
                        return true;
                    }
                    state = self.cv.wait_timeout(state, at - now).unwrap().0;
                }
                None => {
                    state = self.cv.wait(state).unwrap();
                }
            }
        }
    }
}
