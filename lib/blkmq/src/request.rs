// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests and their lifecycle state.

use std::sync::atomic::{
    fence, AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering,
};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use strum::IntoStaticStr;

use crate::queue::RequestQueue;
use crate::tag::Tag;
use crate::{CpuId, HctxId, Operation, Status};

/// Unique (per request queue) identifier for a request
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ReqId(u64);
impl ReqId {
    pub(crate) const START: Self = Self(1);

    pub(crate) fn advance(&mut self) -> Self {
        let cur = *self;
        self.0 = self.0.wrapping_add(1);
        cur
    }
}
impl From<ReqId> for u64 {
    fn from(value: ReqId) -> Self {
        value.0
    }
}

bitflags! {
    /// Flags controlling request allocation
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Fail with `ResourceExhausted`/`QueueFrozen` rather than waiting
        const NOWAIT = 1 << 0;
        /// Draw from the reserved tag partition
        const RESERVED = 1 << 1;
    }
}

/// Lifecycle state of a [Request]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr)]
#[repr(u8)]
pub enum RequestState {
    Free = 0,
    Allocated,
    Queued,
    Started,
    Completing,
    Requeued,
    /// Timeout handler answered "not handled"; the request is left to the
    /// driver until a device reset finalizes it.
    TimedOut,
}
impl RequestState {
    fn from_repr(v: u8) -> Self {
        match v {
            0 => Self::Free,
            1 => Self::Allocated,
            2 => Self::Queued,
            3 => Self::Started,
            4 => Self::Completing,
            5 => Self::Requeued,
            6 => Self::TimedOut,
            _ => panic!("invalid request state {v}"),
        }
    }
}

/// Atomic flag bits (`Request::atomic`)
const ATOM_STARTED: u8 = 1 << 0;
const ATOM_COMPLETE: u8 = 1 << 1;

const NO_TAG: usize = usize::MAX;
const NO_STATUS: u8 = u8::MAX;

pub type EndIo = Box<dyn FnOnce(&Arc<Request>, Status) + Send>;

/// A unit of I/O moving through a [RequestQueue]
pub struct Request {
    id: ReqId,
    queue_id: u64,
    queue: Weak<RequestQueue>,
    pub(crate) op: Operation,
    flags: AllocFlags,

    tag: AtomicUsize,
    sched_tag: AtomicUsize,
    atomic: AtomicU8,
    state: AtomicU8,
    status: AtomicU8,

    /// Software queue (CPU) the request is staged on
    cpu: CpuId,
    /// Hardware queue resolved at allocation
    hctx: HctxId,
    /// Counted against the hardware queue's active total (shared tags)
    pub(crate) inflight: AtomicBool,
    /// Requeue at the head rather than the tail
    pub(crate) requeue_head: AtomicBool,

    epoch: Instant,
    allocated: Instant,
    /// Offsets from `epoch` in nanoseconds; 0 when unset
    deadline: AtomicU64,
    started: AtomicU64,

    end_io: Mutex<Option<EndIo>>,
}
impl Request {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ReqId,
        queue: Weak<RequestQueue>,
        queue_id: u64,
        op: Operation,
        flags: AllocFlags,
        cpu: CpuId,
        hctx: HctxId,
        epoch: Instant,
    ) -> Self {
        Self {
            id,
            queue_id,
            queue,
            op,
            flags,
            tag: AtomicUsize::new(NO_TAG),
            sched_tag: AtomicUsize::new(NO_TAG),
            atomic: AtomicU8::new(0),
            state: AtomicU8::new(RequestState::Allocated as u8),
            status: AtomicU8::new(NO_STATUS),
            cpu,
            hctx,
            inflight: AtomicBool::new(false),
            requeue_head: AtomicBool::new(false),
            epoch,
            allocated: Instant::now(),
            deadline: AtomicU64::new(0),
            started: AtomicU64::new(0),
            end_io: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ReqId {
        self.id
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn alloc_flags(&self) -> AllocFlags {
        self.flags
    }

    pub fn is_reserved(&self) -> bool {
        self.flags.contains(AllocFlags::RESERVED)
    }

    pub(crate) fn queue_id(&self) -> u64 {
        self.queue_id
    }

    /// Driver tag, if one is held
    pub fn tag(&self) -> Option<Tag> {
        match self.tag.load(Ordering::Acquire) {
            NO_TAG => None,
            t => Some(t),
        }
    }
    pub(crate) fn set_tag(&self, tag: Option<Tag>) {
        self.tag.store(tag.unwrap_or(NO_TAG), Ordering::Release);
    }

    /// Scheduler tag, if one is held
    pub fn sched_tag(&self) -> Option<Tag> {
        match self.sched_tag.load(Ordering::Acquire) {
            NO_TAG => None,
            t => Some(t),
        }
    }
    pub(crate) fn set_sched_tag(&self, tag: Option<Tag>) {
        self.sched_tag.store(tag.unwrap_or(NO_TAG), Ordering::Release);
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn hctx(&self) -> HctxId {
        self.hctx
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_repr(self.state.load(Ordering::Acquire))
    }
    pub(crate) fn set_state(&self, state: RequestState) {
        self.state.store(state as u8, Ordering::Release);
    }
    pub(crate) fn swap_state(&self, state: RequestState) -> RequestState {
        RequestState::from_repr(self.state.swap(state as u8, Ordering::AcqRel))
    }
    /// Move from state `from` to `to`, returning false if not in `from`
    pub(crate) fn transition(
        &self,
        from: RequestState,
        to: RequestState,
    ) -> bool {
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.atomic.load(Ordering::Acquire) & ATOM_STARTED != 0
    }

    pub fn is_complete(&self) -> bool {
        self.atomic.load(Ordering::Acquire) & ATOM_COMPLETE != 0
    }

    /// Mark the request as issued to the driver with the given deadline.
    ///
    /// The deadline is published before STARTED becomes visible, as the
    /// timeout scan reads the two without any lock.
    pub(crate) fn mark_started(&self, deadline: Instant) {
        let started = Instant::now();
        self.started.store(self.offset_of(started), Ordering::Relaxed);
        self.deadline.store(self.offset_of(deadline), Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.atomic.fetch_or(ATOM_STARTED, Ordering::AcqRel);
        // A previous requeue or timeout may have left this set
        self.atomic.fetch_and(!ATOM_COMPLETE, Ordering::AcqRel);
        self.set_state(RequestState::Started);
    }

    pub(crate) fn clear_started(&self) {
        self.atomic.fetch_and(!ATOM_STARTED, Ordering::AcqRel);
    }

    /// Atomically set COMPLETE, returning true if it was already set
    pub(crate) fn mark_complete(&self) -> bool {
        self.atomic.fetch_or(ATOM_COMPLETE, Ordering::AcqRel) & ATOM_COMPLETE
            != 0
    }

    pub(crate) fn clear_complete(&self) {
        self.atomic.fetch_and(!ATOM_COMPLETE, Ordering::AcqRel);
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        self.deadline.store(self.offset_of(deadline), Ordering::Release);
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.deadline.load(Ordering::Acquire) {
            0 => None,
            ns => Some(self.epoch + Duration::from_nanos(ns)),
        }
    }

    fn offset_of(&self, when: Instant) -> u64 {
        // Keep clear of zero, which marks an unset timestamp
        (when.saturating_duration_since(self.epoch).as_nanos() as u64).max(1)
    }

    /// Time spent between allocation and issue to the driver
    pub(crate) fn time_queued(&self) -> Duration {
        match self.started.load(Ordering::Acquire) {
            0 => self.allocated.elapsed(),
            ns => (self.epoch + Duration::from_nanos(ns))
                .saturating_duration_since(self.allocated),
        }
    }

    /// Time spent since issue to the driver
    pub(crate) fn time_processed(&self) -> Duration {
        match self.started.load(Ordering::Acquire) {
            0 => Duration::ZERO,
            ns => (self.epoch + Duration::from_nanos(ns)).elapsed(),
        }
    }

    /// Record the outcome a driver determined for this request, to be
    /// reported if its timeout handler finalizes it.
    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_repr(self.status.load(Ordering::Acquire))
    }

    /// Attach a callback to be invoked once the request is finalized
    pub fn on_complete(
        &self,
        f: impl FnOnce(&Arc<Request>, Status) + Send + 'static,
    ) {
        *self.end_io.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn take_end_io(&self) -> Option<EndIo> {
        self.end_io.lock().unwrap().take()
    }

    /// Complete this request with `status`.
    ///
    /// Convenience for drivers, equivalent to [RequestQueue::complete].  A
    /// request whose queue has already been torn down is simply dropped.
    pub fn complete(self: &Arc<Self>, status: Status) {
        if let Some(queue) = self.queue.upgrade() {
            queue.complete(self, status);
        }
    }
}
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("tag", &self.tag())
            .field("sched_tag", &self.sched_tag())
            .field("state", &self.state())
            .field("cpu", &self.cpu())
            .field("hctx", &self.hctx)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_transitions() {
        let queue = crate::test::null_queue(1, 4);
        let rq = queue
            .allocate(Operation::Flush, 0, AllocFlags::NOWAIT)
            .unwrap();
        assert_eq!(rq.state(), RequestState::Allocated);
        assert!(!rq.is_started());

        rq.mark_started(Instant::now() + Duration::from_secs(1));
        assert!(rq.is_started());
        assert!(!rq.is_complete());
        assert!(rq.deadline().is_some());

        assert!(!rq.mark_complete());
        assert!(rq.mark_complete());

        // Restarting clears a stale COMPLETE
        rq.mark_started(Instant::now() + Duration::from_secs(1));
        assert!(!rq.is_complete());

        queue.end_request(&rq, Status::Success);
        assert_eq!(rq.state(), RequestState::Free);
    }

    #[test]
    fn req_id_advances() {
        let mut next = ReqId::START;
        let a = next.advance();
        let b = next.advance();
        assert_eq!(u64::from(a) + 1, u64::from(b));
    }
}
