// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request lifecycle: allocation, issue, completion, requeue and free.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::freeze::{EnterError, UsageCounter};
use crate::queue::{AllocError, RequestQueue};
use crate::request::{AllocFlags, Request, RequestState};
use crate::tag::{Tag, TagPool};
use crate::{probes, CpuId, HctxId, Operation, Status};

/// Usage reference taken on behalf of an allocation, dropped again unless the
/// allocation succeeds.
struct Admission<'a> {
    usage: &'a UsageCounter,
    armed: bool,
}
impl<'a> Admission<'a> {
    fn enter(usage: &'a UsageCounter, wait: bool) -> Result<Self, AllocError> {
        usage.enter(wait).map_err(|e| match e {
            EnterError::Frozen => AllocError::QueueFrozen,
            EnterError::Dying => AllocError::Dying,
        })?;
        Ok(Self { usage, armed: true })
    }

    /// Hand the reference over to the allocated request
    fn keep(mut self) {
        self.armed = false;
    }
}
impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.usage.exit();
        }
    }
}

impl RequestQueue {
    /// Allocate a request for submission from `cpu`.
    ///
    /// Unless `flags` contains [AllocFlags::NOWAIT], waits out a freeze and
    /// then waits for a tag to become available.
    pub fn allocate(
        &self,
        op: Operation,
        cpu: CpuId,
        flags: AllocFlags,
    ) -> Result<Arc<Request>, AllocError> {
        if cpu >= self.nr_cpus() {
            return Err(AllocError::InvalidCpu(cpu));
        }
        let admission =
            Admission::enter(&self.usage, !flags.contains(AllocFlags::NOWAIT))?;
        let map = self.map();
        let (ctx, hctx) = (map.ctx_for(cpu), map.hctx_for(cpu));

        let tag = self.get_tag(hctx, cpu, flags)?;
        let rq = self.init_request(op, flags, ctx, hctx, tag);
        admission.keep();
        Ok(rq)
    }

    /// Allocate a request bound to hardware queue `hctx`, for administrative
    /// commands which must be issued on one particular queue.
    pub fn allocate_on_hctx(
        &self,
        op: Operation,
        hctx: HctxId,
        flags: AllocFlags,
    ) -> Result<Arc<Request>, AllocError> {
        if hctx >= self.nr_hw_queues() {
            return Err(AllocError::InvalidHctx(hctx));
        }
        let admission =
            Admission::enter(&self.usage, !flags.contains(AllocFlags::NOWAIT))?;
        let Some(cpu) = self.map().cpus_of(hctx).next() else {
            return Err(AllocError::Unmapped(hctx));
        };

        let tag = self.get_tag(hctx, cpu, flags)?;
        let rq = self.init_request(op, flags, cpu, hctx, tag);
        admission.keep();
        Ok(rq)
    }

    /// Allocate a request, suspending the calling task (rather than blocking
    /// the thread) while tags are exhausted.
    ///
    /// Fails immediately with [AllocError::QueueFrozen] while the queue is
    /// frozen.
    pub async fn allocate_async(
        &self,
        op: Operation,
        cpu: CpuId,
        flags: AllocFlags,
    ) -> Result<Arc<Request>, AllocError> {
        if cpu >= self.nr_cpus() {
            return Err(AllocError::InvalidCpu(cpu));
        }
        let admission = Admission::enter(&self.usage, false)?;
        let map = self.map();
        let (ctx, hctx) = (map.ctx_for(cpu), map.hctx_for(cpu));

        let tag = match self.try_get_tag(hctx, flags)? {
            Some(tag) => tag,
            None if flags.contains(AllocFlags::NOWAIT) => {
                return Err(AllocError::ResourceExhausted);
            }
            None => {
                let pool = self.alloc_pool(hctx)?;
                self.run_hw_queue(hctx, true);
                pool.acquire(flags.contains(AllocFlags::RESERVED), cpu)
                    .await
                    .map_err(|_| AllocError::ResourceExhausted)?
            }
        };
        let rq = self.init_request(op, flags, ctx, hctx, tag);
        admission.keep();
        Ok(rq)
    }

    fn alloc_pool(&self, hctx: HctxId) -> Result<Arc<TagPool>, AllocError> {
        let hw = self.hctx(hctx).ok_or(AllocError::InvalidHctx(hctx))?;
        if !hw.is_mapped() {
            return Err(AllocError::Unmapped(hctx));
        }
        hw.alloc_pool().ok_or(AllocError::Unmapped(hctx))
    }

    fn try_get_tag(
        &self,
        hctx: HctxId,
        flags: AllocFlags,
    ) -> Result<Option<Tag>, AllocError> {
        let pool = self.alloc_pool(hctx)?;
        let reserved = flags.contains(AllocFlags::RESERVED);
        if self.sched.is_none() {
            let hw = self.hctx(hctx).ok_or(AllocError::InvalidHctx(hctx))?;
            let shared = self.tag_busy(hw);
            // Beyond its fair share a queue may still wait for a tag, but
            // not take one outright
            if shared
                && !reserved
                && flags.contains(AllocFlags::NOWAIT)
                && !self.hctx_may_queue(hw, &pool)
            {
                return Ok(None);
            }
        }
        Ok(pool.try_acquire(reserved))
    }

    fn get_tag(
        &self,
        hctx: HctxId,
        cpu: CpuId,
        flags: AllocFlags,
    ) -> Result<Tag, AllocError> {
        if let Some(tag) = self.try_get_tag(hctx, flags)? {
            return Ok(tag);
        }
        if flags.contains(AllocFlags::NOWAIT) {
            return Err(AllocError::ResourceExhausted);
        }
        // Push out whatever is staged so that tags can come back
        self.run_hw_queue(hctx, false);
        self.alloc_pool(hctx)?
            .acquire_blocking(flags.contains(AllocFlags::RESERVED), cpu)
            .map_err(|_| AllocError::ResourceExhausted)
    }

    fn init_request(
        &self,
        op: Operation,
        flags: AllocFlags,
        cpu: CpuId,
        hctx: HctxId,
        tag: Tag,
    ) -> Arc<Request> {
        let rq = Arc::new(Request::new(
            self.next_req_id(),
            self.self_ref.clone(),
            self.id(),
            op,
            flags,
            cpu,
            hctx,
            self.epoch,
        ));
        let hw = self.hctx_of(&rq);
        match hw.sched_tags() {
            Some(pool) => {
                rq.set_sched_tag(Some(tag));
                pool.set_rq(tag, &rq);
            }
            None => {
                rq.set_tag(Some(tag));
                if hw.is_shared() {
                    rq.inflight.store(true, Ordering::Release);
                    hw.inc_active();
                }
                self.tag_set().pool(hctx).set_rq(tag, &rq);
            }
        }
        probes::rq_alloc!(|| (
            self.id(),
            u64::from(rq.id()),
            hctx as u64,
            tag as u64
        ));
        rq
    }

    /// Hand an allocated request over for dispatch.
    ///
    /// With a scheduler attached the request is inserted there.  Otherwise
    /// it is issued straight to the driver if its hardware queue is idle,
    /// and staged on its software queue if not.
    pub fn enqueue(&self, rq: Arc<Request>) {
        let idx = rq.hctx();
        if let Some(sched) = self.sched.as_ref() {
            rq.set_state(RequestState::Queued);
            sched.insert(idx, rq, false);
            self.run_hw_queue(idx, false);
            return;
        }
        let hctx = self.hctx_of(&rq);
        if hctx.dispatch_busy() == 0 && !hctx.has_dispatch() {
            self.try_issue_directly(rq);
        } else {
            self.insert_ctx(rq, false);
            self.run_hw_queue(idx, false);
        }
    }

    /// Allocate a request, attach `end_io` as its completion callback, and
    /// enqueue it.
    pub fn submit(
        &self,
        op: Operation,
        cpu: CpuId,
        flags: AllocFlags,
        end_io: impl FnOnce(&Arc<Request>, Status) + Send + 'static,
    ) -> Result<Arc<Request>, AllocError> {
        let rq = self.allocate(op, cpu, flags)?;
        rq.on_complete(end_io);
        self.enqueue(rq.clone());
        Ok(rq)
    }

    /// Stage `rq` with the scheduler, or on its software queue, optionally
    /// kicking an asynchronous run of its hardware queue.
    pub fn insert(&self, rq: Arc<Request>, at_head: bool, run: bool) {
        let idx = rq.hctx();
        match self.sched.as_ref() {
            Some(sched) => {
                rq.set_state(RequestState::Queued);
                sched.insert(idx, rq, at_head);
            }
            None => self.insert_ctx(rq, at_head),
        }
        if run {
            self.run_hw_queue(idx, true);
        }
    }

    pub(crate) fn insert_ctx(&self, rq: Arc<Request>, at_head: bool) {
        let hctx = self.hctx_of(&rq);
        let ctx = self.ctx_of(&rq);
        hctx.insert_request(ctx, rq, at_head);
    }

    /// Put `rq` straight onto its hardware queue's dispatch list, skipping
    /// the scheduler and software queues.
    pub fn bypass_insert(&self, rq: Arc<Request>, run: bool) {
        let idx = rq.hctx();
        rq.set_state(RequestState::Queued);
        self.hctx_of(&rq).lock_dispatch().push_back(rq);
        if run {
            self.run_hw_queue(idx, false);
        }
    }

    /// Arm the deadline of `rq` as it is issued to the driver
    pub(crate) fn start_request(&self, rq: &Arc<Request>) {
        let deadline = Instant::now() + self.opts.timeout;
        rq.mark_started(deadline);
        self.timer.arm(deadline);
    }

    /// Complete `rq` with `status` on the calling thread.
    ///
    /// If the request has already been completed (by the timeout handler,
    /// or a duplicate completion), this is a no-op.
    pub fn complete(&self, rq: &Arc<Request>, status: Status) {
        if rq.mark_complete() {
            return;
        }
        rq.set_state(RequestState::Completing);
        self.finish(rq, status);
    }

    /// Complete `rq` with `status`, as signalled on `cpu`.
    ///
    /// With remote completion enabled, a request submitted from a CPU which
    /// does not share a cache with `cpu` is finalized by the completion
    /// worker of the submitting CPU's cache domain.
    pub fn complete_on(&self, rq: &Arc<Request>, status: Status, cpu: CpuId) {
        if rq.mark_complete() {
            return;
        }
        rq.set_state(RequestState::Completing);

        let map = self.map();
        let topo = &map.topology;
        let home = rq.cpu();
        let remote = cpu != home
            && cpu < topo.nr_cpus()
            && topo.is_online(home)
            && !topo.share_cache(cpu, home);
        if remote {
            let workers = self.completion.lock().unwrap();
            if let Some(workers) = workers.as_ref() {
                if workers.send(topo.cache_domain(home), rq.clone(), status) {
                    return;
                }
            }
        }
        self.finish(rq, status);
    }

    /// Finalize a request whose COMPLETE flag is owned by the caller
    pub(crate) fn finish(&self, rq: &Arc<Request>, status: Status) {
        self.ctx_of(rq).account_completed();
        let queued = rq.time_queued();
        let processed = rq.time_processed();
        if let Some(metrics) = self.metrics.read().unwrap().as_ref() {
            metrics.request_completed(
                rq.hctx(),
                rq.op(),
                status,
                queued,
                processed,
            );
        }
        probes::rq_complete!(|| (
            self.id(),
            u64::from(rq.id()),
            status as u8,
            processed.as_nanos() as u64,
            queued.as_nanos() as u64
        ));
        if let Some(end_io) = rq.take_end_io() {
            end_io(rq, status);
        }
        self.free_request(rq);
    }

    /// End `rq` with `status` without it having been handed to the driver,
    /// or after the driver failed it.
    pub fn end_request(&self, rq: &Arc<Request>, status: Status) {
        self.complete(rq, status);
    }

    /// Return the tags held by `rq` and drop its usage reference.
    ///
    /// Called upon completion; a request which was allocated but never
    /// enqueued may also be freed directly.
    ///
    /// # Panics
    ///
    /// If `rq` has already been freed.
    pub fn free_request(&self, rq: &Arc<Request>) {
        let prev = rq.swap_state(RequestState::Free);
        assert_ne!(prev, RequestState::Free, "double free of {rq:?}");

        let hctx = self.hctx_of(rq);
        self.release_driver_tag(hctx, rq);
        if let Some(tag) = rq.sched_tag() {
            rq.set_sched_tag(None);
            if let Some(pool) = hctx.sched_tags() {
                pool.release(tag);
            }
        }
        self.sched_restart(hctx);
        self.usage.exit();
    }

    /// Undo the issue of `rq` so that it can be dispatched again
    pub(crate) fn prep_requeue(&self, rq: &Arc<Request>) {
        self.put_driver_tag(rq);
        rq.clear_started();
        rq.set_state(RequestState::Queued);
    }

    /// Take back a request the driver had accepted, to be dispatched again
    /// once the requeue list is kicked.
    ///
    /// `at_head` requests go ahead of anything already staged.
    pub fn requeue(&self, rq: &Arc<Request>, at_head: bool, kick: bool) {
        self.prep_requeue(rq);
        rq.set_state(RequestState::Requeued);
        rq.requeue_head.store(at_head, Ordering::Release);
        probes::rq_requeue!(|| (self.id(), u64::from(rq.id()), at_head as u8));

        let mut list = self.requeue_list.lock().unwrap();
        if at_head {
            list.push_front(rq.clone());
        } else {
            list.push_back(rq.clone());
        }
        drop(list);
        if kick {
            self.kick_requeue_list();
        }
    }

    /// Re-insert everything on the requeue list, head requests first, and
    /// run the hardware queues.
    pub fn kick_requeue_list(&self) {
        let list: Vec<_> =
            self.requeue_list.lock().unwrap().drain(..).collect();
        if list.is_empty() {
            return;
        }
        let (head, tail): (Vec<_>, Vec<_>) = list
            .into_iter()
            .partition(|rq| rq.requeue_head.swap(false, Ordering::AcqRel));
        for rq in head {
            self.insert(rq, true, false);
        }
        for rq in tail {
            self.insert(rq, false, false);
        }
        self.run_hw_queues(true);
    }

    /// Finalize, with [Status::Timeout], every request whose driver declined
    /// to handle its timeout.  Returns the number of requests ended.
    ///
    /// Meant to be called by the driver once it has reset the device.
    pub fn fail_timed_out(&self) -> usize {
        let mut expired = Vec::new();
        self.busy_iter(|_, _, rq| {
            if rq.state() == RequestState::TimedOut {
                expired.push(rq.clone());
            }
        });

        let mut failed = 0;
        for rq in expired {
            // COMPLETE is still held from the timeout
            if !rq.transition(RequestState::TimedOut, RequestState::Completing)
            {
                continue;
            }
            self.finish(&rq, Status::Timeout);
            failed += 1;
        }
        if failed != 0 {
            slog::warn!(self.log, "failed timed out requests";
                "count" => failed);
        }
        failed
    }

    /// End every request still holding a driver or scheduler tag with
    /// `status`, returning its tags.  Returns the number of requests ended.
    ///
    /// Only called while tearing the queue down, when nothing else can
    /// complete its requests any more.
    pub(crate) fn end_outstanding(&self, status: Status) -> usize {
        let mut outstanding: Vec<Arc<Request>> = Vec::new();
        let mut collect = |rq: &Arc<Request>| {
            if rq.queue_id() == self.id()
                && !outstanding.iter().any(|o| o.id() == rq.id())
            {
                outstanding.push(rq.clone());
            }
        };
        for hctx in self.hctxs() {
            self.tag_set().pool(hctx.idx()).busy_iter(|_, rq| collect(rq));
            if let Some(pool) = hctx.sched_tags() {
                pool.busy_iter(|_, rq| collect(rq));
            }
        }

        let mut ended = 0;
        for rq in outstanding {
            if rq.state() == RequestState::Free {
                continue;
            }
            // COMPLETE may be held by a timeout, or by a completion worker
            // which has already exited
            rq.mark_complete();
            rq.set_state(RequestState::Completing);
            self.finish(&rq, status);
            ended += 1;
        }
        if ended != 0 {
            slog::warn!(self.log, "ended outstanding requests";
                "count" => ended, "status" => ?status);
        }
        ended
    }
}
