// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatch of requests from the hardware queues to the driver.
//!
//! A run of a hardware queue first retries whatever is parked on its dispatch
//! list, then pulls fresh work from the scheduler or the software queues.
//! Requests which the driver cannot take right now (device busy, or no driver
//! tag to be had) go back onto the dispatch list, and a re-run is arranged:
//! straight away if nothing else will trigger one, or after
//! [RESOURCE_DELAY] if the queue is already waiting on a restart.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::driver::SubmitResult;
use crate::hctx::{HardwareQueue, HctxFlags, HctxState};
use crate::queue::RequestQueue;
use crate::request::Request;
use crate::{probes, HctxId, Status, RESOURCE_DELAY};

impl RequestQueue {
    /// Run hardware queue `idx`, either on the calling thread or by handing
    /// it to the queue's runner thread.
    pub fn run_hw_queue(&self, idx: HctxId, r#async: bool) {
        let Some(hctx) = self.hctx(idx) else {
            return;
        };
        if self.is_quiesced() || hctx.is_stopped() || !self.has_work(hctx) {
            return;
        }
        if r#async {
            hctx.runner.kick();
        } else {
            self.run_now(idx);
        }
    }

    pub fn run_hw_queues(&self, r#async: bool) {
        for idx in 0..self.nr_hw_queues() {
            self.run_hw_queue(idx, r#async);
        }
    }

    /// Arrange for hardware queue `idx` to be run after `delay`
    pub fn delay_run_hw_queue(&self, idx: HctxId, delay: Duration) {
        if let Some(hctx) = self.hctx(idx) {
            if !hctx.is_stopped() {
                hctx.runner.kick_after(delay);
            }
        }
    }

    fn has_work(&self, hctx: &HardwareQueue) -> bool {
        hctx.has_dispatch()
            || hctx.has_pending_ctx()
            || self.sched.as_ref().map_or(false, |s| s.has_work(hctx.idx()))
    }

    /// Perform one dispatch pass over hardware queue `idx`
    pub(crate) fn run_now(&self, idx: HctxId) {
        let Some(hctx) = self.hctx(idx) else {
            return;
        };
        if !hctx.is_mapped() {
            return;
        }
        let Some(_gate) = self.gate.enter() else {
            return;
        };
        if hctx.is_stopped() {
            return;
        }
        hctx.account_run();
        probes::hctx_run!(|| (self.id(), idx as u64));
        self.sched_dispatch(hctx);
    }

    fn sched_dispatch(&self, hctx: &HardwareQueue) {
        let mut list: VecDeque<_> = hctx.lock_dispatch().drain(..).collect();

        if !list.is_empty() {
            // Retrying leftovers: further runs wait on a freed request
            hctx.set_state(HctxState::NEEDS_RESTART);
            if self.dispatch_rq_list(hctx, &mut list, false) {
                if self.sched.is_some() {
                    self.do_dispatch_sched(hctx);
                } else {
                    self.do_dispatch_ctx(hctx);
                }
            }
        } else if self.sched.is_some() {
            self.do_dispatch_sched(hctx);
        } else if hctx.dispatch_busy() != 0 {
            self.do_dispatch_ctx(hctx);
        } else {
            let mut list = hctx.flush_busy();
            self.dispatch_rq_list(hctx, &mut list, false);
        }
    }

    /// Pull requests from the scheduler one at a time, for as long as the
    /// driver keeps taking them.
    fn do_dispatch_sched(&self, hctx: &HardwareQueue) {
        let Some(sched) = self.sched.as_ref() else {
            return;
        };
        let idx = hctx.idx();
        loop {
            if !sched.has_work(idx) || hctx.has_dispatch() {
                break;
            }
            if !self.driver.get_budget(idx) {
                self.delay_run_hw_queue(idx, RESOURCE_DELAY);
                break;
            }
            let mut list: VecDeque<_> =
                sched.dispatch_requests(idx, 1).into();
            if list.is_empty() {
                self.driver.put_budget(idx);
                break;
            }
            if !self.dispatch_rq_list(hctx, &mut list, true) {
                break;
            }
        }
    }

    /// Pull requests from the software queues one at a time, round-robin,
    /// for as long as the driver keeps taking them.
    fn do_dispatch_ctx(&self, hctx: &HardwareQueue) {
        let idx = hctx.idx();
        loop {
            if !hctx.has_pending_ctx() || hctx.has_dispatch() {
                break;
            }
            if !self.driver.get_budget(idx) {
                self.delay_run_hw_queue(idx, RESOURCE_DELAY);
                break;
            }
            let Some(rq) = hctx.dequeue_one() else {
                self.driver.put_budget(idx);
                break;
            };
            let mut list = VecDeque::from([rq]);
            if !self.dispatch_rq_list(hctx, &mut list, true) {
                break;
            }
        }
    }

    /// Issue the requests of `list` to the driver, in order.
    ///
    /// Whatever cannot be issued is moved to the front of the hardware
    /// queue's dispatch list, and a re-run arranged.  Returns true if the
    /// driver accepted or failed at least one request.
    pub(crate) fn dispatch_rq_list(
        &self,
        hctx: &HardwareQueue,
        list: &mut VecDeque<Arc<Request>>,
        got_budget: bool,
    ) -> bool {
        if list.is_empty() {
            return false;
        }
        debug_assert!(!got_budget || list.len() == 1);

        let idx = hctx.idx();
        let mut queued = 0;
        let mut errors = 0;
        let mut busy = false;
        let mut no_tag = false;
        let mut no_budget = false;

        while let Some(rq) = list.front().cloned() {
            if !got_budget && !self.driver.get_budget(idx) {
                no_budget = true;
                break;
            }
            if !self.get_driver_tag(&rq) && !self.mark_tag_wait(hctx, &rq) {
                self.driver.put_budget(idx);
                if hctx.is_shared() {
                    no_tag = true;
                }
                break;
            }
            list.pop_front();

            // The driver may defer its doorbell until the last of a batch
            let last = match list.front() {
                None => true,
                Some(next) => !self.get_driver_tag(next),
            };

            self.start_request(&rq);
            probes::rq_issue!(|| (
                self.id(),
                u64::from(rq.id()),
                idx as u64,
                rq.tag().unwrap_or(usize::MAX) as u64
            ));
            match self.driver.submit(idx, &rq, last) {
                SubmitResult::Accepted => queued += 1,
                SubmitResult::Busy => {
                    if let Some(next) = list.front() {
                        self.put_driver_tag(next);
                    }
                    self.prep_requeue(&rq);
                    list.push_front(rq);
                    self.driver.put_budget(idx);
                    busy = true;
                    break;
                }
                SubmitResult::Error => {
                    slog::warn!(hctx.log, "driver failed request";
                        "req" => u64::from(rq.id()));
                    self.driver.put_budget(idx);
                    errors += 1;
                    self.end_request(&rq, Status::IoError);
                }
            }
        }

        hctx.account_batch(queued);

        if list.is_empty() {
            hctx.update_dispatch_busy(false);
            return queued + errors != 0;
        }

        {
            let mut dispatch = hctx.lock_dispatch();
            for rq in list.drain(..).rev() {
                dispatch.push_front(rq);
            }
        }

        // A restart is already due from a freed request, unless the tag we
        // wanted is held by another queue of the set and nothing is waiting
        // on it.
        let needs_restart = hctx.test_state(HctxState::NEEDS_RESTART);
        let delayed = if no_budget {
            self.delay_run_hw_queue(idx, RESOURCE_DELAY);
            true
        } else if !needs_restart
            || (no_tag && !hctx.test_state(HctxState::TAG_WAITING))
        {
            hctx.account_rerun(false);
            self.run_hw_queue(idx, true);
            false
        } else if busy {
            hctx.account_rerun(true);
            self.delay_run_hw_queue(idx, RESOURCE_DELAY);
            true
        } else {
            false
        };

        hctx.update_dispatch_busy(true);
        probes::hctx_busy!(|| (
            self.id(),
            idx as u64,
            hctx.dispatch_busy(),
            delayed as u8
        ));
        queued + errors != 0
    }

    /// Ensure `rq` holds a driver tag, taking one from its hardware queue's
    /// pool without waiting.
    pub(crate) fn get_driver_tag(&self, rq: &Arc<Request>) -> bool {
        if rq.tag().is_some() {
            return true;
        }
        let hctx = self.hctx_of(rq);
        let Some(pool) = hctx.tags() else {
            return false;
        };
        let shared = self.tag_busy(hctx);
        if shared && !self.hctx_may_queue(hctx, &pool) {
            return false;
        }
        let Some(tag) = pool.try_acquire(rq.is_reserved()) else {
            return false;
        };
        rq.set_tag(Some(tag));
        pool.set_rq(tag, rq);
        if shared {
            rq.inflight.store(true, Ordering::Release);
            hctx.inc_active();
        }
        true
    }

    /// Give back the driver tag of a request which also holds a scheduler
    /// tag, so it can be used by others while `rq` waits.
    pub(crate) fn put_driver_tag(&self, rq: &Arc<Request>) {
        if rq.sched_tag().is_none() {
            return;
        }
        self.release_driver_tag(self.hctx_of(rq), rq);
    }

    /// Release the driver tag of `rq`, if it holds one
    pub(crate) fn release_driver_tag(
        &self,
        hctx: &HardwareQueue,
        rq: &Arc<Request>,
    ) {
        let Some(tag) = rq.tag() else {
            return;
        };
        rq.set_tag(None);
        if rq.inflight.swap(false, Ordering::AcqRel) {
            hctx.dec_active();
        }
        self.tag_set().pool(hctx.idx()).release(tag);
    }

    /// Arrange to be re-run once a driver tag frees up, then make one more
    /// attempt at getting one for `rq`.
    ///
    /// Without shared tags, any freed request of this queue triggers the
    /// restart.  With them, the tag may be freed by another queue entirely,
    /// so the hardware queue waits on the pool itself.
    fn mark_tag_wait(&self, hctx: &HardwareQueue, rq: &Arc<Request>) -> bool {
        if !hctx.flags().contains(HctxFlags::TAG_SHARED) {
            hctx.set_state(HctxState::NEEDS_RESTART);
            return self.get_driver_tag(rq);
        }
        let Some(pool) = hctx.tags() else {
            return false;
        };
        if hctx.set_state(HctxState::TAG_WAITING) {
            // Already registered
            return false;
        }
        let idx = hctx.idx();
        probes::hctx_tag_wait!(|| (self.id(), idx as u64));
        pool.add_wait_hook(rq.is_reserved(), idx, hctx.wait_hook.clone());

        if !self.get_driver_tag(rq) {
            return false;
        }
        // Got one after all; the hook may have fired meanwhile, which only
        // costs a spurious run.
        if pool.remove_wait_hook(rq.is_reserved(), idx, &hctx.wait_hook) {
            hctx.clear_state(HctxState::TAG_WAITING);
        }
        true
    }

    /// Re-run a hardware queue which ran out of resources, now that a
    /// request of this queue has been freed.
    pub(crate) fn sched_restart(&self, hctx: &HardwareQueue) {
        if hctx.clear_state(HctxState::NEEDS_RESTART) {
            self.run_hw_queue(hctx.idx(), true);
        }
    }

    /// Issue `rq` straight to the driver, bypassing the software queues.
    ///
    /// Falls back to staging the request if the hardware queue cannot take it
    /// right now.
    pub(crate) fn try_issue_directly(&self, rq: Arc<Request>) {
        let idx = rq.hctx();
        let hctx = self.hctx_of(&rq);
        let Some(gate) = self.gate.enter() else {
            self.insert_ctx(rq, false);
            return;
        };
        if hctx.is_stopped() {
            self.insert_ctx(rq, false);
            return;
        }
        if !self.driver.get_budget(idx) {
            self.insert_ctx(rq, false);
            self.run_hw_queue(idx, true);
            return;
        }
        if !self.get_driver_tag(&rq) {
            self.driver.put_budget(idx);
            self.insert_ctx(rq, false);
            self.run_hw_queue(idx, true);
            return;
        }

        self.start_request(&rq);
        probes::rq_issue!(|| (
            self.id(),
            u64::from(rq.id()),
            idx as u64,
            rq.tag().unwrap_or(usize::MAX) as u64
        ));
        match self.driver.submit(idx, &rq, true) {
            SubmitResult::Accepted => {
                hctx.account_batch(1);
                hctx.update_dispatch_busy(false);
            }
            SubmitResult::Busy => {
                hctx.update_dispatch_busy(true);
                self.driver.put_budget(idx);
                self.prep_requeue(&rq);
                self.bypass_insert(rq, false);
                drop(gate);
                self.run_hw_queue(idx, true);
            }
            SubmitResult::Error => {
                self.driver.put_budget(idx);
                self.end_request(&rq, Status::IoError);
            }
        }
    }
}
