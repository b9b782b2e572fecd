// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Expiry of requests which the driver has held past their deadline.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::driver::TimeoutAction;
use crate::hctx::HctxState;
use crate::queue::RequestQueue;
use crate::request::{Request, RequestState};
use crate::{probes, Status};

#[derive(Default)]
struct TimerState {
    next: Option<Instant>,
    exit: bool,
}

/// One-shot timer for the next timeout scan, kept at the earliest deadline
/// it has been armed with.
pub(crate) struct TimeoutTimer {
    state: Mutex<TimerState>,
    cv: Condvar,
}
impl TimeoutTimer {
    pub fn new() -> Self {
        Self { state: Mutex::new(TimerState::default()), cv: Condvar::new() }
    }

    pub fn arm(&self, deadline: Instant) {
        let mut state = self.state.lock().unwrap();
        match state.next {
            Some(next) if next <= deadline => {}
            _ => {
                state.next = Some(deadline);
                self.cv.notify_one();
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.exit = true;
        self.cv.notify_all();
    }

    /// Wait for the timer to expire.  Returns false once it is shut down.
    pub fn wait_expired(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.exit {
                return false;
            }
            match state.next {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        state.next = None;
                        return true;
                    }
                    state = self.cv.wait_timeout(state, at - now).unwrap().0;
                }
                None => state = self.cv.wait(state).unwrap(),
            }
        }
    }
}

impl RequestQueue {
    /// Expire every started request past its deadline, and re-arm the timer
    /// for the earliest deadline still pending.
    pub(crate) fn timeout_scan(&self) {
        let now = Instant::now();
        let mut next: Option<Instant> = None;
        let mut expired: Vec<Arc<Request>> = Vec::new();

        for hctx in self.hctxs() {
            if !hctx.is_mapped() {
                continue;
            }
            let Some(pool) = hctx.tags() else {
                continue;
            };
            let mut outstanding = false;
            pool.busy_iter(|_, rq| {
                if rq.queue_id() != self.id() {
                    return;
                }
                outstanding = true;
                if !rq.is_started() || rq.is_complete() {
                    return;
                }
                let Some(deadline) = rq.deadline() else {
                    return;
                };
                if deadline <= now {
                    expired.push(rq.clone());
                } else {
                    next = Some(next.map_or(deadline, |n| n.min(deadline)));
                }
            });
            if !outstanding
                && hctx.nr_active() == 0
                && hctx.test_state(HctxState::TAG_ACTIVE)
            {
                self.tag_idle(hctx);
            }
        }

        self.expire(&expired, now);
        if let Some(next) = next {
            self.timer.arm(next);
        }
    }

    /// Time out each of `expired`, as collected by a scan at `now`.
    ///
    /// A request may have been completed, requeued or restarted with a new
    /// deadline since it was collected, so its state is checked again once
    /// COMPLETE has been claimed.
    pub(crate) fn expire(&self, expired: &[Arc<Request>], now: Instant) {
        for rq in expired {
            if !rq.is_started() {
                continue;
            }
            // Whoever sets COMPLETE first owns the request
            if rq.mark_complete() {
                continue;
            }
            let due = rq.deadline().is_some_and(|deadline| deadline <= now);
            if !rq.is_started() || !due {
                rq.clear_complete();
                continue;
            }
            self.rq_timed_out(rq);
        }
    }

    fn rq_timed_out(&self, rq: &Arc<Request>) {
        let action = self.driver.timeout(rq);
        probes::rq_timeout!(|| (
            self.id(),
            u64::from(rq.id()),
            <&'static str>::from(action).to_string()
        ));
        match action {
            TimeoutAction::Handled => {
                rq.set_state(RequestState::Completing);
                self.finish(rq, rq.status().unwrap_or(Status::Success));
            }
            TimeoutAction::ResetTimer => {
                let deadline = Instant::now() + self.opts.timeout;
                rq.set_deadline(deadline);
                self.timer.arm(deadline);
                rq.clear_complete();
            }
            TimeoutAction::NotHandled => {
                rq.set_state(RequestState::TimedOut);
                slog::warn!(self.log, "request timed out";
                    "req" => u64::from(rq.id()),
                    "hctx" => rq.hctx(),
                    "tag" => rq.tag(),
                );
            }
        }
    }
}
