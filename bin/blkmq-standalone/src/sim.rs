// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated block device, completing requests after a fixed service time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use blkmq::{
    Driver, HctxId, Request, RequestQueue, Status, SubmitResult, TimeoutAction,
};
use rand::Rng;

struct Pending {
    due: Instant,
    seq: u64,
    rq: Arc<Request>,
}
impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    // Reversed, so the max-heap yields the earliest deadline
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct DeviceState {
    pending: BinaryHeap<Pending>,
    seq: u64,
    exit: bool,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    busy: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceStats {
    pub accepted: u64,
    pub busy: u64,
    pub errors: u64,
    pub timeouts: u64,
}

pub struct SimDevice {
    cfg: blkmq_config_toml::Driver,
    state: Mutex<DeviceState>,
    cv: Condvar,
    counters: Counters,
}
impl SimDevice {
    pub fn new(cfg: blkmq_config_toml::Driver) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            state: Mutex::new(DeviceState::default()),
            cv: Condvar::new(),
            counters: Counters::default(),
        })
    }

    /// Deliver completions for accepted requests as they come due, until
    /// [SimDevice::shutdown] is called.
    ///
    /// Each hardware queue's interrupt is steered to a fixed CPU, so requests
    /// submitted elsewhere exercise remote completion when it is enabled.
    pub fn run_completions(&self, queue: &RequestQueue) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.exit {
                return;
            }
            let now = Instant::now();
            match state.pending.peek().map(|p| p.due) {
                Some(due) if due <= now => {
                    let Some(done) = state.pending.pop() else {
                        continue;
                    };
                    drop(state);
                    let irq_cpu = done.rq.hctx() % queue.nr_cpus();
                    queue.complete_on(&done.rq, Status::Success, irq_cpu);
                    state = self.state.lock().unwrap();
                }
                Some(due) => {
                    state = self.cv.wait_timeout(state, due - now).unwrap().0;
                }
                None => state = self.cv.wait(state).unwrap(),
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.exit = true;
        self.cv.notify_all();
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn stats(&self) -> DeviceStats {
        let load = |c: &AtomicU64| c.load(atomic::Ordering::Relaxed);
        DeviceStats {
            accepted: load(&self.counters.accepted),
            busy: load(&self.counters.busy),
            errors: load(&self.counters.errors),
            timeouts: load(&self.counters.timeouts),
        }
    }
}
impl Driver for SimDevice {
    fn submit(
        &self,
        _hctx: HctxId,
        rq: &Arc<Request>,
        _last: bool,
    ) -> SubmitResult {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.cfg.error_rate) {
            self.counters.errors.fetch_add(1, atomic::Ordering::Relaxed);
            return SubmitResult::Error;
        }

        let mut state = self.state.lock().unwrap();
        let full =
            self.cfg.capacity.is_some_and(|cap| state.pending.len() >= cap);
        if full || rng.gen_bool(self.cfg.busy_rate) {
            self.counters.busy.fetch_add(1, atomic::Ordering::Relaxed);
            return SubmitResult::Busy;
        }

        let seq = state.seq;
        state.seq += 1;
        state.pending.push(Pending {
            due: Instant::now() + self.cfg.latency(),
            seq,
            rq: rq.clone(),
        });
        self.cv.notify_one();
        self.counters.accepted.fetch_add(1, atomic::Ordering::Relaxed);
        SubmitResult::Accepted
    }

    fn timeout(&self, _rq: &Arc<Request>) -> TimeoutAction {
        self.counters.timeouts.fetch_add(1, atomic::Ordering::Relaxed);
        // Everything accepted completes eventually
        TimeoutAction::ResetTimer
    }
}
