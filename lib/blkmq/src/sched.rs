// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to an I/O scheduler sitting in front of the hardware queues.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::request::Request;
use crate::HctxId;

/// An I/O scheduler (elevator) holding requests between allocation and
/// dispatch.  Requests handed to a scheduler carry a scheduler tag; the
/// driver tag is only acquired as they are dispatched.
pub trait Scheduler: Send + Sync + 'static {
    /// Take ownership of `rq`, queued for hardware queue `hctx`
    fn insert(&self, hctx: HctxId, rq: Arc<Request>, at_head: bool);

    /// Hand over up to `max` requests to be dispatched on `hctx`
    fn dispatch_requests(&self, hctx: HctxId, max: usize) -> Vec<Arc<Request>>;

    /// Does the scheduler hold requests for `hctx`?
    fn has_work(&self, hctx: HctxId) -> bool;
}

/// Scheduler which passes requests through in arrival order
pub struct FifoScheduler {
    queues: Vec<Mutex<VecDeque<Arc<Request>>>>,
}
impl FifoScheduler {
    pub fn new(nr_hw_queues: usize) -> Self {
        Self {
            queues: (0..nr_hw_queues)
                .map(|_| Mutex::new(VecDeque::new()))
                .collect(),
        }
    }
}
impl Scheduler for FifoScheduler {
    fn insert(&self, hctx: HctxId, rq: Arc<Request>, at_head: bool) {
        let mut queue = self.queues[hctx].lock().unwrap();
        if at_head {
            queue.push_front(rq);
        } else {
            queue.push_back(rq);
        }
    }

    fn dispatch_requests(&self, hctx: HctxId, max: usize) -> Vec<Arc<Request>> {
        let mut queue = self.queues[hctx].lock().unwrap();
        let n = max.min(queue.len());
        queue.drain(..n).collect()
    }

    fn has_work(&self, hctx: HctxId) -> bool {
        !self.queues[hctx].lock().unwrap().is_empty()
    }
}
