// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completion workers, finalizing requests within the cache domain of the
//! CPU which submitted them.

use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

use crate::queue::RequestQueue;
use crate::request::Request;
use crate::Status;

type Completion = (Arc<Request>, Status);

pub(crate) struct CompletionWorkers {
    domains: Vec<Sender<Completion>>,
}
impl CompletionWorkers {
    /// Spawn one worker per cache domain.  Workers exit once the queue (and
    /// with it this struct, closing their channels) is dropped.
    pub fn spawn(
        queue_id: u64,
        nr_domains: usize,
        queue: Weak<RequestQueue>,
    ) -> std::io::Result<Self> {
        let mut domains = Vec::with_capacity(nr_domains);
        for domain in 0..nr_domains {
            let (tx, rx) = unbounded::<Completion>();
            let queue = queue.clone();
            thread::Builder::new()
                .name(format!("blkmq-{queue_id}-comp{domain}"))
                .spawn(move || {
                    for (rq, status) in rx.iter() {
                        let Some(queue) = queue.upgrade() else {
                            break;
                        };
                        queue.finish(&rq, status);
                    }
                })?;
            domains.push(tx);
        }
        Ok(Self { domains })
    }

    /// Queue `rq` for finalization on the worker of `domain`.  Returns false
    /// if there is no such worker.
    pub fn send(
        &self,
        domain: usize,
        rq: Arc<Request>,
        status: Status,
    ) -> bool {
        match self.domains.get(domain) {
            Some(tx) => tx.send((rq, status)).is_ok(),
            None => false,
        }
    }
}
