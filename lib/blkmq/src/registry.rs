// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracking of live request queues, for CPU topology changes.

use std::sync::{Arc, Mutex, Weak};

use slog::Logger;

use crate::map::Topology;
use crate::queue::{ConfigError, RequestQueue};

/// Set of request queues to be remapped together when CPUs come and go
pub struct Registry {
    log: Logger,
    queues: Mutex<Vec<Weak<RequestQueue>>>,
}
impl Registry {
    pub fn new(log: Logger) -> Self {
        Self { log, queues: Mutex::new(Vec::new()) }
    }

    /// Track `queue` until it is dropped
    pub fn register(&self, queue: &Arc<RequestQueue>) {
        let mut queues = self.queues.lock().unwrap();
        queues.retain(|q| q.strong_count() != 0);
        queues.push(Arc::downgrade(queue));
    }

    /// Live registered queues
    pub fn queues(&self) -> Vec<Arc<RequestQueue>> {
        self.queues.lock().unwrap().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.queues().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remap every registered queue onto `topology`.
    ///
    /// All queues are frozen before any is remapped, and none is unfrozen
    /// until all have been, so that no queue admits requests against a stale
    /// map while another is being changed.
    pub fn cpu_topology_changed(
        &self,
        topology: &Topology,
    ) -> Result<(), ConfigError> {
        // Held throughout to serialize against concurrent topology changes
        let guard = self.queues.lock().unwrap();
        let queues: Vec<_> = guard.iter().filter_map(Weak::upgrade).collect();
        slog::info!(self.log, "CPU topology changed";
            "queues" => queues.len(),
            "online" => topology.online_cpus().count());

        for queue in queues.iter() {
            queue.freeze_start();
        }
        for queue in queues.iter() {
            queue.freeze_wait();
        }
        let res = queues
            .iter()
            .try_for_each(|queue| queue.remap_frozen(topology.clone()));
        for queue in queues.iter() {
            queue.unfreeze();
        }
        drop(guard);

        if let Err(e) = &res {
            slog::error!(self.log, "remap failed"; "error" => %e);
        }
        res
    }
}
