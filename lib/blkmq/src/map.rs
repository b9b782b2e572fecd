// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping of CPUs onto hardware queues.

use std::sync::Arc;

use crate::{CpuId, HctxId};

/// Which CPUs exist, which are online, and how they share caches
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    online: Vec<bool>,
    cache_domain: Vec<usize>,
}
impl Topology {
    /// All `nr_cpus` online, grouped into cache domains of `domain_size`
    /// consecutive CPUs.
    pub fn uniform(nr_cpus: usize, domain_size: usize) -> Self {
        let domain_size = domain_size.max(1);
        Self {
            online: vec![true; nr_cpus],
            cache_domain: (0..nr_cpus).map(|c| c / domain_size).collect(),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.online.len()
    }

    pub fn set_online(&mut self, cpu: CpuId, online: bool) {
        self.online[cpu] = online;
    }

    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.online.get(cpu).copied().unwrap_or(false)
    }

    pub fn online_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.online.iter().enumerate().filter(|(_, on)| **on).map(|(c, _)| c)
    }

    pub fn cache_domain(&self, cpu: CpuId) -> usize {
        self.cache_domain[cpu]
    }

    pub fn nr_cache_domains(&self) -> usize {
        self.cache_domain.iter().max().map(|d| d + 1).unwrap_or(0)
    }

    pub fn share_cache(&self, a: CpuId, b: CpuId) -> bool {
        self.cache_domain[a] == self.cache_domain[b]
    }
}

/// Strategy for assigning CPUs to hardware queues
pub trait MapStrategy: Send + Sync + 'static {
    /// Return the hardware queue for every CPU in `topo` (online or not),
    /// each less than `nr_hw_queues`.
    fn map(&self, topo: &Topology, nr_hw_queues: usize) -> Vec<HctxId>;
}

/// Spread online CPUs across hardware queues in turn.  Once every queue has a
/// CPU, further CPUs join the queue of the first CPU in their cache domain,
/// while the first CPU of each new domain continues the rotation.
#[derive(Default, Copy, Clone, Debug)]
pub struct RoundRobin;
impl MapStrategy for RoundRobin {
    fn map(&self, topo: &Topology, nr_hw_queues: usize) -> Vec<HctxId> {
        let mut map = vec![0; topo.nr_cpus()];
        let mut first_in_domain: Vec<Option<CpuId>> =
            vec![None; topo.nr_cache_domains()];
        let mut next = 0;
        for (n, cpu) in topo.online_cpus().enumerate() {
            let domain = topo.cache_domain(cpu);
            map[cpu] = match first_in_domain[domain] {
                Some(first) if n >= nr_hw_queues => map[first],
                _ => {
                    next += 1;
                    (next - 1) % nr_hw_queues
                }
            };
            first_in_domain[domain].get_or_insert(cpu);
        }
        // Offline CPUs follow the round-robin order of their index
        for cpu in 0..topo.nr_cpus() {
            if !topo.is_online(cpu) {
                map[cpu] = cpu % nr_hw_queues;
            }
        }
        map
    }
}

/// Published CPU lookup table, replaced wholesale on remap
#[derive(Debug)]
pub(crate) struct QueueMap {
    pub generation: u64,
    /// Hardware queue serving each CPU
    hctx_of: Vec<HctxId>,
    /// Software queue (by CPU) receiving each CPU's submissions; an offline
    /// CPU is redirected to an online one
    ctx_of: Vec<CpuId>,
    pub topology: Topology,
}
impl QueueMap {
    pub fn build(
        strategy: &dyn MapStrategy,
        topology: Topology,
        nr_hw_queues: usize,
        generation: u64,
    ) -> Arc<Self> {
        let hctx_of = strategy.map(&topology, nr_hw_queues);
        assert_eq!(hctx_of.len(), topology.nr_cpus());
        assert!(hctx_of.iter().all(|h| *h < nr_hw_queues));

        let first_online = topology.online_cpus().next();
        let ctx_of: Vec<CpuId> = (0..topology.nr_cpus())
            .map(|cpu| {
                if topology.is_online(cpu) {
                    return cpu;
                }
                topology
                    .online_cpus()
                    .find(|c| hctx_of[*c] == hctx_of[cpu])
                    .or(first_online)
                    .unwrap_or(cpu)
            })
            .collect();
        let hctx_of =
            (0..topology.nr_cpus()).map(|cpu| hctx_of[ctx_of[cpu]]).collect();

        Arc::new(Self { generation, hctx_of, ctx_of, topology })
    }

    pub fn hctx_for(&self, cpu: CpuId) -> HctxId {
        self.hctx_of[cpu]
    }

    pub fn ctx_for(&self, cpu: CpuId) -> CpuId {
        self.ctx_of[cpu]
    }

    /// Online CPUs served by `hctx`, in CPU order
    pub fn cpus_of(&self, hctx: HctxId) -> impl Iterator<Item = CpuId> + '_ {
        self.topology.online_cpus().filter(move |c| self.hctx_of[*c] == hctx)
    }
}
