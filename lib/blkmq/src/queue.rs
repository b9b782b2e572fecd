// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The request queue: top-level owner of the hardware and software queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use slog::Logger;
use thiserror::Error;

use crate::completion::CompletionWorkers;
use crate::ctx::{CtxStats, SoftwareQueue};
use crate::driver::Driver;
use crate::freeze::{DispatchGate, UsageCounter};
use crate::hctx::{HardwareQueue, HctxFlags, HctxState, HctxStats};
use crate::map::{MapStrategy, QueueMap, RoundRobin, Topology};
use crate::request::{ReqId, Request};
use crate::sched::Scheduler;
use crate::tag::{Tag, TagError, TagPool, TagSet};
use crate::timeout::TimeoutTimer;
use crate::{probes, CpuId, HctxId, MetricConsumer, Status, MAX_HW_QUEUES};

/// Source of unique ids for [RequestQueue]s within a process
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of a [RequestQueue]
#[derive(Clone, Debug)]
pub struct QueueOpts {
    pub nr_hw_queues: usize,
    /// Tags per hardware queue
    pub queue_depth: usize,
    /// Tags set aside for reserved allocations
    pub reserved_tags: usize,
    /// Time a started request may remain outstanding before its driver is
    /// consulted through [Driver::timeout]
    pub timeout: Duration,
    pub nr_cpus: usize,
    /// CPUs per shared cache domain
    pub cache_domain_size: usize,
    /// Complete requests on the cache domain of the submitting CPU
    pub remote_completion: bool,
    /// Driver submission may sleep
    pub blocking: bool,
    /// Scheduler tags per hardware queue when a scheduler is attached,
    /// defaulting to twice `queue_depth`
    pub sched_depth: Option<usize>,
}
impl Default for QueueOpts {
    fn default() -> Self {
        Self {
            nr_hw_queues: 1,
            queue_depth: 64,
            reserved_tags: 0,
            timeout: DEFAULT_TIMEOUT,
            nr_cpus: 1,
            cache_domain_size: 1,
            remote_completion: false,
            blocking: false,
            sched_depth: None,
        }
    }
}
impl QueueOpts {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::ZeroDepth);
        }
        if self.reserved_tags >= self.queue_depth {
            return Err(ConfigError::TooManyReserved {
                reserved: self.reserved_tags,
                depth: self.queue_depth,
            });
        }
        if self.nr_hw_queues == 0 {
            return Err(ConfigError::NoHwQueues);
        }
        if self.nr_hw_queues > MAX_HW_QUEUES {
            return Err(ConfigError::TooManyHwQueues(self.nr_hw_queues));
        }
        if self.nr_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.sched_depth == Some(0) {
            return Err(ConfigError::ZeroDepth);
        }
        Ok(())
    }

    pub fn sched_depth(&self) -> usize {
        self.sched_depth.unwrap_or(self.queue_depth * 2)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("queue depth must be non-zero")]
    ZeroDepth,
    #[error("reserved tags ({reserved}) must be fewer than depth ({depth})")]
    TooManyReserved { reserved: usize, depth: usize },
    #[error("at least one hardware queue is required")]
    NoHwQueues,
    #[error("{0} hardware queues exceeds the maximum of {MAX_HW_QUEUES}")]
    TooManyHwQueues(usize),
    #[error("at least one CPU is required")]
    NoCpus,
    #[error("tag set has {set} hardware queues, expected {expected}")]
    TagSetMismatch { set: usize, expected: usize },
    #[error("topology has {got} CPUs, expected {expected}")]
    TopologyMismatch { got: usize, expected: usize },
    #[error("tag pool setup failed")]
    Tags(#[from] TagError),
    #[error("failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
}

/// Failure to allocate a [Request]
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("no tag available")]
    ResourceExhausted,
    #[error("queue is frozen")]
    QueueFrozen,
    #[error("queue is being torn down")]
    Dying,
    #[error("hardware queue {0} is unmapped")]
    Unmapped(HctxId),
    #[error("no hardware queue {0}")]
    InvalidHctx(HctxId),
    #[error("no CPU {0}")]
    InvalidCpu(CpuId),
}

/// Optional collaborators of a [RequestQueue]
#[derive(Default)]
pub struct QueueParts {
    /// I/O scheduler to stage requests in, rather than the software queues
    pub scheduler: Option<Arc<dyn Scheduler>>,
    /// Driver tags shared with other request queues
    pub tag_set: Option<Arc<TagSet>>,
    /// CPU mapping strategy ([RoundRobin] if absent)
    pub strategy: Option<Box<dyn MapStrategy>>,
    /// Initial CPU topology (all CPUs online if absent)
    pub topology: Option<Topology>,
}

pub struct RequestQueue {
    id: u64,
    pub(crate) log: Logger,
    pub(crate) opts: QueueOpts,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) sched: Option<Arc<dyn Scheduler>>,
    tag_set: Arc<TagSet>,

    strategy: Box<dyn MapStrategy>,
    map: RwLock<Arc<QueueMap>>,
    ctxs: Vec<Arc<SoftwareQueue>>,
    hctxs: Vec<HardwareQueue>,

    pub(crate) usage: UsageCounter,
    pub(crate) gate: DispatchGate,
    pub(crate) requeue_list: Mutex<VecDeque<Arc<Request>>>,
    pub(crate) timer: Arc<TimeoutTimer>,
    pub(crate) completion: Mutex<Option<CompletionWorkers>>,
    pub(crate) metrics: RwLock<Option<Arc<dyn MetricConsumer>>>,

    /// Serializes control-plane operations (resize, remap, sharing changes)
    control: Mutex<()>,
    next_id: Mutex<ReqId>,
    pub(crate) epoch: Instant,
    pub(crate) self_ref: Weak<Self>,
}

impl RequestQueue {
    /// Create a request queue with its own tag set, no scheduler and all CPUs
    /// online.
    pub fn new(
        opts: QueueOpts,
        driver: Arc<dyn Driver>,
        log: Logger,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::with_parts(opts, driver, QueueParts::default(), log)
    }

    pub fn with_parts(
        opts: QueueOpts,
        driver: Arc<dyn Driver>,
        parts: QueueParts,
        log: Logger,
    ) -> Result<Arc<Self>, ConfigError> {
        opts.validate()?;

        let tag_set = match parts.tag_set {
            Some(set) => {
                if set.nr_hw_queues() != opts.nr_hw_queues {
                    return Err(ConfigError::TagSetMismatch {
                        set: set.nr_hw_queues(),
                        expected: opts.nr_hw_queues,
                    });
                }
                set
            }
            None => TagSet::new(
                opts.nr_hw_queues,
                opts.queue_depth,
                opts.reserved_tags,
            )?,
        };
        let sched_pools = match parts.scheduler {
            Some(_) => {
                let depth = opts.sched_depth();
                (0..opts.nr_hw_queues)
                    .map(|_| {
                        TagPool::new(depth, tag_set.reserved(), depth)
                            .map(|p| Some(Arc::new(p)))
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => vec![None; opts.nr_hw_queues],
        };
        let topology = parts.topology.unwrap_or_else(|| {
            Topology::uniform(opts.nr_cpus, opts.cache_domain_size)
        });
        if topology.nr_cpus() != opts.nr_cpus {
            return Err(ConfigError::TopologyMismatch {
                got: topology.nr_cpus(),
                expected: opts.nr_cpus,
            });
        }
        let strategy = parts.strategy.unwrap_or_else(|| Box::new(RoundRobin));
        let map = QueueMap::build(
            strategy.as_ref(),
            topology,
            opts.nr_hw_queues,
            1,
        );

        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let log = log.new(slog::o!("queue" => id));
        let mut hflags = HctxFlags::empty();
        if opts.blocking {
            hflags |= HctxFlags::BLOCKING;
        }

        let queue = Arc::new_cyclic(|self_ref: &Weak<Self>| {
            let hctxs = sched_pools
                .into_iter()
                .enumerate()
                .map(|(idx, sched_tags)| {
                    HardwareQueue::new(
                        idx,
                        opts.nr_cpus,
                        self_ref.clone(),
                        tag_set.pool(idx).clone(),
                        sched_tags,
                        hflags,
                        log.new(slog::o!("hctx" => idx)),
                    )
                })
                .collect();
            let ctxs = (0..opts.nr_cpus)
                .map(|cpu| Arc::new(SoftwareQueue::new(cpu)))
                .collect();
            Self {
                id,
                log: log.clone(),
                opts: opts.clone(),
                driver,
                sched: parts.scheduler,
                tag_set,
                strategy,
                map: RwLock::new(map.clone()),
                ctxs,
                hctxs,
                usage: UsageCounter::new(),
                gate: DispatchGate::new(),
                requeue_list: Mutex::new(VecDeque::new()),
                timer: Arc::new(TimeoutTimer::new()),
                completion: Mutex::new(None),
                metrics: RwLock::new(None),
                control: Mutex::new(()),
                next_id: Mutex::new(ReqId::START),
                epoch: Instant::now(),
                self_ref: self_ref.clone(),
            }
        });
        queue.map_swqueue(&map);
        queue.spawn_workers()?;
        queue.attach_tag_set();

        slog::info!(queue.log, "request queue created";
            "hw_queues" => opts.nr_hw_queues,
            "depth" => opts.queue_depth,
            "reserved" => opts.reserved_tags,
            "cpus" => opts.nr_cpus,
            "scheduler" => queue.sched.is_some(),
        );
        Ok(queue)
    }

    fn spawn_workers(self: &Arc<Self>) -> Result<(), std::io::Error> {
        for hctx in self.hctxs.iter() {
            let runner = hctx.runner.clone();
            let weak = Arc::downgrade(self);
            let idx = hctx.idx();
            thread::Builder::new()
                .name(format!("blkmq-{}-hctx{idx}", self.id))
                .spawn(move || {
                    while runner.wait_work() {
                        match weak.upgrade() {
                            Some(queue) => queue.run_now(idx),
                            None => break,
                        }
                    }
                })?;
        }

        let timer = self.timer.clone();
        let weak = Arc::downgrade(self);
        thread::Builder::new()
            .name(format!("blkmq-{}-timeout", self.id))
            .spawn(move || {
                while timer.wait_expired() {
                    match weak.upgrade() {
                        Some(queue) => queue.timeout_scan(),
                        None => break,
                    }
                }
            })?;

        if self.opts.remote_completion {
            let map = self.map();
            let workers = CompletionWorkers::spawn(
                self.id,
                map.topology.nr_cache_domains(),
                Arc::downgrade(self),
            )?;
            *self.completion.lock().unwrap() = Some(workers);
        }
        Ok(())
    }

    /// Register with the tag set, switching every user into shared-tag mode
    /// once there is more than one.
    fn attach_tag_set(self: &Arc<Self>) {
        let mut users = self.tag_set.users.lock().unwrap();
        users.retain(|(_, w)| w.strong_count() != 0);
        let other = match users.as_slice() {
            [(_, w)] => w.upgrade(),
            _ => None,
        };
        users.push((self.id, Arc::downgrade(self)));
        if users.len() > 1 {
            for hctx in self.hctxs.iter() {
                hctx.set_flags(HctxFlags::TAG_SHARED, true);
            }
        }
        drop(users);

        // The sole previous user must be switched over while frozen
        if let Some(other) = other {
            other.set_tags_shared(true);
        }
    }

    fn detach_tag_set(&self) {
        let mut users = self.tag_set.users.lock().unwrap();
        users.retain(|(id, w)| *id != self.id && w.strong_count() != 0);
        let other = match users.as_slice() {
            [(_, w)] => w.upgrade(),
            _ => None,
        };
        drop(users);

        if let Some(other) = other {
            other.set_tags_shared(false);
        }
    }

    fn set_tags_shared(&self, shared: bool) {
        self.freeze();
        for hctx in self.hctxs.iter() {
            hctx.set_flags(HctxFlags::TAG_SHARED, shared);
            if !shared {
                self.tag_idle(hctx);
            }
        }
        self.unfreeze();
        slog::info!(self.log, "tag sharing changed"; "shared" => shared);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn opts(&self) -> &QueueOpts {
        &self.opts
    }

    pub fn nr_hw_queues(&self) -> usize {
        self.hctxs.len()
    }

    pub fn nr_cpus(&self) -> usize {
        self.ctxs.len()
    }

    pub fn tag_set(&self) -> &Arc<TagSet> {
        &self.tag_set
    }

    pub fn hctx(&self, idx: HctxId) -> Option<&HardwareQueue> {
        self.hctxs.get(idx)
    }

    pub(crate) fn hctxs(&self) -> impl Iterator<Item = &HardwareQueue> {
        self.hctxs.iter()
    }

    pub fn ctx(&self, cpu: CpuId) -> Option<&Arc<SoftwareQueue>> {
        self.ctxs.get(cpu)
    }

    /// Hardware queue `rq` was allocated against
    pub(crate) fn hctx_of(&self, rq: &Request) -> &HardwareQueue {
        &self.hctxs[rq.hctx()]
    }

    /// Software queue `rq` is staged on
    pub(crate) fn ctx_of(&self, rq: &Request) -> &Arc<SoftwareQueue> {
        &self.ctxs[rq.cpu()]
    }

    pub(crate) fn map(&self) -> Arc<QueueMap> {
        self.map.read().unwrap().clone()
    }

    /// Hardware queue currently serving submissions from `cpu`
    pub fn hctx_for_cpu(&self, cpu: CpuId) -> Option<HctxId> {
        (cpu < self.nr_cpus()).then(|| self.map().hctx_for(cpu))
    }

    /// Version of the CPU map, bumped by every remap
    pub fn map_generation(&self) -> u64 {
        self.map().generation
    }

    pub fn set_metric_consumer(&self, consumer: Arc<dyn MetricConsumer>) {
        *self.metrics.write().unwrap() = Some(consumer);
    }

    pub fn hctx_stats(&self, idx: HctxId) -> Option<HctxStats> {
        self.hctx(idx).map(HardwareQueue::stats)
    }

    pub fn ctx_stats(&self, cpu: CpuId) -> Option<CtxStats> {
        self.ctx(cpu).map(|c| c.stats())
    }

    /// Requests currently allocated and not yet freed
    pub fn live_requests(&self) -> usize {
        self.usage.live()
    }

    /// Requests issued to the driver and not yet completed
    pub fn in_flight(&self) -> usize {
        let mut count = 0;
        self.busy_iter(|_, _, rq| {
            if rq.is_started() && !rq.is_complete() {
                count += 1;
            }
        });
        count
    }

    /// Call `f` for every request of this queue holding a driver tag
    pub fn busy_iter(&self, mut f: impl FnMut(HctxId, Tag, &Arc<Request>)) {
        for hctx in self.hctxs.iter() {
            let Some(pool) = hctx.tags() else {
                continue;
            };
            pool.busy_iter(|tag, rq| {
                if rq.queue_id() == self.id {
                    f(hctx.idx(), tag, rq);
                }
            });
        }
    }

    /// Look up the request of this queue holding driver tag `tag` on `hctx`
    pub fn tag_to_rq(&self, hctx: HctxId, tag: Tag) -> Option<Arc<Request>> {
        let rq = self.hctx(hctx)?.tags()?.tag_to_rq(tag)?;
        (rq.queue_id() == self.id).then_some(rq)
    }

    pub(crate) fn next_req_id(&self) -> ReqId {
        self.next_id.lock().unwrap().advance()
    }

    // Freeze and quiesce

    /// Stop admitting requests and begin draining those outstanding
    pub fn freeze_start(&self) {
        let depth = self.usage.freeze_start();
        probes::queue_freeze!(|| (self.id, depth as u64));
        if depth == 1 {
            slog::info!(self.log, "freezing queue");
            self.run_hw_queues(false);
        }
    }

    /// Wait for every outstanding request to be freed
    pub fn freeze_wait(&self) {
        self.usage.freeze_wait();
    }

    /// Stop admission and wait for every outstanding request to be freed.
    ///
    /// Freezes nest: admission resumes once each freeze has been matched by
    /// an [RequestQueue::unfreeze].
    pub fn freeze(&self) {
        self.freeze_start();
        self.freeze_wait();
    }

    pub fn unfreeze(&self) {
        let depth = self.usage.unfreeze();
        probes::queue_unfreeze!(|| (self.id, depth as u64));
        if depth == 0 {
            slog::info!(self.log, "queue unfrozen");
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.usage.freeze_depth() != 0
    }

    /// Pause dispatch, waiting for any dispatch already underway to finish.
    /// Completions and timeouts carry on.
    pub fn quiesce(&self) {
        self.gate.quiesce();
        slog::info!(self.log, "queue quiesced");
    }

    pub fn unquiesce(&self) {
        self.gate.unquiesce();
        slog::info!(self.log, "queue unquiesced");
        self.run_hw_queues(true);
    }

    pub fn is_quiesced(&self) -> bool {
        self.gate.is_quiesced()
    }

    // Reconfiguration

    /// Change the number of tags per hardware queue.
    ///
    /// Resizes the scheduler pools if a scheduler is attached, otherwise the
    /// driver pools.  The queue is frozen and quiesced for the duration.
    /// Either every pool takes the new depth or none does: with a shared tag
    /// set, a tag held by another queue fails the whole resize.
    pub fn resize_tags(&self, depth: usize) -> Result<(), TagError> {
        let _guard = self.control.lock().unwrap();
        self.freeze();
        self.quiesce();

        let pools: Vec<&Arc<TagPool>> = self
            .hctxs
            .iter()
            .map(|hctx| match hctx.sched_tags() {
                Some(pool) => pool,
                None => self.tag_set.pool(hctx.idx()),
            })
            .collect();
        let res = resize_pools(&pools, depth);

        self.unquiesce();
        self.unfreeze();
        match &res {
            Ok(()) => {
                slog::info!(self.log, "resized tags"; "depth" => depth);
            }
            Err(e) => {
                slog::error!(self.log, "failed to resize tags";
                    "depth" => depth, "error" => %e);
            }
        }
        res
    }

    /// Rebuild the CPU map for a new topology
    pub fn remap_cpus(&self, topology: Topology) -> Result<(), ConfigError> {
        self.freeze();
        let res = self.remap_frozen(topology);
        self.unfreeze();
        res
    }

    /// Rebuild the CPU map of an already frozen queue
    pub fn remap_frozen(&self, topology: Topology) -> Result<(), ConfigError> {
        assert!(self.is_frozen(), "remap of an unfrozen queue");
        if topology.nr_cpus() != self.nr_cpus() {
            return Err(ConfigError::TopologyMismatch {
                got: topology.nr_cpus(),
                expected: self.nr_cpus(),
            });
        }
        let _guard = self.control.lock().unwrap();
        let generation = self.map().generation + 1;
        let map = QueueMap::build(
            self.strategy.as_ref(),
            topology,
            self.nr_hw_queues(),
            generation,
        );
        self.map_swqueue(&map);
        *self.map.write().unwrap() = map;

        let mapped = self.hctxs.iter().filter(|h| h.is_mapped()).count();
        slog::info!(self.log, "remapped CPUs";
            "generation" => generation, "mapped_hctxs" => mapped);
        Ok(())
    }

    /// Link the software queues of online CPUs to their hardware queues, and
    /// release the driver tags of hardware queues left without any.
    fn map_swqueue(&self, map: &QueueMap) {
        for hctx in self.hctxs.iter() {
            let idx = hctx.idx();
            let ctxs: Vec<_> =
                map.cpus_of(idx).map(|cpu| self.ctxs[cpu].clone()).collect();
            debug_assert!(ctxs.iter().all(|c| c.is_empty()));

            let unmapped = ctxs.is_empty() && idx != 0;
            hctx.set_ctxs(ctxs);
            if unmapped {
                self.tag_idle(hctx);
                hctx.set_tags(None);
            } else if hctx.tags().is_none() {
                hctx.set_tags(Some(self.tag_set.pool(idx).clone()));
            }
        }
    }

    // Hardware queue state

    pub fn stop_hw_queue(&self, idx: HctxId) {
        if let Some(hctx) = self.hctx(idx) {
            hctx.set_state(HctxState::STOPPED);
        }
    }

    pub fn start_hw_queue(&self, idx: HctxId) {
        if let Some(hctx) = self.hctx(idx) {
            hctx.clear_state(HctxState::STOPPED);
            self.run_hw_queue(idx, false);
        }
    }

    pub fn stop_hw_queues(&self) {
        for hctx in self.hctxs.iter() {
            hctx.set_state(HctxState::STOPPED);
        }
    }

    pub fn start_hw_queues(&self) {
        for idx in 0..self.nr_hw_queues() {
            self.start_hw_queue(idx);
        }
    }

    /// Restart only those hardware queues which are stopped
    pub fn start_stopped_hw_queues(&self, r#async: bool) {
        for hctx in self.hctxs.iter() {
            if hctx.clear_state(HctxState::STOPPED) {
                self.run_hw_queue(hctx.idx(), r#async);
            }
        }
    }

    /// Mark a hardware queue as an active user of a shared tag pool.
    /// Returns true if tags are shared.
    pub(crate) fn tag_busy(&self, hctx: &HardwareQueue) -> bool {
        if !hctx.is_shared() {
            return false;
        }
        if !hctx.set_state(HctxState::TAG_ACTIVE) {
            if let Some(pool) = hctx.tags() {
                pool.queue_active();
            }
        }
        true
    }

    /// Drop a hardware queue from the active users of its tag pool
    pub(crate) fn tag_idle(&self, hctx: &HardwareQueue) {
        if hctx.clear_state(HctxState::TAG_ACTIVE) {
            if let Some(pool) = hctx.tags() {
                pool.queue_idle();
                pool.wake_all();
            }
        }
    }

    /// May `hctx` take another driver tag from its shared pool?
    pub(crate) fn hctx_may_queue(
        &self,
        hctx: &HardwareQueue,
        pool: &TagPool,
    ) -> bool {
        if !hctx.is_shared() || !hctx.test_state(HctxState::TAG_ACTIVE) {
            return true;
        }
        hctx.nr_active() < pool.fair_share()
    }
}

/// Resize every one of `pools` to `depth`, or leave them all as they were
fn resize_pools(pools: &[&Arc<TagPool>], depth: usize) -> Result<(), TagError> {
    pools.iter().try_for_each(|pool| pool.check_resize(depth))?;

    let previous: Vec<usize> = pools.iter().map(|pool| pool.depth()).collect();
    for (n, pool) in pools.iter().enumerate() {
        if let Err(e) = pool.resize(depth) {
            // Another user of a shared set took a tag since the check
            for (pool, prev) in pools[..n].iter().zip(previous.iter()) {
                pool.restore_depth(*prev);
            }
            return Err(e);
        }
    }
    Ok(())
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.usage.mark_dying();
        for hctx in self.hctxs.iter() {
            hctx.runner.shutdown();
            self.tag_idle(hctx);
            if let Some(pool) = hctx.tags() {
                pool.wake_all();
            }
            if let Some(pool) = hctx.sched_tags() {
                pool.wake_all();
            }
        }
        self.timer.shutdown();
        // Tags of a shared set must not outlive the queue holding them
        self.end_outstanding(Status::IoError);
        self.detach_tag_set();
        slog::info!(self.log, "request queue destroyed");
    }
}
