// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tag allocation.
//!
//! A [TagPool] hands out small integers ("tags") naming the in-flight slots of
//! one hardware queue.  The lowest `reserved` tags form a private partition
//! which is only handed to callers asking for reserved semantics.  Allocation
//! is a test-and-set against an [AtomicBitmap] with no pool-wide lock.
//!
//! Callers which cannot find a free tag may wait for one.  Waiters register on
//! one of several wait shards (one per bitmap word), and every release wakes at
//! most one waiter, starting with the shard holding the released bit.  A wake
//! is a hint rather than a grant: the woken party retries the allocation and
//! may well lose the race to a fresh caller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use thiserror::Error;
use tokio::sync::Notify;

use crate::bitmap::{AtomicBitmap, WORD_BITS};
use crate::queue::RequestQueue;
use crate::request::Request;
use crate::HctxId;

pub type Tag = usize;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("no tag available")]
    Exhausted,
    #[error("tags still outstanding ({0})")]
    ResizeBusy(usize),
    #[error("invalid depth {depth} (reserved {reserved}, capacity {capacity})")]
    InvalidDepth { depth: usize, reserved: usize, capacity: usize },
}

/// Party interested in a wakeup when a tag is released, without blocking a
/// thread on it.  Hardware queues register one of these when dispatch runs out
/// of driver tags in shared-tag mode.
pub trait TagWaitHook: Send + Sync {
    fn tag_available(&self);
}

#[derive(Default)]
struct Waiters {
    sync: usize,
    /// Sync waiters already notified but not yet back from their wait
    sync_woken: usize,
    r#async: usize,
    async_woken: usize,
    hooks: VecDeque<Arc<dyn TagWaitHook>>,
}

struct WaitShard {
    waiters: Mutex<Waiters>,
    cv: Condvar,
    notify: Notify,
}
impl WaitShard {
    fn new() -> Self {
        Self {
            waiters: Mutex::new(Waiters::default()),
            cv: Condvar::new(),
            notify: Notify::new(),
        }
    }
}

pub struct TagPool {
    map: AtomicBitmap,
    slots: Box<[Mutex<Option<Arc<Request>>>]>,
    reserved: usize,
    depth: AtomicUsize,
    cursor: AtomicUsize,

    /// Wait shards for regular tags, one per bitmap word
    shards: Box<[WaitShard]>,
    /// Reserved waiters are kept apart so a reserved release is never spent
    /// on a regular waiter (and vice versa)
    reserved_shard: WaitShard,
    /// Total registered waiters (of any kind) across all shards
    nwaiters: AtomicUsize,

    /// Hardware queues currently counted as active users of this pool when it
    /// is shared by multiple request queues.
    active_queues: AtomicUsize,
}
impl TagPool {
    /// Create a pool of `depth` tags, the lowest `reserved` of which are only
    /// handed to reserved allocations.  The pool may later be resized up to
    /// `capacity` tags.
    pub fn new(
        depth: usize,
        reserved: usize,
        capacity: usize,
    ) -> Result<Self, TagError> {
        let capacity = capacity.max(depth);
        if depth == 0 || reserved >= depth {
            return Err(TagError::InvalidDepth { depth, reserved, capacity });
        }
        let map = AtomicBitmap::new(capacity);
        let shards = (0..map.nwords()).map(|_| WaitShard::new()).collect();
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        Ok(Self {
            map,
            slots,
            reserved,
            depth: AtomicUsize::new(depth),
            cursor: AtomicUsize::new(reserved),
            shards,
            reserved_shard: WaitShard::new(),
            nwaiters: AtomicUsize::new(0),
            active_queues: AtomicUsize::new(0),
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    /// Attempt to allocate a tag without waiting
    pub fn try_acquire(&self, reserved: bool) -> Option<Tag> {
        if reserved {
            if self.reserved == 0 {
                return None;
            }
            return self.map.find_and_set(0..self.reserved, 0);
        }

        let depth = self.depth();
        let hint = self.cursor.load(Ordering::Relaxed);
        let tag = self.map.find_and_set(self.reserved..depth, hint)?;
        let next = if tag + 1 >= depth { self.reserved } else { tag + 1 };
        self.cursor.store(next, Ordering::Relaxed);
        Some(tag)
    }

    /// Allocate a tag, blocking the calling thread until one is available.
    ///
    /// `hint` selects the wait shard to register on when the pool is
    /// exhausted; callers typically pass their CPU or queue index.  Reserved
    /// allocation from a pool without a reserved partition would never
    /// succeed, and so fails immediately instead.
    pub fn acquire_blocking(
        &self,
        reserved: bool,
        hint: usize,
    ) -> Result<Tag, TagError> {
        if let Some(tag) = self.try_acquire(reserved) {
            return Ok(tag);
        }
        if reserved && self.reserved == 0 {
            return Err(TagError::Exhausted);
        }
        let shard = self.shard(reserved, hint);
        let mut guard = shard.waiters.lock().unwrap();
        loop {
            guard.sync += 1;
            self.nwaiters.fetch_add(1, Ordering::SeqCst);

            // Re-check now that any release will see us registered
            let got = self.try_acquire(reserved);
            if got.is_none() {
                guard = shard.cv.wait(guard).unwrap();
                guard.sync_woken = guard.sync_woken.saturating_sub(1);
            }

            guard.sync -= 1;
            self.nwaiters.fetch_sub(1, Ordering::SeqCst);
            if let Some(tag) = got.or_else(|| self.try_acquire(reserved)) {
                return Ok(tag);
            }
        }
    }

    /// Allocate a tag, suspending the calling task until one is available.
    pub async fn acquire(
        &self,
        reserved: bool,
        hint: usize,
    ) -> Result<Tag, TagError> {
        if reserved && self.reserved == 0 {
            return Err(TagError::Exhausted);
        }
        loop {
            if let Some(tag) = self.try_acquire(reserved) {
                return Ok(tag);
            }
            let shard = self.shard(reserved, hint);
            let notified = shard.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut registration = AsyncWaiter::register(self, shard);
            if let Some(tag) = self.try_acquire(reserved) {
                return Ok(tag);
            }
            notified.await;
            registration.woken = true;
        }
    }

    /// Release `tag` back to the pool, waking a waiter if any are registered.
    ///
    /// # Panics
    ///
    /// If `tag` is not currently allocated.
    pub fn release(&self, tag: Tag) {
        *self.slots[tag].lock().unwrap() = None;
        let was_set = self.map.clear(tag);
        assert!(was_set, "released tag {tag} which was not held");

        if self.nwaiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        if tag < self.reserved {
            self.wake_shard(&self.reserved_shard);
        } else {
            self.wake_one(tag / WORD_BITS);
        }
    }

    fn shard(&self, reserved: bool, hint: usize) -> &WaitShard {
        if reserved {
            &self.reserved_shard
        } else {
            &self.shards[hint % self.shards.len()]
        }
    }

    /// Wake a single regular waiter, preferring shard `first` and then
    /// walking the remaining shards in order.
    fn wake_one(&self, first: usize) {
        let nshards = self.shards.len();
        for n in 0..nshards {
            if self.wake_shard(&self.shards[(first + n) % nshards]) {
                return;
            }
        }
    }

    fn wake_shard(&self, shard: &WaitShard) -> bool {
        let mut guard = shard.waiters.lock().unwrap();
        if let Some(hook) = guard.hooks.pop_front() {
            self.nwaiters.fetch_sub(1, Ordering::SeqCst);
            drop(guard);
            hook.tag_available();
            return true;
        }
        if guard.sync > guard.sync_woken {
            guard.sync_woken += 1;
            shard.cv.notify_one();
            return true;
        }
        if guard.r#async > guard.async_woken {
            guard.async_woken += 1;
            shard.notify.notify_one();
            return true;
        }
        false
    }

    /// Wake every registered waiter
    pub fn wake_all(&self) {
        for shard in self.shards.iter().chain([&self.reserved_shard]) {
            let mut guard = shard.waiters.lock().unwrap();
            let hooks: Vec<_> = guard.hooks.drain(..).collect();
            self.nwaiters.fetch_sub(hooks.len(), Ordering::SeqCst);
            guard.sync_woken = guard.sync;
            shard.cv.notify_all();
            shard.notify.notify_waiters();
            drop(guard);
            for hook in hooks {
                hook.tag_available();
            }
        }
    }

    /// Register `hook` to be called (once) upon a future tag release.
    pub fn add_wait_hook(
        &self,
        reserved: bool,
        hint: usize,
        hook: Arc<dyn TagWaitHook>,
    ) {
        let mut guard = self.shard(reserved, hint).waiters.lock().unwrap();
        guard.hooks.push_back(hook);
        self.nwaiters.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove a previously registered hook, if it has not already fired.
    /// Returns true if the hook was found and removed.
    pub fn remove_wait_hook(
        &self,
        reserved: bool,
        hint: usize,
        hook: &Arc<dyn TagWaitHook>,
    ) -> bool {
        let mut guard = self.shard(reserved, hint).waiters.lock().unwrap();
        let pos = guard.hooks.iter().position(|h| Arc::ptr_eq(h, hook));
        match pos {
            Some(pos) => {
                guard.hooks.remove(pos);
                self.nwaiters.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// True if any non-reserved tag is held.
    ///
    /// A point-in-time view for inspection only: allocation and the shared
    /// tag accounting never consult it.
    pub fn is_busy(&self) -> bool {
        self.map.any_in(self.reserved..self.capacity())
    }

    /// Count of held tags (reserved and regular)
    pub fn busy_count(&self) -> usize {
        self.map.count_in(0..self.capacity())
    }

    pub fn is_held(&self, tag: Tag) -> bool {
        tag < self.capacity() && self.map.test(tag)
    }

    /// Check, without changing anything, that the pool could be resized to
    /// `depth` as it stands.
    pub fn check_resize(&self, depth: usize) -> Result<(), TagError> {
        let capacity = self.capacity();
        if depth == 0 || depth <= self.reserved || depth > capacity {
            return Err(TagError::InvalidDepth {
                depth,
                reserved: self.reserved,
                capacity,
            });
        }
        match self.busy_count() {
            0 => Ok(()),
            busy => Err(TagError::ResizeBusy(busy)),
        }
    }

    /// Change the pool depth.
    ///
    /// Only legal while no tags are outstanding, which the owning request
    /// queue guarantees by freezing itself first.
    pub fn resize(&self, depth: usize) -> Result<(), TagError> {
        self.check_resize(depth)?;
        self.set_depth(depth);
        Ok(())
    }

    /// Put back a depth the pool had before an aborted resize
    pub(crate) fn restore_depth(&self, depth: usize) {
        self.set_depth(depth.clamp(self.reserved + 1, self.capacity()));
    }

    fn set_depth(&self, depth: usize) {
        self.depth.store(depth, Ordering::Release);
        self.cursor.store(self.reserved, Ordering::Relaxed);
    }

    /// Associate the request holding `tag` with that slot
    pub(crate) fn set_rq(&self, tag: Tag, rq: &Arc<Request>) {
        *self.slots[tag].lock().unwrap() = Some(rq.clone());
    }

    /// Look up the request occupying `tag`
    pub fn tag_to_rq(&self, tag: Tag) -> Option<Arc<Request>> {
        if tag >= self.capacity() {
            return None;
        }
        self.slots[tag].lock().unwrap().clone()
    }

    /// Call `f` with every held tag and the request occupying it.
    ///
    /// A tag may be released concurrently with the walk, in which case it may
    /// or may not be visited.
    pub fn busy_iter(&self, mut f: impl FnMut(Tag, &Arc<Request>)) {
        for tag in self.map.iter_set() {
            let rq = self.slots[tag].lock().unwrap().clone();
            if let Some(rq) = rq {
                f(tag, &rq);
            }
        }
    }

    pub(crate) fn active_queues(&self) -> usize {
        self.active_queues.load(Ordering::Acquire)
    }
    pub(crate) fn queue_active(&self) {
        self.active_queues.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn queue_idle(&self) {
        self.active_queues.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of tags a single active queue may hold while the pool is shared
    pub fn fair_share(&self) -> usize {
        let users = self.active_queues();
        let depth = self.depth();
        if users == 0 {
            return depth;
        }
        ((depth + users - 1) / users).max(4)
    }
}

/// Registration of an async waiter, removed again when dropped so that a
/// cancelled acquisition does not leave a stale count behind.
struct AsyncWaiter<'a> {
    pool: &'a TagPool,
    shard: &'a WaitShard,
    woken: bool,
}
impl<'a> AsyncWaiter<'a> {
    fn register(pool: &'a TagPool, shard: &'a WaitShard) -> Self {
        shard.waiters.lock().unwrap().r#async += 1;
        pool.nwaiters.fetch_add(1, Ordering::SeqCst);
        Self { pool, shard, woken: false }
    }
}
impl Drop for AsyncWaiter<'_> {
    fn drop(&mut self) {
        let mut guard = self.shard.waiters.lock().unwrap();
        guard.r#async -= 1;
        if self.woken {
            guard.async_woken = guard.async_woken.saturating_sub(1);
        }
        self.pool.nwaiters.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Driver tag pools for a device, one per hardware queue index, which may be
/// shared by several request queues.
pub struct TagSet {
    pools: Vec<Arc<TagPool>>,
    queue_depth: usize,
    reserved: usize,
    /// Request queues drawing from this set, by queue id
    pub(crate) users: Mutex<Vec<(u64, Weak<RequestQueue>)>>,
}
impl TagSet {
    pub fn new(
        nr_hw_queues: usize,
        queue_depth: usize,
        reserved: usize,
    ) -> Result<Arc<Self>, TagError> {
        let pools = (0..nr_hw_queues)
            .map(|_| {
                TagPool::new(queue_depth, reserved, queue_depth).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(Self {
            pools,
            queue_depth,
            reserved,
            users: Mutex::new(Vec::new()),
        }))
    }

    pub fn nr_hw_queues(&self) -> usize {
        self.pools.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn pool(&self, hctx: HctxId) -> &Arc<TagPool> {
        &self.pools[hctx]
    }

    /// Is the set in use by more than one request queue?
    pub fn is_shared(&self) -> bool {
        self.users.lock().unwrap().len() > 1
    }
}
