// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-queue block request dispatch.
//!
//! Requests submitted from any CPU are given a tag (an in-flight slot), staged
//! on that CPU's [SoftwareQueue], and drained in batches by the
//! [HardwareQueue] the CPU is mapped to, which submits them to a [Driver].
//! Busy devices push requests back onto the hardware queue's dispatch list to
//! be retried later, completions release tags for the next waiter, and a
//! timeout scan watches over everything which has been started.
//!
//! Structural changes (tag resizing, CPU remapping) happen under a freeze,
//! which drains every live request first, while a quiesce merely pauses
//! dispatch.

#![allow(clippy::new_without_default)]

use std::time::Duration;

pub extern crate usdt;

mod bitmap;
mod completion;
mod dispatch;
mod freeze;
mod lifecycle;
mod timeout;

pub mod ctx;
pub mod driver;
pub mod hctx;
pub mod map;
pub mod queue;
pub mod registry;
pub mod request;
pub mod sched;
pub mod tag;

#[cfg(test)]
mod test;

pub use ctx::SoftwareQueue;
pub use driver::{Driver, SubmitResult, TimeoutAction};
pub use hctx::{HardwareQueue, HctxStats};
pub use map::{MapStrategy, RoundRobin, Topology};
pub use queue::{
    AllocError, ConfigError, QueueOpts, QueueParts, RequestQueue,
};
pub use registry::Registry;
pub use request::{AllocFlags, ReqId, Request, RequestState};
pub use sched::{FifoScheduler, Scheduler};
pub use tag::{Tag, TagError, TagPool, TagSet};

pub type ByteOffset = usize;
pub type ByteLen = usize;
pub type CpuId = usize;
pub type HctxId = usize;

/// Upper bound on hardware queues per request queue
pub const MAX_HW_QUEUES: usize = 64;

/// Buckets in the per-hardware-queue dispatch batch histogram
pub const MAX_DISPATCH_ORDER: usize = 7;

/// Delay before re-running a hardware queue whose device reported busy
pub const RESOURCE_DELAY: Duration = Duration::from_millis(3);

#[usdt::provider(provider = "blkmq")]
mod probes {
    fn rq_alloc(queue_id: u64, req_id: u64, hctx: u64, tag: u64) {}
    fn rq_issue(queue_id: u64, req_id: u64, hctx: u64, tag: u64) {}
    fn rq_complete(
        queue_id: u64,
        req_id: u64,
        status: u8,
        proc_ns: u64,
        queue_ns: u64,
    ) {
    }
    fn rq_requeue(queue_id: u64, req_id: u64, at_head: u8) {}
    fn rq_timeout(queue_id: u64, req_id: u64, action: String) {}

    fn hctx_run(queue_id: u64, hctx: u64) {}
    fn hctx_busy(queue_id: u64, hctx: u64, ewma: u32, delayed: u8) {}
    fn hctx_tag_wait(queue_id: u64, hctx: u64) {}

    fn queue_freeze(queue_id: u64, depth: u64) {}
    fn queue_unfreeze(queue_id: u64, depth: u64) {}
}

/// Type of operations which may be carried by a [Request].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Read from `offset` for `len`
    Read(ByteOffset, ByteLen),
    /// Write to `offset` for len
    Write(ByteOffset, ByteLen),
    /// Flush buffer(s)
    Flush,
    /// Discard/UNMAP/deallocate region
    Discard(ByteOffset, ByteLen),
}
impl Operation {
    pub const fn is_read(&self) -> bool {
        matches!(self, Operation::Read(..))
    }
    pub const fn is_write(&self) -> bool {
        matches!(self, Operation::Write(..))
    }
    pub const fn is_flush(&self) -> bool {
        matches!(self, Operation::Flush)
    }
    pub const fn is_discard(&self) -> bool {
        matches!(self, Operation::Discard(..))
    }
}

/// Terminal outcome of a [Request], delivered to its completion callback
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[repr(u8)]
pub enum Status {
    /// Request succeeded
    Success = 0,
    /// Device reported a hard failure
    IoError,
    /// Request timed out and the driver did not recover it
    Timeout,
}
impl Status {
    pub const fn is_err(&self) -> bool {
        !matches!(self, Status::Success)
    }

    pub(crate) fn from_repr(v: u8) -> Option<Self> {
        match v {
            0 => Some(Status::Success),
            1 => Some(Status::IoError),
            2 => Some(Status::Timeout),
            _ => None,
        }
    }
}

/// Consumer of per-[Request] metrics
pub trait MetricConsumer: Send + Sync + 'static {
    /// Called upon the completion of each [Request] when a MetricConsumer has
    /// been set for a given [RequestQueue].
    fn request_completed(
        &self,
        hctx: HctxId,
        op: Operation,
        status: Status,
        time_queued: Duration,
        time_processed: Duration,
    );
}
