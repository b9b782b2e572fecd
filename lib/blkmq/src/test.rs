// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request queue scenarios against mock drivers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use slog::Logger;

use crate::driver::{Driver, SubmitResult, TimeoutAction};
use crate::map::Topology;
use crate::queue::{AllocError, QueueOpts, QueueParts, RequestQueue};
use crate::registry::Registry;
use crate::request::{AllocFlags, ReqId, Request, RequestState};
use crate::sched::FifoScheduler;
use crate::tag::{TagError, TagSet};
use crate::{Operation, Status};

const OP: Operation = Operation::Read(0, 4096);
const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

pub(crate) fn opts(
    nr_hw_queues: usize,
    queue_depth: usize,
    nr_cpus: usize,
) -> QueueOpts {
    QueueOpts { nr_hw_queues, queue_depth, nr_cpus, ..Default::default() }
}

/// Driver accepting every request and never completing any
struct NullDriver;
impl Driver for NullDriver {
    fn submit(&self, _: usize, _: &Arc<Request>, _: bool) -> SubmitResult {
        SubmitResult::Accepted
    }
}

/// Queue over [NullDriver] with one CPU per hardware queue
pub(crate) fn null_queue(
    nr_hw_queues: usize,
    queue_depth: usize,
) -> Arc<RequestQueue> {
    RequestQueue::new(
        opts(nr_hw_queues, queue_depth, nr_hw_queues),
        Arc::new(NullDriver),
        logger(),
    )
    .unwrap()
}

type SubmitPolicy = Box<dyn Fn(usize) -> SubmitResult + Send + Sync>;
type TimeoutPolicy = Box<dyn Fn(&Arc<Request>) -> TimeoutAction + Send + Sync>;

/// Driver with scripted submission and timeout outcomes, reporting accepted
/// requests on a channel
struct MockDriver {
    submits: AtomicUsize,
    timeouts: AtomicUsize,
    on_submit: SubmitPolicy,
    on_timeout: TimeoutPolicy,
    accepted: Sender<Arc<Request>>,
}
impl MockDriver {
    fn new(
        on_submit: impl Fn(usize) -> SubmitResult + Send + Sync + 'static,
        on_timeout: impl Fn(&Arc<Request>) -> TimeoutAction
            + Send
            + Sync
            + 'static,
    ) -> (Arc<Self>, Receiver<Arc<Request>>) {
        let (accepted, rx) = unbounded();
        let driver = Arc::new(Self {
            submits: AtomicUsize::new(0),
            timeouts: AtomicUsize::new(0),
            on_submit: Box::new(on_submit),
            on_timeout: Box::new(on_timeout),
            accepted,
        });
        (driver, rx)
    }

    fn accepting() -> (Arc<Self>, Receiver<Arc<Request>>) {
        Self::new(|_| SubmitResult::Accepted, |_| TimeoutAction::ResetTimer)
    }
}
impl Driver for MockDriver {
    fn submit(&self, _: usize, rq: &Arc<Request>, _: bool) -> SubmitResult {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        let res = (self.on_submit)(n);
        if res == SubmitResult::Accepted {
            let _ = self.accepted.send(rq.clone());
        }
        res
    }

    fn timeout(&self, rq: &Arc<Request>) -> TimeoutAction {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        (self.on_timeout)(rq)
    }
}

fn build(opts: QueueOpts, driver: &Arc<MockDriver>) -> Arc<RequestQueue> {
    let driver: Arc<dyn Driver> = driver.clone();
    RequestQueue::new(opts, driver, logger()).unwrap()
}

fn build_with(
    opts: QueueOpts,
    driver: &Arc<MockDriver>,
    parts: QueueParts,
) -> Arc<RequestQueue> {
    let driver: Arc<dyn Driver> = driver.clone();
    RequestQueue::with_parts(opts, driver, parts, logger()).unwrap()
}

fn recv(rx: &Receiver<Arc<Request>>) -> Arc<Request> {
    rx.recv_timeout(WAIT).expect("request should reach the driver")
}

type Done = (ReqId, Status);

/// Completion callback reporting on a channel
fn on_done(tx: &Sender<Done>) -> impl FnOnce(&Arc<Request>, Status) + Send {
    let tx = tx.clone();
    move |rq, status| {
        let _ = tx.send((rq.id(), status));
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < WAIT, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn invalid_opts() {
    let mut bad = opts(1, 4, 1);
    bad.reserved_tags = 4;
    assert!(bad.validate().is_err());
    assert!(opts(0, 4, 1).validate().is_err());
    assert!(opts(65, 4, 1).validate().is_err());
    assert!(opts(1, 0, 1).validate().is_err());
    assert!(opts(1, 4, 0).validate().is_err());
    assert!(opts(64, 4, 1).validate().is_ok());
}

#[test]
fn blocking_allocation_gets_freed_tag() {
    let queue = null_queue(1, 4);
    let held: Vec<_> = (0..4)
        .map(|_| queue.allocate(OP, 0, AllocFlags::empty()).unwrap())
        .collect();
    assert_eq!(
        queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::ResourceExhausted
    );

    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || queue.allocate(OP, 0, AllocFlags::empty()))
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    let freed = held[2].tag();
    queue.free_request(&held[2]);
    let rq = waiter.join().unwrap().unwrap();
    assert_eq!(rq.tag(), freed);

    queue.free_request(&rq);
    for (n, rq) in held.iter().enumerate() {
        if n != 2 {
            queue.free_request(rq);
        }
    }
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn allocation_errors() {
    let queue = null_queue(2, 4);
    assert_eq!(
        queue.allocate(OP, 2, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::InvalidCpu(2)
    );
    assert_eq!(
        queue.allocate_on_hctx(OP, 5, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::InvalidHctx(5)
    );
    let rq = queue.allocate_on_hctx(OP, 1, AllocFlags::NOWAIT).unwrap();
    assert_eq!(rq.hctx(), 1);
    assert_eq!(rq.cpu(), 1);
    queue.free_request(&rq);
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn reserved_tags() {
    let mut opts = opts(1, 4, 1);
    opts.reserved_tags = 1;
    let queue =
        RequestQueue::new(opts, Arc::new(NullDriver), logger()).unwrap();

    let flags = AllocFlags::RESERVED | AllocFlags::NOWAIT;
    let reserved = queue.allocate(OP, 0, flags).unwrap();
    assert_eq!(reserved.tag(), Some(0));
    assert!(reserved.is_reserved());
    assert_eq!(
        queue.allocate(OP, 0, flags).unwrap_err(),
        AllocError::ResourceExhausted
    );

    let regular: Vec<_> = (0..3)
        .map(|_| queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap())
        .collect();
    for rq in regular.iter() {
        assert!(rq.tag().unwrap() >= 1);
    }
    assert_eq!(
        queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::ResourceExhausted
    );

    queue.free_request(&reserved);
    for rq in regular.iter() {
        queue.free_request(rq);
    }
}

#[test]
#[should_panic]
fn double_free() {
    let queue = null_queue(1, 4);
    let rq = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    queue.free_request(&rq);
    queue.free_request(&rq);
}

#[test]
fn flush_busy_drains_all_ctxs() {
    let queue = RequestQueue::new(opts(1, 8, 3), Arc::new(NullDriver), logger())
        .unwrap();
    queue.stop_hw_queue(0);

    let mut staged = Vec::new();
    for cpu in 0..3 {
        for _ in 0..2 {
            let rq = queue.allocate(OP, cpu, AllocFlags::NOWAIT).unwrap();
            staged.push(rq.id());
            queue.insert(rq, false, true);
        }
    }
    let hctx = queue.hctx(0).unwrap();
    assert!(hctx.has_pending_ctx());
    assert_eq!(hctx.stats().queued, 6);

    let batch = hctx.flush_busy();
    assert_eq!(batch.len(), 6);
    assert!(!hctx.has_pending_ctx());
    assert!(hctx.flush_busy().is_empty());
    for cpu in 0..3 {
        assert!(queue.ctx(cpu).unwrap().is_empty());
        assert_eq!(queue.ctx_stats(cpu).unwrap().dispatched, 2);
    }
    // Each software queue keeps its FIFO order within the batch
    let ids: Vec<_> = batch.iter().map(|rq| rq.id()).collect();
    assert_eq!(ids, staged);

    for rq in batch {
        queue.end_request(&rq, Status::Success);
    }
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn dequeue_one_round_robin() {
    let queue = RequestQueue::new(opts(1, 8, 2), Arc::new(NullDriver), logger())
        .unwrap();
    queue.stop_hw_queue(0);
    for cpu in [0, 0, 1, 1] {
        let rq = queue.allocate(OP, cpu, AllocFlags::NOWAIT).unwrap();
        queue.insert(rq, false, false);
    }
    let hctx = queue.hctx(0).unwrap();
    let order: Vec<_> = std::iter::from_fn(|| hctx.dequeue_one()).collect();
    let cpus: Vec<_> = order.iter().map(|rq| rq.cpu()).collect();
    assert_eq!(cpus, vec![0, 1, 0, 1]);
    assert!(!hctx.has_pending_ctx());
    for rq in order {
        queue.end_request(&rq, Status::Success);
    }
}

#[test]
fn busy_leaves_remainder_in_order() {
    let (driver, accepted) = MockDriver::new(
        |n| if n == 1 { SubmitResult::Busy } else { SubmitResult::Accepted },
        |_| TimeoutAction::ResetTimer,
    );
    let queue = build(opts(1, 8, 1), &driver);
    queue.stop_hw_queue(0);

    let rqs: Vec<_> = (0..3)
        .map(|_| queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap())
        .collect();
    for rq in rqs.iter() {
        queue.insert(rq.clone(), false, false);
    }
    let hctx = queue.hctx(0).unwrap();
    let mut batch = hctx.flush_busy();
    assert!(queue.dispatch_rq_list(hctx, &mut batch, false));
    assert!(batch.is_empty());

    assert_eq!(recv(&accepted).id(), rqs[0].id());
    let parked: Vec<_> =
        hctx.lock_dispatch().iter().map(|rq| rq.id()).collect();
    assert_eq!(parked, vec![rqs[1].id(), rqs[2].id()]);
    assert_eq!(rqs[1].state(), RequestState::Queued);
    assert!(!rqs[1].is_started());
    assert!(rqs[0].is_started());
    assert!(hctx.dispatch_busy() > 0);

    // Restarting retries the parked requests, in order
    queue.start_hw_queue(0);
    assert_eq!(recv(&accepted).id(), rqs[1].id());
    assert_eq!(recv(&accepted).id(), rqs[2].id());
    assert_eq!(hctx.stats().dispatch_list, 0);

    for rq in rqs.iter() {
        rq.complete(Status::Success);
    }
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn device_error_ends_request() {
    let (driver, _accepted) = MockDriver::new(
        |_| SubmitResult::Error,
        |_| TimeoutAction::ResetTimer,
    );
    let queue = build(opts(1, 4, 1), &driver);
    let (tx, done) = unbounded();
    let rq = queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    assert_eq!(done.recv_timeout(WAIT).unwrap(), (rq.id(), Status::IoError));
    assert_eq!(rq.state(), RequestState::Free);
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn busy_backoff_converges() {
    let (driver, _accepted) =
        MockDriver::new(|_| SubmitResult::Busy, |_| TimeoutAction::ResetTimer);
    let queue = build(opts(1, 4, 1), &driver);
    let rq = queue.allocate(OP, 0, AllocFlags::empty()).unwrap();
    queue.enqueue(rq);

    thread::sleep(Duration::from_millis(200));
    queue.quiesce();
    let stats = queue.hctx_stats(0).unwrap();
    assert!(stats.runs_delayed >= 5, "{stats:?}");
    assert!(stats.runs_immediate <= 2, "{stats:?}");
    // Bounded by the backoff delay rather than spinning
    assert!(stats.runs < 200, "{stats:?}");
    assert!(stats.dispatch_busy > 0);
    assert_eq!(stats.dispatch_list, 1);

    let parked: Vec<_> =
        queue.hctx(0).unwrap().lock_dispatch().drain(..).collect();
    for rq in parked {
        queue.end_request(&rq, Status::IoError);
    }
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn freeze_drains_and_blocks() {
    let (driver, accepted) = MockDriver::accepting();
    let queue = build(opts(1, 4, 1), &driver);
    let (tx, done) = unbounded();
    queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    let rq = recv(&accepted);

    let freezer = {
        let queue = queue.clone();
        thread::spawn(move || queue.freeze())
    };
    wait_until("freeze to start", || queue.is_frozen());
    assert_eq!(
        queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::QueueFrozen
    );
    let blocked = {
        let queue = queue.clone();
        thread::spawn(move || queue.allocate(OP, 0, AllocFlags::empty()))
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!freezer.is_finished());
    assert!(!blocked.is_finished());

    rq.complete(Status::Success);
    freezer.join().unwrap();
    assert_eq!(done.recv_timeout(WAIT).unwrap().1, Status::Success);
    assert_eq!(queue.live_requests(), 0);
    thread::sleep(Duration::from_millis(10));
    assert!(!blocked.is_finished());

    queue.unfreeze();
    let rq = blocked.join().unwrap().unwrap();
    queue.free_request(&rq);
}

#[test]
fn nested_freeze() {
    let queue = null_queue(1, 4);
    queue.freeze();
    queue.freeze();
    queue.unfreeze();
    assert!(queue.is_frozen());
    assert!(queue.allocate(OP, 0, AllocFlags::NOWAIT).is_err());
    queue.unfreeze();
    assert!(!queue.is_frozen());
    let rq = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    queue.free_request(&rq);
}

#[test]
fn quiesce_holds_dispatch() {
    let (driver, accepted) = MockDriver::accepting();
    let queue = build(opts(1, 4, 1), &driver);
    queue.quiesce();
    let rq = queue.allocate(OP, 0, AllocFlags::empty()).unwrap();
    queue.enqueue(rq.clone());
    assert!(accepted.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(rq.state(), RequestState::Queued);

    queue.unquiesce();
    assert_eq!(recv(&accepted).id(), rq.id());
    rq.complete(Status::Success);
}

#[test]
fn completion_is_idempotent() {
    let (driver, accepted) = MockDriver::accepting();
    let queue = build(opts(1, 4, 1), &driver);
    let (tx, done) = unbounded();
    queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    let rq = recv(&accepted);
    assert_eq!(queue.in_flight(), 1);

    rq.complete(Status::Success);
    rq.complete(Status::IoError);
    queue.complete_on(&rq, Status::IoError, 0);
    assert_eq!(done.recv_timeout(WAIT).unwrap(), (rq.id(), Status::Success));
    assert!(done.recv_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.ctx_stats(0).unwrap().completed, 1);
}

#[test]
fn timeout_reset_timer() {
    let (driver, accepted) =
        MockDriver::new(|_| SubmitResult::Accepted, |_| {
            TimeoutAction::ResetTimer
        });
    let mut opts = opts(1, 4, 1);
    opts.timeout = Duration::from_millis(20);
    let queue = build(opts, &driver);
    let (tx, done) = unbounded();
    queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    let rq = recv(&accepted);

    wait_until("repeated timeouts", || {
        driver.timeouts.load(Ordering::SeqCst) >= 2
    });
    assert!(rq.is_started());
    assert_eq!(rq.state(), RequestState::Started);

    // The late completion still lands once the timer has been reset
    let mut attempts = 0;
    let status = loop {
        rq.complete(Status::Success);
        if let Ok((_, status)) = done.recv_timeout(Duration::from_millis(10)) {
            break status;
        }
        attempts += 1;
        assert!(attempts < 100);
    };
    assert_eq!(status, Status::Success);
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn timeout_handled_uses_recorded_status() {
    let (driver, accepted) =
        MockDriver::new(|_| SubmitResult::Accepted, |rq| {
            rq.set_status(Status::IoError);
            TimeoutAction::Handled
        });
    let mut opts = opts(1, 4, 1);
    opts.timeout = Duration::from_millis(10);
    let queue = build(opts, &driver);
    let (tx, done) = unbounded();
    queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    let rq = recv(&accepted);

    assert_eq!(done.recv_timeout(WAIT).unwrap(), (rq.id(), Status::IoError));
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 1);
    // Completion racing the handler is a no-op
    rq.complete(Status::Success);
    assert!(done.recv_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn timeout_not_handled_until_reset() {
    let (driver, accepted) =
        MockDriver::new(|_| SubmitResult::Accepted, |_| {
            TimeoutAction::NotHandled
        });
    let mut opts = opts(1, 4, 1);
    opts.timeout = Duration::from_millis(10);
    let queue = build(opts, &driver);
    let (tx, done) = unbounded();
    queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    let rq = recv(&accepted);

    wait_until("timeout", || rq.state() == RequestState::TimedOut);
    rq.complete(Status::Success);
    assert!(done.recv_timeout(Duration::from_millis(30)).is_err());
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.live_requests(), 1);

    assert_eq!(queue.fail_timed_out(), 1);
    assert_eq!(done.recv_timeout(WAIT).unwrap(), (rq.id(), Status::Timeout));
    assert_eq!(queue.fail_timed_out(), 0);
    assert_eq!(queue.live_requests(), 0);
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 1);
}

#[test]
fn stale_expiry_skips_restarted_request() {
    let (driver, accepted) = MockDriver::accepting();
    let mut opts = opts(1, 4, 1);
    opts.timeout = Duration::from_secs(60);
    let queue = build(opts, &driver);
    let (tx, done) = unbounded();
    queue.submit(OP, 0, AllocFlags::empty(), on_done(&tx)).unwrap();
    let rq = recv(&accepted);
    // A scan at the first deadline finds the request expired...
    let scanned_at = rq.deadline().unwrap();

    // ...but it is requeued and issued again before being claimed
    queue.requeue(&rq, false, true);
    assert_eq!(recv(&accepted).id(), rq.id());
    let restarted = rq.deadline().unwrap();
    assert!(restarted > scanned_at);
    queue.expire(&[rq.clone()], scanned_at);
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 0);
    assert!(rq.is_started());
    assert!(!rq.is_complete());
    assert_eq!(rq.state(), RequestState::Started);

    // Past the new deadline the request does time out
    queue.expire(&[rq.clone()], restarted);
    assert_eq!(driver.timeouts.load(Ordering::SeqCst), 1);
    assert!(!rq.is_complete());

    rq.complete(Status::Success);
    assert_eq!(done.recv_timeout(WAIT).unwrap(), (rq.id(), Status::Success));
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn requeue_ordering() {
    let (driver, accepted) = MockDriver::accepting();
    let queue = build(opts(1, 8, 1), &driver);
    for _ in 0..3 {
        let rq = queue.allocate(OP, 0, AllocFlags::empty()).unwrap();
        queue.enqueue(rq);
    }
    let a = recv(&accepted);
    let b = recv(&accepted);
    let c = recv(&accepted);

    queue.requeue(&a, false, false);
    queue.requeue(&b, true, false);
    queue.requeue(&c, true, false);
    for rq in [&a, &b, &c] {
        assert_eq!(rq.state(), RequestState::Requeued);
        assert!(!rq.is_started());
    }
    assert!(accepted.recv_timeout(Duration::from_millis(20)).is_err());

    queue.kick_requeue_list();
    let order: Vec<_> = (0..3).map(|_| recv(&accepted).id()).collect();
    assert_eq!(order, vec![b.id(), c.id(), a.id()]);

    for rq in [a, b, c] {
        rq.complete(Status::Success);
    }
    assert_eq!(queue.live_requests(), 0);
}

#[test]
fn scheduler_restart_on_completion() {
    let (driver, accepted) = MockDriver::accepting();
    let parts = QueueParts {
        scheduler: Some(Arc::new(FifoScheduler::new(1))),
        ..Default::default()
    };
    let queue = build_with(opts(1, 2, 1), &driver, parts);
    assert_eq!(queue.hctx(0).unwrap().sched_tags().unwrap().depth(), 4);

    let rqs: Vec<_> = (0..4)
        .map(|_| {
            let rq = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
            assert!(rq.sched_tag().is_some());
            assert!(rq.tag().is_none());
            queue.enqueue(rq.clone());
            rq
        })
        .collect();

    // Only two driver tags to go around
    let first = recv(&accepted);
    let second = recv(&accepted);
    assert_eq!((first.id(), second.id()), (rqs[0].id(), rqs[1].id()));
    assert!(first.tag().is_some());
    assert!(accepted.recv_timeout(Duration::from_millis(30)).is_err());
    assert_eq!(queue.in_flight(), 2);

    first.complete(Status::Success);
    assert_eq!(recv(&accepted).id(), rqs[2].id());
    second.complete(Status::Success);
    assert_eq!(recv(&accepted).id(), rqs[3].id());

    rqs[2].complete(Status::Success);
    rqs[3].complete(Status::Success);
    assert_eq!(queue.live_requests(), 0);
    let pool = queue.hctx(0).unwrap().sched_tags().unwrap().clone();
    assert_eq!(pool.busy_count(), 0);
    assert_eq!(queue.tag_set().pool(0).busy_count(), 0);
}

#[test]
fn shared_tag_set() {
    let set = TagSet::new(1, 8, 0).unwrap();
    let parts =
        || QueueParts { tag_set: Some(set.clone()), ..Default::default() };
    let a = RequestQueue::with_parts(
        opts(1, 8, 1),
        Arc::new(NullDriver),
        parts(),
        logger(),
    )
    .unwrap();
    assert!(!a.hctx(0).unwrap().is_shared());

    let b = RequestQueue::with_parts(
        opts(1, 8, 1),
        Arc::new(NullDriver),
        parts(),
        logger(),
    )
    .unwrap();
    assert!(set.is_shared());
    assert!(a.hctx(0).unwrap().is_shared());
    assert!(b.hctx(0).unwrap().is_shared());

    let on_b = b.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    let mut on_a = Vec::new();
    loop {
        match a.allocate(OP, 0, AllocFlags::NOWAIT) {
            Ok(rq) => on_a.push(rq),
            Err(e) => {
                assert_eq!(e, AllocError::ResourceExhausted);
                break;
            }
        }
    }
    // Two active users of eight tags: four each
    assert_eq!(on_a.len(), 4);
    assert_eq!(a.hctx(0).unwrap().nr_active(), 4);
    assert!(on_a.iter().all(|rq| rq.tag() != on_b.tag()));
    assert_eq!(a.tag_to_rq(0, on_b.tag().unwrap()).map(|r| r.id()), None);
    assert_eq!(
        b.tag_to_rq(0, on_b.tag().unwrap()).map(|r| r.id()),
        Some(on_b.id())
    );

    for rq in on_a.iter() {
        a.free_request(rq);
    }
    assert_eq!(a.hctx(0).unwrap().nr_active(), 0);
    b.free_request(&on_b);

    drop(b);
    assert!(!set.is_shared());
    assert!(!a.hctx(0).unwrap().is_shared());
}

#[test]
fn teardown_returns_shared_tags() {
    let set = TagSet::new(1, 4, 0).unwrap();
    let parts =
        || QueueParts { tag_set: Some(set.clone()), ..Default::default() };
    let a = RequestQueue::with_parts(
        opts(1, 4, 1),
        Arc::new(NullDriver),
        parts(),
        logger(),
    )
    .unwrap();
    let b = RequestQueue::with_parts(
        opts(1, 4, 1),
        Arc::new(NullDriver),
        parts(),
        logger(),
    )
    .unwrap();

    // One request left allocated, one left with the driver
    let (tx, done) = unbounded();
    let idle = a.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    let issued = a.submit(OP, 0, AllocFlags::NOWAIT, on_done(&tx)).unwrap();
    wait_until("issue", || issued.is_started());
    assert_eq!(set.pool(0).busy_count(), 2);

    drop(a);
    assert_eq!(
        done.recv_timeout(WAIT).unwrap(),
        (issued.id(), Status::IoError)
    );
    wait_until("teardown", || !set.is_shared());
    assert_eq!(set.pool(0).busy_count(), 0);
    assert_eq!(idle.state(), RequestState::Free);
    assert_eq!(issued.state(), RequestState::Free);

    let all: Vec<_> = (0..4)
        .map(|_| b.allocate(OP, 0, AllocFlags::NOWAIT).unwrap())
        .collect();
    assert_eq!(set.pool(0).busy_count(), 4);
    for rq in all.iter() {
        b.free_request(rq);
    }
    assert_eq!(b.live_requests(), 0);
}

#[test]
fn tag_wait_in_shared_mode() {
    let set = TagSet::new(1, 4, 0).unwrap();
    let other = RequestQueue::with_parts(
        opts(1, 4, 1),
        Arc::new(NullDriver),
        QueueParts { tag_set: Some(set.clone()), ..Default::default() },
        logger(),
    )
    .unwrap();
    let (driver, accepted) = MockDriver::accepting();
    let queue = build_with(
        opts(1, 4, 1),
        &driver,
        QueueParts {
            tag_set: Some(set.clone()),
            scheduler: Some(Arc::new(FifoScheduler::new(1))),
            ..Default::default()
        },
    );

    // The other queue takes every driver tag
    let held: Vec<_> = (0..4)
        .map(|_| other.allocate(OP, 0, AllocFlags::empty()).unwrap())
        .collect();
    let rq = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    queue.enqueue(rq.clone());
    assert!(accepted.recv_timeout(Duration::from_millis(30)).is_err());
    assert_eq!(queue.hctx_stats(0).unwrap().dispatch_list, 1);

    // A tag freed by the other queue wakes this one
    other.free_request(&held[0]);
    assert_eq!(recv(&accepted).id(), rq.id());
    rq.complete(Status::Success);
    for rq in held[1..].iter() {
        other.free_request(rq);
    }
}

#[test]
fn resize_tags() {
    let queue = null_queue(1, 8);
    assert!(queue.resize_tags(16).is_err());
    queue.resize_tags(2).unwrap();
    let a = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    let b = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();
    assert_eq!(
        queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::ResourceExhausted
    );
    queue.free_request(&a);
    queue.free_request(&b);
    assert!(!queue.is_frozen());
    assert!(!queue.is_quiesced());
}

#[test]
fn resize_shared_tags_all_or_nothing() {
    let set = TagSet::new(2, 8, 0).unwrap();
    let parts =
        || QueueParts { tag_set: Some(set.clone()), ..Default::default() };
    let a = RequestQueue::with_parts(
        opts(2, 8, 2),
        Arc::new(NullDriver),
        parts(),
        logger(),
    )
    .unwrap();
    let b = RequestQueue::with_parts(
        opts(2, 8, 2),
        Arc::new(NullDriver),
        parts(),
        logger(),
    )
    .unwrap();

    // Hardware queue 0 is idle, but the other queue holds a tag on 1
    let held = b.allocate_on_hctx(OP, 1, AllocFlags::NOWAIT).unwrap();
    assert_eq!(a.resize_tags(2), Err(TagError::ResizeBusy(1)));
    assert_eq!(set.pool(0).depth(), 8);
    assert_eq!(set.pool(1).depth(), 8);
    assert!(!a.is_frozen());
    assert!(!a.is_quiesced());

    b.free_request(&held);
    a.resize_tags(2).unwrap();
    assert_eq!(set.pool(0).depth(), 2);
    assert_eq!(set.pool(1).depth(), 2);
}

#[test]
fn remap_through_registry() {
    let queue =
        RequestQueue::new(opts(2, 4, 4), Arc::new(NullDriver), logger())
            .unwrap();
    let registry = Registry::new(logger());
    registry.register(&queue);
    assert_eq!(registry.len(), 1);
    assert_eq!(queue.map_generation(), 1);
    assert_eq!(queue.hctx_for_cpu(3), Some(1));

    let mut topo = Topology::uniform(4, 1);
    for cpu in 1..4 {
        topo.set_online(cpu, false);
    }
    registry.cpu_topology_changed(&topo).unwrap();
    assert_eq!(queue.map_generation(), 2);
    assert!(!queue.is_frozen());
    assert!(queue.hctx(0).unwrap().is_mapped());
    assert!(!queue.hctx(1).unwrap().is_mapped());
    assert!(queue.hctx(1).unwrap().tags().is_none());

    // Offline CPUs are redirected onto an online one
    let rq = queue.allocate(OP, 3, AllocFlags::NOWAIT).unwrap();
    assert_eq!((rq.cpu(), rq.hctx()), (0, 0));
    assert_eq!(
        queue.allocate_on_hctx(OP, 1, AllocFlags::NOWAIT).unwrap_err(),
        AllocError::Unmapped(1)
    );
    queue.free_request(&rq);

    registry.cpu_topology_changed(&Topology::uniform(4, 1)).unwrap();
    assert_eq!(queue.map_generation(), 3);
    assert!(queue.hctx(1).unwrap().is_mapped());
    assert_eq!(queue.hctx_for_cpu(3), Some(1));

    let wrong = Topology::uniform(8, 1);
    assert!(queue.remap_cpus(wrong).is_err());
    assert!(!queue.is_frozen());

    drop(queue);
    assert!(registry.is_empty());
}

#[test]
fn remote_completion() {
    let (driver, accepted) = MockDriver::accepting();
    let mut opts = opts(1, 8, 4);
    opts.cache_domain_size = 2;
    opts.remote_completion = true;
    let queue = build(opts, &driver);

    let (tx, names) = unbounded();
    let report = move || {
        let tx = tx.clone();
        move |_: &Arc<Request>, _: Status| {
            let name = thread::current().name().map(String::from);
            let _ = tx.send(name);
        }
    };

    // Completed on a CPU sharing a cache: finalized in place
    queue.submit(OP, 0, AllocFlags::empty(), report()).unwrap();
    let rq = recv(&accepted);
    queue.complete_on(&rq, Status::Success, 1);
    let here = thread::current().name().map(String::from);
    assert_eq!(names.recv_timeout(WAIT).unwrap(), here);

    // Completed across domains: handed to the submitting CPU's domain
    queue.submit(OP, 0, AllocFlags::empty(), report()).unwrap();
    let rq = recv(&accepted);
    queue.complete_on(&rq, Status::Success, 3);
    let name = names.recv_timeout(WAIT).unwrap().unwrap();
    assert!(name.ends_with("-comp0"), "{name}");
    wait_until("remote free", || queue.live_requests() == 0);
}

#[test]
fn busy_iter_and_lookup() {
    let (driver, accepted) = MockDriver::accepting();
    let queue = build(opts(2, 4, 2), &driver);
    for cpu in 0..2 {
        let rq = queue.allocate(OP, cpu, AllocFlags::empty()).unwrap();
        queue.enqueue(rq);
    }
    let rqs = [recv(&accepted), recv(&accepted)];
    assert_eq!(queue.in_flight(), 2);

    let mut seen = Vec::new();
    queue.busy_iter(|hctx, tag, rq| seen.push((hctx, tag, rq.id())));
    assert_eq!(seen.len(), 2);
    for rq in rqs.iter() {
        let found = queue.tag_to_rq(rq.hctx(), rq.tag().unwrap()).unwrap();
        assert_eq!(found.id(), rq.id());
        rq.complete(Status::Success);
    }
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.tag_to_rq(0, 0).map(|r| r.id()), None);
}

#[tokio::test]
async fn async_allocation() {
    let queue = null_queue(1, 1);
    let held = queue.allocate(OP, 0, AllocFlags::NOWAIT).unwrap();

    let task = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue.allocate_async(OP, 0, AllocFlags::empty()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!task.is_finished());

    queue.free_request(&held);
    let rq = tokio::time::timeout(WAIT, task)
        .await
        .expect("allocation should complete")
        .unwrap()
        .unwrap();
    queue.free_request(&rq);

    queue.freeze();
    assert_eq!(
        queue.allocate_async(OP, 0, AllocFlags::empty()).await.unwrap_err(),
        AllocError::QueueFrozen
    );
    queue.unfreeze();
}

#[test]
fn concurrent_load() {
    use rand::Rng;

    let (driver, accepted) = MockDriver::new(
        |_| {
            if rand::thread_rng().gen_ratio(1, 16) {
                SubmitResult::Busy
            } else {
                SubmitResult::Accepted
            }
        },
        |_| TimeoutAction::ResetTimer,
    );
    let queue = build(opts(2, 8, 4), &driver);

    let completer = thread::spawn(move || {
        let mut rng = rand::thread_rng();
        for rq in accepted.iter() {
            if rng.gen_bool(0.2) {
                thread::yield_now();
            }
            rq.complete(Status::Success);
        }
    });

    let completed = Arc::new(AtomicUsize::new(0));
    let submitters: Vec<_> = (0..4)
        .map(|cpu| {
            let queue = queue.clone();
            let completed = completed.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let completed = completed.clone();
                    queue
                        .submit(OP, cpu, AllocFlags::empty(), move |_, st| {
                            assert_eq!(st, Status::Success);
                            completed.fetch_add(1, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    wait_until("all completions", || {
        completed.load(Ordering::SeqCst) == 2000
    });
    assert_eq!(queue.live_requests(), 0);
    let dispatched: u64 = (0..4)
        .map(|cpu| queue.ctx_stats(cpu).unwrap().completed)
        .sum();
    assert_eq!(dispatched, 2000);

    drop(queue);
    drop(driver);
    completer.join().unwrap();
}
