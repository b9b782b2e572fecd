// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use slog::{o, Drain};

use blkmq::usdt::register_probes;
use blkmq::{
    AllocFlags, CpuId, FifoScheduler, HctxId, MetricConsumer, Operation,
    QueueParts, RequestQueue, Scheduler, Status,
};

mod sim;

const SECTOR_SIZE: usize = 512;
const DEVICE_SECTORS: usize = 1 << 21;
const MAX_IO_SECTORS: usize = 256;

/// Final status of every request, as seen by its completion callback
#[derive(Default)]
struct Tally {
    success: AtomicU64,
    io_error: AtomicU64,
    timeout: AtomicU64,
}
impl Tally {
    fn record(&self, status: Status) {
        let counter = match status {
            Status::Success => &self.success,
            Status::IoError => &self.io_error,
            Status::Timeout => &self.timeout,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct LatencyTotals {
    count: u64,
    queued: Duration,
    processed: Duration,
    max_processed: Duration,
}

#[derive(Default)]
struct Latency(Mutex<LatencyTotals>);
impl MetricConsumer for Latency {
    fn request_completed(
        &self,
        _hctx: HctxId,
        _op: Operation,
        _status: Status,
        time_queued: Duration,
        time_processed: Duration,
    ) {
        let mut totals = self.0.lock().unwrap();
        totals.count += 1;
        totals.queued += time_queued;
        totals.processed += time_processed;
        totals.max_processed = totals.max_processed.max(time_processed);
    }
}

fn random_op(rng: &mut impl Rng) -> Operation {
    let offset = rng.gen_range(0..DEVICE_SECTORS) * SECTOR_SIZE;
    let len = rng.gen_range(1..=MAX_IO_SECTORS) * SECTOR_SIZE;
    match rng.gen_range(0..16) {
        0 => Operation::Flush,
        1 => Operation::Discard(offset, len),
        2..=8 => Operation::Read(offset, len),
        _ => Operation::Write(offset, len),
    }
}

/// Submit requests from `cpu` until told to stop, returning how many were
/// submitted.
fn load(
    queue: Arc<RequestQueue>,
    cpu: CpuId,
    stop: Arc<AtomicBool>,
    tally: Arc<Tally>,
    log: slog::Logger,
) -> u64 {
    let mut rng = rand::thread_rng();
    let mut submitted = 0;
    while !stop.load(Ordering::Relaxed) {
        let tally = tally.clone();
        let res = queue.submit(
            random_op(&mut rng),
            cpu,
            AllocFlags::empty(),
            move |_, status| tally.record(status),
        );
        match res {
            Ok(_) => submitted += 1,
            Err(e) => {
                slog::error!(log, "submission failed"; "error" => %e);
                break;
            }
        }
    }
    submitted
}

/// Mean of `count` samples adding up to `total`, in microseconds
fn average_us(total: Duration, count: u64) -> u64 {
    match count {
        0 => 0,
        n => (total.as_nanos() / u128::from(n) / 1000) as u64,
    }
}

fn build_scheduler(
    name: Option<&str>,
    nr_hw_queues: usize,
) -> anyhow::Result<Option<Arc<dyn Scheduler>>> {
    match name {
        None | Some("none") => Ok(None),
        Some("fifo") => {
            let sched: Arc<dyn Scheduler> =
                Arc::new(FifoScheduler::new(nr_hw_queues));
            Ok(Some(sched))
        }
        Some(other) => anyhow::bail!("Unknown scheduler \"{other}\""),
    }
}

fn build_log() -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (slog::Logger::root(drain.fuse(), o!()), guard)
}

fn report(log: &slog::Logger, queue: &RequestQueue) {
    for idx in 0..queue.nr_hw_queues() {
        let Some(stats) = queue.hctx_stats(idx) else {
            continue;
        };
        slog::info!(log, "hardware queue";
            "hctx" => idx,
            "queued" => stats.queued,
            "runs" => stats.runs,
            "reruns" => stats.runs_immediate,
            "delayed" => stats.runs_delayed,
            "batches" => ?stats.dispatched,
        );
    }
    for cpu in 0..queue.nr_cpus() {
        let Some(stats) = queue.ctx_stats(cpu) else {
            continue;
        };
        slog::info!(log, "software queue";
            "cpu" => cpu,
            "queued" => stats.queued,
            "dispatched" => stats.dispatched,
            "completed" => stats.completed,
        );
    }
}

#[derive(clap::Parser)]
/// Drive a simulated block device through a multi-queue request queue.
struct Args {
    /// Queue and device configuration file
    #[clap(value_name = "CONFIG", action)]
    config: String,

    /// Seconds to keep submitting for
    #[clap(short, long, default_value_t = 5, action)]
    seconds: u64,

    /// Submission threads, spread over the CPUs (one per CPU by default)
    #[clap(short, long, action)]
    threads: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let Args { config, seconds, threads } = Args::parse();

    // Ensure proper setup of USDT probes
    register_probes().context("Failed to setup USDT probes")?;

    let (log, _log_async_guard) = build_log();

    let cfg = blkmq_config_toml::parse(&config)
        .with_context(|| format!("Cannot load config {config}"))?;
    let opts = cfg.queue.opts();
    let scheduler =
        build_scheduler(cfg.queue.scheduler.as_deref(), opts.nr_hw_queues)?;
    let device = sim::SimDevice::new(cfg.driver);
    let queue = RequestQueue::with_parts(
        opts,
        device.clone(),
        QueueParts { scheduler, ..Default::default() },
        log.new(o!("component" => "blkmq")),
    )
    .context("Failed to create request queue")?;

    let latency = Arc::new(Latency::default());
    queue.set_metric_consumer(latency.clone());

    let completer = {
        let device = device.clone();
        let queue = queue.clone();
        thread::Builder::new()
            .name("sim-completion".to_string())
            .spawn(move || device.run_completions(&queue))
            .context("Failed to spawn completion thread")?
    };

    // Ctrl-C cuts the run short, still draining and reporting
    let stop = Arc::new(AtomicBool::new(false));
    let signal_stop = stop.clone();
    ctrlc::set_handler(move || signal_stop.store(true, Ordering::Relaxed))
        .context("Failed to register Ctrl-C signal handler.")?;

    let nr_threads = threads.unwrap_or(queue.nr_cpus());
    slog::info!(log, "Starting load";
        "threads" => nr_threads,
        "seconds" => seconds,
        "hw_queues" => queue.nr_hw_queues(),
        "depth" => queue.opts().queue_depth,
    );

    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let workers = (0..nr_threads)
        .map(|i| {
            let cpu = i % queue.nr_cpus();
            let queue = queue.clone();
            let stop = stop.clone();
            let tally = tally.clone();
            let log = log.new(o!("cpu" => cpu));
            thread::Builder::new()
                .name(format!("load-{i}"))
                .spawn(move || load(queue, cpu, stop, tally, log))
        })
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to spawn load thread")?;

    let deadline = started + Duration::from_secs(seconds);
    while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    stop.store(true, Ordering::Relaxed);

    let mut submitted = 0;
    for worker in workers {
        submitted += worker
            .join()
            .map_err(|_| anyhow::anyhow!("Load thread panicked"))?;
    }

    // Wait out everything still with the device
    slog::info!(log, "Draining"; "outstanding" => device.outstanding());
    queue.freeze();
    let elapsed = started.elapsed();
    report(&log, &queue);

    let dev = device.stats();
    let ok = tally.success.load(Ordering::Relaxed);
    let totals = latency.0.lock().unwrap();
    let avg = |total: Duration| average_us(total, totals.count);
    slog::info!(log, "Load complete";
        "elapsed_ms" => elapsed.as_millis() as u64,
        "submitted" => submitted,
        "ok" => ok,
        "io_error" => tally.io_error.load(Ordering::Relaxed),
        "timeout" => tally.timeout.load(Ordering::Relaxed),
        "iops" => (ok as f64 / elapsed.as_secs_f64()) as u64,
        "device_busy" => dev.busy,
        "device_timeouts" => dev.timeouts,
        "avg_queued_us" => avg(totals.queued),
        "avg_processed_us" => avg(totals.processed),
        "max_processed_us" => totals.max_processed.as_micros() as u64,
    );
    drop(totals);
    queue.unfreeze();

    device.shutdown();
    completer
        .join()
        .map_err(|_| anyhow::anyhow!("Completion thread panicked"))?;
    Ok(())
}
