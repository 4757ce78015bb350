use std::ops::Range;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;
use rand::distributions::Uniform;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scorekit_core::eval::mrr_score;
use scorekit_core::{capabilities, BinaryScorer, Config, DenseScorer, ScorerError};

const MAX_LATENCY_US: u64 = 120_000_000;

/// Items per shard are rounded to this so every shard starts 32-byte aligned.
const SHARD_ALIGN_ITEMS: usize = 8;

/// Users sampled when comparing binary ranking quality against dense.
const MAX_EVAL_USERS: usize = 256;

#[derive(Parser, Debug, Clone)]
#[command(name = "scorekit-perf", about = "Latency and throughput harness for scorekit dense and binary scorers.")]
struct Args {
    #[arg(long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    #[arg(long, default_value_t = 1_000)]
    num_users: usize,

    #[arg(long, default_value_t = 100_000)]
    num_items: usize,

    #[arg(long, default_value_t = 128)]
    dimensions: usize,

    #[arg(long, default_value_t = 1)]
    threads: usize,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    duration: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
    warmup: Duration,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long)]
    output_json: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Dense,
    Binary,
    Both,
}

impl Mode {
    fn dense(self) -> bool {
        matches!(self, Mode::Dense | Mode::Both)
    }

    fn binary(self) -> bool {
        matches!(self, Mode::Binary | Mode::Both)
    }
}

/// A scorer the harness can drive one item shard at a time.
trait Workload: Sync {
    fn num_users(&self) -> usize;
    fn num_items(&self) -> usize;
    fn memory_bytes(&self) -> usize;
    fn score(&self, user_id: usize, items: Range<usize>, out: &mut [f32]) -> Result<(), ScorerError>;
}

impl Workload for DenseScorer {
    fn num_users(&self) -> usize {
        DenseScorer::num_users(self)
    }

    fn num_items(&self) -> usize {
        DenseScorer::num_items(self)
    }

    fn memory_bytes(&self) -> usize {
        DenseScorer::memory_bytes(self)
    }

    fn score(&self, user_id: usize, items: Range<usize>, out: &mut [f32]) -> Result<(), ScorerError> {
        self.predict_range(user_id, items, out)
    }
}

impl Workload for BinaryScorer {
    fn num_users(&self) -> usize {
        BinaryScorer::num_users(self)
    }

    fn num_items(&self) -> usize {
        BinaryScorer::num_items(self)
    }

    fn memory_bytes(&self) -> usize {
        BinaryScorer::memory_bytes(self)
    }

    fn score(&self, user_id: usize, items: Range<usize>, out: &mut [f32]) -> Result<(), ScorerError> {
        self.predict_range(user_id, items, out)
    }
}

struct Model {
    user_vectors: Vec<f32>,
    user_biases: Vec<f32>,
    item_vectors: Vec<f32>,
    item_biases: Vec<f32>,
}

impl Model {
    fn random(args: &Args) -> Self {
        let mut rng = StdRng::seed_from_u64(args.seed);
        let dist = Uniform::new(-1.0f32, 1.0f32);
        let mut sample = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.sample(dist)).collect() };
        Self {
            user_vectors: sample(args.num_users * args.dimensions),
            user_biases: sample(args.num_users),
            item_vectors: sample(args.num_items * args.dimensions),
            item_biases: sample(args.num_items),
        }
    }
}

#[derive(Serialize)]
struct Summary {
    capabilities: String,
    alignment: &'static str,
    lowdim_packing: bool,
    dense: Option<ModeSummary>,
    binary: Option<ModeSummary>,
    binary_dense_mrr_ratio: Option<f64>,
}

#[derive(Serialize)]
struct ModeSummary {
    num_users: usize,
    num_items: usize,
    dimensions: usize,
    threads: usize,
    memory_bytes: usize,
    total_calls: u64,
    errors: u64,
    elapsed_secs: f64,
    calls_per_sec: f64,
    items_per_sec: f64,
    latency_us: Option<LatencySummary>,
}

#[derive(Serialize)]
struct LatencySummary {
    p50: u64,
    p90: u64,
    p95: u64,
    p99: u64,
    max: u64,
}

struct WorkerStats {
    total: u64,
    errors: u64,
    items: u64,
    histogram: Histogram<u64>,
    stopped: Option<Instant>,
}

impl WorkerStats {
    fn new() -> Result<Self> {
        Ok(Self {
            total: 0,
            errors: 0,
            items: 0,
            histogram: Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)?,
            stopped: None,
        })
    }

    fn record(&mut self, latency: Duration, items: usize, ok: bool) {
        self.total += 1;
        if ok {
            self.items += items as u64;
        } else {
            self.errors += 1;
        }
        let micros = latency.as_micros() as u64;
        let value = micros.clamp(1, MAX_LATENCY_US);
        let _ = self.histogram.record(value);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    validate_args(&args)?;

    let config = Config::from_env().context("failed to load kernel configuration")?;
    let options = config.kernel_options();
    let caps = capabilities();
    info!(
        "Scoring {} users x {} items at dimension {} on {} thread(s), {:?}",
        args.num_users, args.num_items, args.dimensions, args.threads, caps
    );

    let model = Model::random(&args);
    let mut summary = Summary {
        capabilities: format!("{:?}", caps),
        alignment: options.alignment.as_str(),
        lowdim_packing: options.lowdim_packing,
        dense: None,
        binary: None,
        binary_dense_mrr_ratio: None,
    };

    let mut dense_scorer = None;
    if args.mode.dense() {
        let scorer = DenseScorer::new(
            &model.user_vectors,
            &model.user_biases,
            &model.item_vectors,
            &model.item_biases,
            args.dimensions,
        )
        .context("failed to build dense scorer")?
        .with_options(options);
        summary.dense = Some(run_workload("dense", &args, &scorer)?);
        dense_scorer = Some(scorer);
    }

    let mut binary_scorer = None;
    if args.mode.binary() {
        let scorer = BinaryScorer::new(
            &model.user_vectors,
            &model.user_biases,
            &model.item_vectors,
            &model.item_biases,
            args.dimensions,
        )
        .context("failed to build binary scorer")?
        .with_options(options);
        summary.binary = Some(run_workload("binary", &args, &scorer)?);
        binary_scorer = Some(scorer);
    }

    if let (Some(dense), Some(binary)) = (&dense_scorer, &binary_scorer) {
        let ratio = mrr_ratio(dense, binary, args.num_users.min(MAX_EVAL_USERS))
            .context("failed to evaluate ranking quality")?;
        println!("binary/dense: {:.3}x MRR on each user's dense top item", ratio);
        summary.binary_dense_mrr_ratio = Some(ratio);
    }

    if let (Some(dense), Some(binary)) = (&summary.dense, &summary.binary) {
        if dense.items_per_sec > 0.0 {
            println!(
                "binary/dense: {:.2}x throughput, {:.2}x memory",
                binary.items_per_sec / dense.items_per_sec,
                binary.memory_bytes as f64 / dense.memory_bytes as f64
            );
        }
    }

    if let Some(path) = &args.output_json {
        let contents = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write output json to {}", path.display()))?;
    }

    Ok(())
}

fn validate_args(args: &Args) -> Result<()> {
    if args.num_users == 0 {
        bail!("--num-users must be > 0");
    }
    if args.num_items == 0 {
        bail!("--num-items must be > 0");
    }
    if args.dimensions == 0 {
        bail!("--dimensions must be > 0");
    }
    if args.mode.binary() && args.dimensions % 32 != 0 {
        bail!("--dimensions must be a multiple of 32 for binary scoring");
    }
    if args.threads == 0 {
        bail!("--threads must be > 0");
    }
    if args.duration.is_zero() {
        bail!("--duration must be > 0");
    }
    Ok(())
}

/// Split `num_items` into at most `threads` contiguous ranges whose starts are
/// multiples of [`SHARD_ALIGN_ITEMS`].
fn shard_ranges(num_items: usize, threads: usize) -> Vec<Range<usize>> {
    let per_thread = num_items.div_ceil(threads);
    let shard = per_thread.div_ceil(SHARD_ALIGN_ITEMS).max(1) * SHARD_ALIGN_ITEMS;
    (0..num_items)
        .step_by(shard)
        .map(|start| start..(start + shard).min(num_items))
        .collect()
}

fn run_workload<W: Workload>(label: &str, args: &Args, scorer: &W) -> Result<ModeSummary> {
    let num_users = scorer.num_users();
    let num_items = scorer.num_items();
    let shards = shard_ranges(num_items, args.threads);
    let mut out = vec![0.0f32; num_items];

    let start = Instant::now();
    let warmup_end = start + args.warmup;
    let end = warmup_end + args.duration;

    let worker_stats = thread::scope(|s| -> Result<Vec<WorkerStats>> {
        let mut handles = Vec::with_capacity(shards.len());
        let mut rest = out.as_mut_slice();
        for (worker_id, range) in shards.iter().cloned().enumerate() {
            let (shard_out, tail) = std::mem::take(&mut rest).split_at_mut(range.len());
            rest = tail;

            handles.push(s.spawn(move || -> Result<WorkerStats> {
                let mut stats = WorkerStats::new()?;
                let mut rng = StdRng::seed_from_u64(args.seed ^ (worker_id as u64).wrapping_mul(97));

                loop {
                    let now = Instant::now();
                    if now >= end {
                        break;
                    }

                    let user_id = rng.gen_range(0..num_users);
                    let start_call = Instant::now();
                    let result = scorer.score(user_id, range.clone(), shard_out);
                    let latency = start_call.elapsed();

                    if Instant::now() >= warmup_end {
                        stats.record(latency, range.len(), result.is_ok());
                    }
                }

                stats.stopped = Some(Instant::now());
                Ok(stats)
            }));
        }

        handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| anyhow!("{} worker panicked", label))?)
            .collect()
    })?;

    let stops = worker_stats.iter().filter_map(|stats| stats.stopped);
    let elapsed = measured_elapsed(warmup_end, stops).as_secs_f64();
    let (histogram, total_calls, errors, items) = merge_stats(worker_stats)?;
    let latency_summary = summarize_latency(&histogram);
    let calls_per_sec = if elapsed > 0.0 {
        total_calls as f64 / elapsed
    } else {
        0.0
    };
    let items_per_sec = if elapsed > 0.0 {
        items as f64 / elapsed
    } else {
        0.0
    };

    println!("{} scoring complete", label);
    println!("  users: {}, items: {}, dimensions: {}", num_users, num_items, args.dimensions);
    println!("  memory: {} bytes", scorer.memory_bytes());
    println!("  calls: {} ({} shard(s))", total_calls, shards.len());
    println!("  errors: {}", errors);
    println!("  elapsed: {:.2}s", elapsed);
    println!("  throughput: {:.2} calls/s, {:.0} items/s", calls_per_sec, items_per_sec);
    print_latency("  call latency", &latency_summary);

    Ok(ModeSummary {
        num_users,
        num_items,
        dimensions: args.dimensions,
        threads: shards.len(),
        memory_bytes: scorer.memory_bytes(),
        total_calls,
        errors,
        elapsed_secs: elapsed,
        calls_per_sec,
        items_per_sec,
        latency_us: latency_summary,
    })
}

/// Hold out each user's best dense item and compare how highly the binary
/// scorer ranks it against the dense scorer.
fn mrr_ratio(dense: &DenseScorer, binary: &BinaryScorer, num_users: usize) -> Result<f64> {
    let mut held_out = Vec::with_capacity(num_users);
    for user_id in 0..num_users {
        let scores = dense.predict(user_id)?;
        let best = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(item_id, _)| item_id)
            .ok_or_else(|| anyhow!("model has no items"))?;
        held_out.push((user_id, best));
    }

    let mean = |mrrs: Vec<f32>| mrrs.iter().map(|&v| v as f64).sum::<f64>() / mrrs.len().max(1) as f64;
    let dense_mrr = mean(mrr_score(dense, &held_out, None)?);
    let binary_mrr = mean(mrr_score(binary, &held_out, None)?);
    if dense_mrr == 0.0 {
        bail!("dense MRR is zero");
    }
    Ok(binary_mrr / dense_mrr)
}

/// Wall time from the end of warmup until the last worker stopped.
fn measured_elapsed(warmup_end: Instant, stops: impl IntoIterator<Item = Instant>) -> Duration {
    stops
        .into_iter()
        .max()
        .map_or(Duration::ZERO, |last| last.saturating_duration_since(warmup_end))
}

fn merge_stats(stats: Vec<WorkerStats>) -> Result<(Histogram<u64>, u64, u64, u64)> {
    let mut merged = Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)?;
    let mut total = 0;
    let mut errors = 0;
    let mut items = 0;
    for stat in stats {
        total += stat.total;
        errors += stat.errors;
        items += stat.items;
        merged.add(&stat.histogram)?;
    }
    Ok((merged, total, errors, items))
}

fn summarize_latency(histogram: &Histogram<u64>) -> Option<LatencySummary> {
    if histogram.len() == 0 {
        return None;
    }
    Some(LatencySummary {
        p50: histogram.value_at_quantile(0.50),
        p90: histogram.value_at_quantile(0.90),
        p95: histogram.value_at_quantile(0.95),
        p99: histogram.value_at_quantile(0.99),
        max: histogram.max(),
    })
}

fn print_latency(label: &str, summary: &Option<LatencySummary>) {
    match summary {
        Some(summary) => {
            println!(
                "{}: p50={}us p90={}us p95={}us p99={}us max={}us",
                label, summary.p50, summary.p90, summary.p95, summary.p99, summary.max
            );
        }
        None => {
            println!("{}: no samples", label);
        }
    }
}
