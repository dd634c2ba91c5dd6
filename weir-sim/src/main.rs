//! weir-sim — synthetic workload driver for one WEIR shard.
//!
//! Instantiates a single shard scheduler, feeds it a seeded mix of
//! immediate, client, recovery, and best-effort traffic, and drains it the
//! way a shard consumer would: bypass and eligible fair-share work
//! immediately, `WaitUntil` tokens by sleeping on one timer. Prints
//! per-class throughput shares and the scheduler's dump on exit.
//!
//! ```text
//! weir-sim --duration 10 --tenants 4 --seed 7
//! RUST_LOG=weir=debug weir-sim --config scheduler.toml
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};
use weir_core::{ClientProfileId, SchedulerClass, WorkItemView};
use weir_sched::{DequeueResult, MclockScheduler, SchedulerConfig, ShardParams};

#[derive(Parser, Debug)]
#[command(name = "weir-sim")]
#[command(about = "Synthetic workload driver for the WEIR shard scheduler")]
#[command(version)]
struct Args {
    /// Scheduler config file (TOML or JSON); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulation duration in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Workload RNG seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Shards the node is divided into (this binary drives shard 0)
    #[arg(long, default_value = "4")]
    num_shards: u32,

    /// Treat the backing device as rotational
    #[arg(long)]
    rotational: bool,

    /// Number of distinct client tenants
    #[arg(long, default_value = "3")]
    tenants: u64,

    /// Producer cadence in milliseconds
    #[arg(long, default_value = "5")]
    tick_ms: u64,

    /// Items enqueued per producer tick
    #[arg(long, default_value = "32")]
    burst: usize,
}

#[derive(Debug)]
struct SimOp {
    priority: u32,
    cost: i32,
    class: SchedulerClass,
    tenant: ClientProfileId,
    #[allow(dead_code)]
    payload: Bytes,
}

impl WorkItemView for SimOp {
    fn priority(&self) -> u32 {
        self.priority
    }

    fn cost(&self) -> i32 {
        self.cost
    }

    fn scheduler_class(&self) -> SchedulerClass {
        self.class
    }

    fn client_profile_id(&self) -> ClientProfileId {
        self.tenant
    }
}

fn synth_op(rng: &mut StdRng, tenants: u64) -> SimOp {
    let class = match rng.random_range(0..100u32) {
        0..=1 => SchedulerClass::Immediate,
        2..=71 => SchedulerClass::Client,
        72..=89 => SchedulerClass::BackgroundRecovery,
        _ => SchedulerClass::BackgroundBestEffort,
    };
    // A small slice of client traffic carries peering-level priorities and
    // will clear the cutoff.
    let priority = if class == SchedulerClass::Client && rng.random_range(0..100u32) < 3 {
        rng.random_range(196..=250)
    } else {
        rng.random_range(0..64)
    };
    let cost = rng.random_range(512..=65_536);
    SimOp {
        priority,
        cost,
        class,
        tenant: ClientProfileId(rng.random_range(0..tenants.max(1))),
        payload: Bytes::from(vec![0u8; cost.min(4096) as usize]),
    }
}

#[derive(Debug, Default)]
struct ClassTally {
    count: u64,
    bytes: u64,
}

fn class_index(class: SchedulerClass) -> usize {
    match class {
        SchedulerClass::Immediate => 0,
        SchedulerClass::Client => 1,
        SchedulerClass::BackgroundRecovery => 2,
        SchedulerClass::BackgroundBestEffort => 3,
    }
}

const CLASS_NAMES: [&str; 4] = [
    "immediate",
    "client",
    "background_recovery",
    "background_best_effort",
];

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match SchedulerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => SchedulerConfig::default(),
    };

    let shard = ShardParams {
        whoami: 0,
        num_shards: args.num_shards,
        shard_id: 0,
        is_rotational: args.rotational,
    };

    info!(
        duration_secs = args.duration,
        tenants = args.tenants,
        seed = args.seed,
        burst = args.burst,
        profile = %config.profile,
        "starting shard simulation"
    );

    let mut sched: MclockScheduler<SimOp> = MclockScheduler::new(config, shard);
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut tallies: [ClassTally; 4] = Default::default();
    let mut enqueued = 0u64;
    let tick = Duration::from_millis(args.tick_ms.max(1));
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    while Instant::now() < deadline {
        for _ in 0..args.burst {
            sched.enqueue(synth_op(&mut rng, args.tenants));
            enqueued += 1;
        }

        // Drain everything that is currently eligible. A WaitUntil token
        // means the remaining backlog is throttled: arm one timer and come
        // back, never spin.
        let mut wake_at = None;
        loop {
            match sched.dequeue() {
                DequeueResult::Item(op) => {
                    let tally = &mut tallies[class_index(op.scheduler_class())];
                    tally.count += 1;
                    tally.bytes += op.cost.max(1) as u64;
                }
                DequeueResult::WaitUntil(t) => {
                    wake_at = Some(t);
                    break;
                }
                DequeueResult::Empty => break,
            }
        }

        let sleep_for = match wake_at {
            Some(t) => {
                let remaining = (t - sched.now()).max(0.0);
                tick.min(Duration::from_secs_f64(remaining))
            }
            None => tick,
        };
        tokio::time::sleep(sleep_for).await;
    }

    let total_bytes: u64 = tallies.iter().map(|t| t.bytes).sum();
    let dequeued: u64 = tallies.iter().map(|t| t.count).sum();
    info!(
        enqueued,
        dequeued,
        pending = sched.len(),
        "simulation finished"
    );
    for (name, tally) in CLASS_NAMES.iter().zip(tallies.iter()) {
        let share = if total_bytes > 0 {
            100.0 * tally.bytes as f64 / total_bytes as f64
        } else {
            0.0
        };
        info!(
            class = name,
            count = tally.count,
            bytes = tally.bytes,
            share_pct = format_args!("{share:.1}"),
            "class throughput"
        );
    }

    let stats = sched.stats();
    info!(
        immediate = stats.enqueued_immediate,
        cutoff = stats.enqueued_cutoff,
        fair = stats.enqueued_fair,
        waits = stats.waits,
        "routing counters"
    );

    match serde_json::to_string_pretty(&sched.dump()) {
        Ok(dump) => println!("{dump}"),
        Err(e) => error!("failed to render dump: {e}"),
    }
}
