use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tripwire::alerts::{Alert, ComparisonOp, InMemoryAlertRegistry, MetricKind};
use tripwire::queue::{
    EnqueueOptions, EvaluationKind, EvaluationQueue, Outcome, QueueConfig, QueueItemId,
    WorkerLeaseManager,
};
use tripwire::CoreError;

const ALERTS: usize = 50;

struct WorkerStats {
    processed: usize,
    claim_latencies: Vec<Duration>,
}

struct BenchmarkStats {
    total_items: usize,
    total_duration: Duration,
    claim_latencies: Vec<Duration>,
}

impl BenchmarkStats {
    fn items_per_sec(&self) -> f64 {
        self.total_items as f64 / self.total_duration.as_secs_f64()
    }

    fn sorted(&self) -> Vec<Duration> {
        let mut sorted = self.claim_latencies.clone();
        sorted.sort();
        sorted
    }

    fn avg_latency(&self) -> Duration {
        if self.claim_latencies.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.claim_latencies.iter().sum();
        sum / self.claim_latencies.len() as u32
    }

    fn percentile(&self, pct: usize) -> Duration {
        let sorted = self.sorted();
        if sorted.is_empty() {
            return Duration::ZERO;
        }
        sorted[(sorted.len() * pct / 100).min(sorted.len() - 1)]
    }
}

async fn run_worker(
    leases: Arc<WorkerLeaseManager>,
    seen: Arc<DashMap<QueueItemId, String>>,
    worker_id: String,
    batch_size: usize,
) -> Result<WorkerStats, CoreError> {
    let queue = Arc::clone(leases.queue());
    let mut stats = WorkerStats {
        processed: 0,
        claim_latencies: Vec::new(),
    };

    loop {
        let started = Instant::now();
        let batch = leases.claim_batch(batch_size, &worker_id)?;
        stats.claim_latencies.push(started.elapsed());

        if batch.is_empty() {
            if queue.counts().pending == 0 {
                break;
            }
            tokio::task::yield_now().await;
            continue;
        }

        for item in batch {
            if let Some(previous) = seen.insert(item.id, worker_id.clone()) {
                eprintln!(
                    "DOUBLE CLAIM: item {} held by {} and {}",
                    item.id, previous, worker_id
                );
            }
            queue.report_outcome(
                item.id,
                &worker_id,
                Outcome::Success {
                    result: serde_json::json!({ "worker": worker_id }),
                },
            )?;
            stats.processed += 1;
        }
        tokio::task::yield_now().await;
    }

    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let total_items: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(100_000);
    let workers: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(16);
    let batch_size: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(32);

    println!("Tripwire Claim Benchmark");
    println!("========================");
    println!("Items:       {}", total_items);
    println!("Workers:     {}", workers);
    println!("Batch size:  {}", batch_size);
    println!();

    let registry = Arc::new(InMemoryAlertRegistry::new());
    let alert_ids = (0..ALERTS)
        .map(|i| {
            registry.create(Alert::new(
                format!("team-{}", i % 5),
                MetricKind::ResponseTime,
                ComparisonOp::GreaterThan,
                250.0 + i as f64,
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let queue = Arc::new(EvaluationQueue::new(
        registry,
        QueueConfig::default().with_lease_ttl(None),
    ));

    print!("Enqueueing... ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let start = Instant::now();
    for i in 0..total_items {
        queue.enqueue_with(
            alert_ids[i % ALERTS],
            EvaluationKind::Scheduled,
            EnqueueOptions::default().priority((i % 10) as i32),
        )?;
    }
    println!("done in {:?}", start.elapsed());

    let leases = Arc::new(WorkerLeaseManager::new(Arc::clone(&queue)));
    let seen: Arc<DashMap<QueueItemId, String>> = Arc::new(DashMap::new());

    print!("Claiming... ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let start = Instant::now();
    let handles = (0..workers).map(|w| {
        tokio::spawn(run_worker(
            Arc::clone(&leases),
            Arc::clone(&seen),
            format!("worker-{}", w),
            batch_size,
        ))
    });
    let results = join_all(handles).await;
    let total_duration = start.elapsed();
    println!("done");

    let mut processed = 0;
    let mut claim_latencies = Vec::new();
    for result in results {
        let worker = result??;
        processed += worker.processed;
        claim_latencies.extend(worker.claim_latencies);
    }

    let stats = BenchmarkStats {
        total_items: processed,
        total_duration,
        claim_latencies,
    };

    println!("  Items/sec:    {:.0}", stats.items_per_sec());
    println!("  Total time:   {:?}", stats.total_duration);
    println!(
        "  Claim latency: avg={:?} p50={:?} p99={:?}",
        stats.avg_latency(),
        stats.percentile(50),
        stats.percentile(99)
    );
    println!();

    let counts = queue.counts();
    let double_claims = processed - seen.len();
    println!("Verification:");
    println!("  Processed:     {}", processed);
    println!("  Unique items:  {}", seen.len());
    println!("  Completed:     {}", counts.completed);
    println!("  Double claims: {}", double_claims);

    if double_claims > 0 || counts.completed != total_items {
        return Err("claim exclusivity violated".into());
    }
    Ok(())
}
