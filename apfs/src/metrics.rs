use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub enum Metric {
    /// Counter of B-tree node fetches
    NodeReads,
    /// Counter of node fetches served by the node cache
    NodeCacheHits,
    /// Counter of node blocks written
    NodeWrites,
    /// Counter of nodes copied to a new block because they belonged to an older transaction
    CowCopies,
    /// Counter of node splits
    NodeSplits,
    /// Counter of blocks returned to the allocation bitmap by free queue reclaim
    BlocksReclaimed,
    /// Timer used to record average query time
    QueryTime,
    /// Timer used to record average transaction commit time
    CommitTime,
}

struct ActiveMetrics {
    node_reads: AtomicU64,
    node_cache_hits: AtomicU64,
    node_writes: AtomicU64,
    cow_copies: AtomicU64,
    node_splits: AtomicU64,
    blocks_reclaimed: AtomicU64,
    query_time: Timer,
    commit_time: Timer,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    node_reads: AtomicU64::new(0),
                    node_cache_hits: AtomicU64::new(0),
                    node_writes: AtomicU64::new(0),
                    cow_copies: AtomicU64::new(0),
                    node_splits: AtomicU64::new(0),
                    blocks_reclaimed: AtomicU64::new(0),
                    query_time: Timer::new(),
                    commit_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    fn counter(metrics: &ActiveMetrics, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::NodeReads => &metrics.node_reads,
            Metric::NodeCacheHits => &metrics.node_cache_hits,
            Metric::NodeWrites => &metrics.node_writes,
            Metric::CowCopies => &metrics.cow_copies,
            Metric::NodeSplits => &metrics.node_splits,
            Metric::BlocksReclaimed => &metrics.blocks_reclaimed,
            _ => panic!("Specified metric is not a Counter"),
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        self.count_n(metric, 1);
    }

    /// Increase the Counter specified by the input by `n`
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count_n(&self, metric: Metric, n: u64) {
        if let Some(ref metrics) = self.metrics {
            Self::counter(metrics, metric).fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value of a Counter, `None` if metrics are not active.
    pub fn get(&self, metric: Metric) -> Option<u64> {
        self.metrics
            .as_ref()
            .map(|metrics| Self::counter(metrics, metric).load(Ordering::Relaxed))
    }

    /// Returns a guard that, when dropped, will record the time passed since creation
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record<'a>(&'a self, metric: Metric) -> Option<impl Drop + 'a> {
        self.metrics.as_ref().map(|metrics| {
            let timer = match metric {
                Metric::QueryTime => &metrics.query_time,
                Metric::CommitTime => &metrics.commit_time,
                _ => panic!("Specified metric is not a Timer"),
            };

            timer.record()
        })
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let node_reads = metrics.node_reads.load(Ordering::Relaxed);
            println!("  node reads            {}", node_reads);

            if node_reads != 0 {
                let hits = metrics.node_cache_hits.load(Ordering::Relaxed);
                let percentage_hits = (hits as f64 / node_reads as f64) * 100.0;
                println!(
                    "  node cache hits       {} - {:.2}% of node reads",
                    hits, percentage_hits
                );
            }

            let node_writes = metrics.node_writes.load(Ordering::Relaxed);
            println!("  node writes           {}", node_writes);

            let cow_copies = metrics.cow_copies.load(Ordering::Relaxed);
            println!("  copy-on-write copies  {}", cow_copies);

            let node_splits = metrics.node_splits.load(Ordering::Relaxed);
            println!("  node splits           {}", node_splits);

            let reclaimed = metrics.blocks_reclaimed.load(Ordering::Relaxed);
            println!("  blocks reclaimed      {}", reclaimed);

            if let Some(mean) = metrics.query_time.mean() {
                println!("  query mean            {}", pretty_display_ns(mean));
            }

            if let Some(mean) = metrics.commit_time.mean() {
                println!("  commit mean           {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record<'a>(&'a self) -> impl Drop + 'a {
        struct TimerGuard<'a> {
            start: std::time::Instant,
            n: &'a AtomicU64,
            sum: &'a AtomicU64,
        }

        impl Drop for TimerGuard<'_> {
            fn drop(&mut self) {
                let elapsed = self.start.elapsed().as_nanos() as u64;
                self.n.fetch_add(1, Ordering::Relaxed);
                self.sum.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        TimerGuard {
            start: std::time::Instant::now(),
            n: &self.number_of_records,
            sum: &self.sum,
        }
    }
}
