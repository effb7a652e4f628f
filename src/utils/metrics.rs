use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    trees_built: AtomicU64,
    trees_failed: AtomicU64,
    levels_processed: AtomicU64,
    summarize_calls: AtomicU64,
    embed_calls: AtomicU64,
    provider_retries: AtomicU64,
    total_build_time_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                trees_built: AtomicU64::new(0),
                trees_failed: AtomicU64::new(0),
                levels_processed: AtomicU64::new(0),
                summarize_calls: AtomicU64::new(0),
                embed_calls: AtomicU64::new(0),
                provider_retries: AtomicU64::new(0),
                total_build_time_ms: AtomicU64::new(0),
            }),
        }
    }

    pub fn increment_trees_built(&self) {
        self.inner.trees_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_trees_failed(&self) {
        self.inner.trees_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_levels_processed(&self, count: u64) {
        self.inner.levels_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_summarize_calls(&self, count: u64) {
        self.inner.summarize_calls.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_embed_calls(&self, count: u64) {
        self.inner.embed_calls.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_provider_retries(&self, count: u64) {
        self.inner.provider_retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_build_time(&self, duration: Duration) {
        self.inner
            .total_build_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get_trees_built(&self) -> u64 {
        self.inner.trees_built.load(Ordering::Relaxed)
    }

    pub fn get_trees_failed(&self) -> u64 {
        self.inner.trees_failed.load(Ordering::Relaxed)
    }

    pub fn print_summary(&self) {
        println!("\n=== METRICS SUMMARY ===");
        println!("Trees built: {}", self.get_trees_built());
        println!("Trees failed: {}", self.get_trees_failed());
        println!(
            "Levels processed: {}",
            self.inner.levels_processed.load(Ordering::Relaxed)
        );
        println!(
            "Summarize calls: {}",
            self.inner.summarize_calls.load(Ordering::Relaxed)
        );
        println!(
            "Embed calls: {}",
            self.inner.embed_calls.load(Ordering::Relaxed)
        );
        println!(
            "Provider retries: {}",
            self.inner.provider_retries.load(Ordering::Relaxed)
        );
        println!(
            "Total build time: {:.2}s",
            self.inner.total_build_time_ms.load(Ordering::Relaxed) as f64 / 1000.0
        );
        println!("=========================\n");
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer helper for measuring duration.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
