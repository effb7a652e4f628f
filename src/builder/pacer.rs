use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Enforces a minimum interval between batch-embedding calls across a whole tree build,
/// independent of the per-slot `RateLimiter` inside `EmbeddingClient` (§5). Grounded on
/// `RaptorBuildService._ensure_last_ts`/`_embed_with_throttle`: the Python original lazily
/// initializes `_last_embed_ts` to `now - min_interval` so the very first call never waits.
pub struct Pacer {
    min_interval: Duration,
    last_embed_at: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(rpm_limit: u32) -> Self {
        let rpm = rpm_limit.max(1);
        Self {
            min_interval: Duration::from_secs_f64(60.0 / rpm as f64),
            last_embed_at: Mutex::new(None),
        }
    }

    /// Sleeps until at least `min_interval` has elapsed since the previous call, then
    /// records the new baseline. The first call never sleeps.
    pub async fn wait_turn(&self) {
        let mut last = self.last_embed_at.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_never_waits() {
        let pacer = Pacer::new(3);
        let start = Instant::now();
        pacer.wait_turn().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_waits_out_the_remaining_interval() {
        let pacer = Pacer::new(60);
        pacer.wait_turn().await;

        let start = Instant::now();
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
