//! Named rate-limited work queues.
//!
//! Keys (`namespace/name`) flow from the cache event handlers into a queue
//! and out to a single worker. Re-adding a key that is already pending
//! coalesces; re-adding a key that is being processed marks it dirty and it
//! is re-dispatched after the current run completes, so at most one
//! reconciliation per key runs at a time.
//!
//! Failed keys come back through [`TaskQueue::add_rate_limited`], which
//! delays the re-add by the maximum of a per-item exponential backoff
//! (300 ms doubling up to 1000 s) and a process-wide token bucket
//! (10 qps, burst 100).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::metrics::QueueMetrics;

/// Per-item backoff baseline
const BASE_DELAY: Duration = Duration::from_millis(300);

/// Per-item backoff ceiling
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Process-wide token bucket rate
const BUCKET_QPS: f64 = 10.0;

/// Process-wide token bucket burst
const BUCKET_BURST: f64 = 100.0;

/// A named FIFO of `namespace/name` keys with dedup, per-item retry
/// accounting and rate-limited re-adds.
pub struct TaskQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    metrics: QueueMetrics,
}

struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    queued_at: HashMap<String, Instant>,
    bucket: TokenBucket,
    shutting_down: bool,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: BUCKET_BURST,
            last_refill: Instant::now(),
        }
    }

    /// Reserve one token, returning how long the caller must wait for it.
    /// The bucket may go into debt, which serializes queued reservations at
    /// the configured rate.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * BUCKET_QPS).min(BUCKET_BURST);
        self.last_refill = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / BUCKET_QPS)
        }
    }
}

impl TaskQueue {
    /// Create a new queue called `name` (also the metrics subsystem)
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                queued_at: HashMap::new(),
                bucket: TokenBucket::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            metrics: QueueMetrics::new(name),
        })
    }

    /// Name of the queue
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a key. Pending duplicates coalesce; keys being processed are
    /// re-dispatched once the in-flight run completes.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().expect("queue poisoned");
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        self.metrics.adds.inc();
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queued_at.entry(key.clone()).or_insert_with(Instant::now);
        state.queue.push_back(key);
        self.metrics.depth.set(state.queue.len() as i64);
        drop(state);
        self.notify.notify_one();
    }

    /// Re-add a failed key after the rate limiters allow it. Increments the
    /// per-item failure counter used for the backoff and for
    /// [`TaskQueue::num_requeues`].
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state.lock().expect("queue poisoned");
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let backoff = exponential_delay(*failures);
            *failures += 1;
            backoff.max(state.bucket.reserve())
        };
        self.metrics.retries.inc();
        debug!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "requeueing");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// How many times `key` was requeued since the last forget
    pub fn num_requeues(&self, key: &str) -> u32 {
        let state = self.state.lock().expect("queue poisoned");
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear the per-item backoff after a successful reconciliation
    pub fn forget(&self, key: &str) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.failures.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().expect("queue poisoned");
                if let Some(key) = state.queue.pop_front() {
                    self.metrics.depth.set(state.queue.len() as i64);
                    if let Some(queued) = state.queued_at.remove(&key) {
                        self.metrics.latency.observe(queued.elapsed().as_secs_f64());
                    }
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark a key as processed. A key that turned dirty while in flight is
    /// put back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queued_at.entry(key.to_string()).or_insert_with(Instant::now);
            state.queue.push_back(key.to_string());
            self.metrics.depth.set(state.queue.len() as i64);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Refuse new work and wake every waiting worker. In-flight keys run to
    /// completion; queued keys are still handed out until drained.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("queue poisoned");
        state.shutting_down = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Record how long one reconciliation took
    pub fn observe_work_duration(&self, elapsed: Duration) {
        self.metrics.work_duration.observe(elapsed.as_secs_f64());
    }

    /// Number of keys currently queued (excluding in-flight keys)
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue poisoned").queue.len()
    }

    /// Returns true when no key is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential backoff for the n-th failure, 300 ms doubling up to 1000 s
fn exponential_delay(failures: u32) -> Duration {
    let exp = BASE_DELAY.as_secs_f64() * 2_f64.powi(failures.min(32) as i32);
    Duration::from_secs_f64(exp.min(MAX_DELAY.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(exponential_delay(0), Duration::from_millis(300));
        assert_eq!(exponential_delay(1), Duration::from_millis(600));
        assert_eq!(exponential_delay(2), Duration::from_millis(1200));
        assert_eq!(exponential_delay(31), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn pending_keys_coalesce() {
        let q = TaskQueue::new("kong_test_queue");
        q.add("default/web");
        q.add("default/web");
        q.add("default/api");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("default/web"));
        assert_eq!(q.get().await.as_deref(), Some("default/api"));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn in_flight_readds_redispatch_after_done() {
        let q = TaskQueue::new("kong_test_queue");
        q.add("default/web");
        let key = q.get().await.unwrap();

        // the key is being processed, a concurrent event re-adds it
        q.add("default/web");
        assert_eq!(q.len(), 0, "dirty key must not be double-queued");

        q.done(&key);
        assert_eq!(q.len(), 1, "dirty key is re-dispatched after done");
        assert_eq!(q.get().await.as_deref(), Some("default/web"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_count_requeues_until_forgotten() {
        let q = TaskQueue::new("kong_test_queue");
        assert_eq!(q.num_requeues("default/web"), 0);

        q.add_rate_limited("default/web");
        assert_eq!(q.num_requeues("default/web"), 1);
        q.add_rate_limited("default/web");
        assert_eq!(q.num_requeues("default/web"), 2);

        // paused clock: sleep until the 600ms backoff elapsed
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(q.get().await.as_deref(), Some("default/web"));

        q.forget("default/web");
        assert_eq!(q.num_requeues("default/web"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_the_backoff() {
        let q = TaskQueue::new("kong_test_queue");
        q.add_rate_limited("default/web");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(q.len(), 0, "key must not appear before the 300ms baseline");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_and_unblocks_workers() {
        let q = TaskQueue::new("kong_test_queue");
        q.add("default/web");
        q.shutdown();

        // queued work is still handed out
        assert_eq!(q.get().await.as_deref(), Some("default/web"));
        // then the worker observes the shutdown
        assert_eq!(q.get().await, None);
        // and new work is refused
        q.add("default/other");
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn get_blocks_until_work_arrives() {
        let q = TaskQueue::new("kong_test_queue");
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("default/web");
        let got = waiter.await.unwrap();
        assert_eq!(got.as_deref(), Some("default/web"));
    }

    #[test]
    fn token_bucket_burst_then_throttle() {
        let mut bucket = TokenBucket::new();
        for _ in 0..100 {
            assert_eq!(bucket.reserve(), Duration::ZERO);
        }
        // burst exhausted, the 101st reservation waits ~100ms at 10 qps
        let delay = bucket.reserve();
        assert!(delay > Duration::from_millis(50), "got {delay:?}");
        assert!(delay <= Duration::from_millis(150), "got {delay:?}");
    }
}
