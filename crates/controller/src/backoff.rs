use std::time::Duration;

use craftop_core::ObjectKey;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Per-key exponential backoff for failed passes: `base * 2^failures`, capped at `max`.
///
/// A key whose last failure is older than twice `max` is dropped on the next
/// failure of any key, so objects deleted while failing do not linger.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<ObjectKey, Failures>>,
}

struct Failures {
    count: u32,
    last: Instant,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }

    /// Record a failure for `key` and return how long to wait before the next pass.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let now = Instant::now();
        let idle = self.max.saturating_mul(2);
        let mut failures = self.failures.lock();
        failures.retain(|k, f| k == key || now.saturating_duration_since(f.last) <= idle);
        let f = failures.entry(key.clone()).or_insert(Failures { count: 0, last: now });
        let factor = 1u32.checked_shl(f.count).unwrap_or(u32::MAX);
        f.count = f.count.saturating_add(1);
        f.last = now;
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Forget failures for `key` after a successful pass or once it is gone.
    pub fn reset(&self, key: &ObjectKey) { self.failures.lock().remove(key); }

    pub fn failures(&self, key: &ObjectKey) -> u32 { self.failures.lock().get(key).map(|f| f.count).unwrap_or(0) }

    /// Number of keys currently backing off.
    pub fn tracked(&self) -> usize { self.failures.lock().len() }
}
