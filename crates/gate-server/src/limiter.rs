//! Token-bucket rate limiting across three scopes: global, per-IP, and
//! per-identity.
//!
//! Buckets are created lazily on first use and swept when idle. Scopes are
//! evaluated global → IP → identity and short-circuit on the first
//! rejection, so a frame never consumes tokens from a later scope after an
//! earlier one said no.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Scope whose bucket rejected a frame. Returned so callers can attribute
/// the drop to the right counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Global,
    Ip,
    Identity,
}

impl RateScope {
    pub fn name(self) -> &'static str {
        match self {
            RateScope::Global => "global",
            RateScope::Ip => "ip",
            RateScope::Identity => "identity",
        }
    }
}

/// One token bucket. Tokens are real-valued; refill is proportional to
/// elapsed time and never exceeds capacity.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_period: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn new(refill_per_period: f64, capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_period,
            last_refill: now,
            last_access: now,
        }
    }

    fn try_acquire(&mut self, now: Instant, period_ms: u64) -> bool {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_millis() as f64;
        if elapsed_ms > 0.0 {
            let refill = elapsed_ms * self.refill_per_period / period_ms as f64;
            self.tokens = (self.tokens + refill).min(self.capacity);
            self.last_refill = now;
        }
        self.last_access = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}

/// Three-scope limiter. The global bucket is permanent; IP and identity
/// buckets are created on first sight and evicted after five idle minutes.
#[derive(Debug)]
pub struct RateLimiter {
    global: Mutex<TokenBucket>,
    per_ip: DashMap<IpAddr, Mutex<TokenBucket>>,
    per_identity: DashMap<String, Mutex<TokenBucket>>,
    ip_rate: f64,
    identity_rate: f64,
    period_ms: u64,
    rejected: AtomicU64,
}

/// Idle duration after which a per-IP or per-identity bucket is evicted.
pub const BUCKET_IDLE_EVICT: Duration = Duration::from_secs(5 * 60);

impl RateLimiter {
    /// `qps` and `burst` configure the global bucket; the derived scopes
    /// follow: per-IP at a tenth of the global rate, per-identity at a
    /// hundredth (floored at 10), each with twice their rate as burst.
    pub fn new(qps: u64, burst: u64, period_ms: u64) -> Self {
        let now = Instant::now();
        let ip_rate = (qps / 10).max(1) as f64;
        let identity_rate = (qps / 100).max(10) as f64;
        Self {
            global: Mutex::new(TokenBucket::new(qps as f64, burst as f64, now)),
            per_ip: DashMap::new(),
            per_identity: DashMap::new(),
            ip_rate,
            identity_rate,
            period_ms,
            rejected: AtomicU64::new(0),
        }
    }

    /// Admit or reject one frame from `ip` (and `identity`, when the
    /// connection is authenticated). Returns the first rejecting scope.
    pub fn check(&self, ip: IpAddr, identity: Option<&str>) -> Result<(), RateScope> {
        self.check_at(Instant::now(), ip, identity)
    }

    fn check_at(&self, now: Instant, ip: IpAddr, identity: Option<&str>) -> Result<(), RateScope> {
        {
            let mut global = self.global.lock().expect("global bucket lock poisoned");
            if !global.try_acquire(now, self.period_ms) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RateScope::Global);
            }
        }

        {
            let entry = self.per_ip.entry(ip).or_insert_with(|| {
                Mutex::new(TokenBucket::new(self.ip_rate, self.ip_rate * 2.0, now))
            });
            let mut bucket = entry.lock().expect("ip bucket lock poisoned");
            if !bucket.try_acquire(now, self.period_ms) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RateScope::Ip);
            }
        }

        if let Some(id) = identity {
            let entry = self.per_identity.entry(id.to_string()).or_insert_with(|| {
                Mutex::new(TokenBucket::new(
                    self.identity_rate,
                    self.identity_rate * 2.0,
                    now,
                ))
            });
            let mut bucket = entry.lock().expect("identity bucket lock poisoned");
            if !bucket.try_acquire(now, self.period_ms) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RateScope::Identity);
            }
        }

        Ok(())
    }

    /// Evict buckets idle longer than [`BUCKET_IDLE_EVICT`]. The global
    /// bucket is never evicted.
    pub fn sweep(&self) -> (usize, usize) {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> (usize, usize) {
        let before_ip = self.per_ip.len();
        let before_identity = self.per_identity.len();

        self.per_ip.retain(|_, b| {
            b.lock().expect("ip bucket lock poisoned").idle_since(now) <= BUCKET_IDLE_EVICT
        });
        self.per_identity.retain(|_, b| {
            b.lock().expect("identity bucket lock poisoned").idle_since(now) <= BUCKET_IDLE_EVICT
        });

        let evicted = (
            before_ip - self.per_ip.len(),
            before_identity - self.per_identity.len(),
        );
        if evicted.0 > 0 || evicted.1 > 0 {
            debug!(ip = evicted.0, identity = evicted.1, "evicted idle rate buckets");
        }
        evicted
    }

    /// Live bucket counts `(per_ip, per_identity)` for the metrics snapshot.
    pub fn bucket_counts(&self) -> (usize, usize) {
        (self.per_ip.len(), self.per_identity.len())
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
