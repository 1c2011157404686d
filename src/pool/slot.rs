use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::oneshot;

use super::QueueVerdict;
use crate::config::{CircuitBreakerConfig, RateLimitConfig};

/// One waiter in a slot's priority queue. Owns exactly one unit of
/// `reserved_for_queue` until it is admitted, expired, or dropped.
pub(crate) struct QueuedEntry {
    pub id: u64,
    pub priority: i32,
    pub seq: u64,
    pub enqueued_at_ms: u64,
    pub deadline_ms: u64,
    pub tx: oneshot::Sender<QueueVerdict>,
    pub preferred_provider: Option<String>,
}

/// Capacity and health accounting for one `(provider, model)` pair.
///
/// Counters obey, after every public pool operation:
/// `active + reserved_confirm_pending + reserved_for_queue <= max_concurrent`
/// at admission time, and each queue entry / pending reservation owns exactly
/// one unit of its counter.
pub(crate) struct SlotState {
    pub max_concurrent: u32,
    pub active: u32,
    pub reserved_confirm_pending: u32,
    pub reserved_for_queue: u32,
    /// reservation id -> expiry deadline (ms). Dropping an entry and
    /// decrementing the counter happen in the same critical section, so a
    /// leaked timer cannot desynchronize the books.
    pub reservations: HashMap<u64, u64>,
    pub queue: Vec<QueuedEntry>,
    pub rate_limit_until_ms: u64,
    pub rate_limit_backoff_count: u32,
    pub rate_limit_base_delay_ms: u64,
    pub circuit_open: bool,
    pub circuit_open_until_ms: u64,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_used_ms: u64,
}

impl SlotState {
    pub fn new(max_concurrent: u32, base_retry_after_ms: u64) -> Self {
        Self {
            max_concurrent,
            active: 0,
            reserved_confirm_pending: 0,
            reserved_for_queue: 0,
            reservations: HashMap::new(),
            queue: Vec::new(),
            rate_limit_until_ms: 0,
            rate_limit_backoff_count: 0,
            rate_limit_base_delay_ms: base_retry_after_ms,
            circuit_open: false,
            circuit_open_until_ms: 0,
            failure_count: 0,
            success_count: 0,
            last_used_ms: 0,
        }
    }

    pub fn in_use(&self) -> u32 {
        self.active + self.reserved_confirm_pending + self.reserved_for_queue
    }

    pub fn saturated(&self) -> bool {
        self.in_use() >= self.max_concurrent
    }

    pub fn is_rate_limited(&self, now_ms: u64) -> bool {
        self.rate_limit_until_ms > now_ms
    }

    /// Clears an expired circuit so the next capacity check admits a single
    /// probe (half-open is implicit in the cleared state).
    pub fn refresh_circuit(&mut self, now_ms: u64, breaker: &CircuitBreakerConfig) {
        if self.circuit_open && now_ms >= self.circuit_open_until_ms {
            if breaker.test_request_after_cooldown {
                self.circuit_open = false;
                self.failure_count = 0;
            } else {
                self.circuit_open = false;
            }
        }
    }

    pub fn admissible(&self, now_ms: u64) -> bool {
        !self.circuit_open && !self.is_rate_limited(now_ms) && !self.saturated()
    }

    /// Drop confirm-pending reservations past their deadline. Counter and
    /// table move together.
    pub fn expire_reservations(&mut self, now_ms: u64) {
        let before = self.reservations.len();
        self.reservations.retain(|_, deadline| *deadline > now_ms);
        let expired = before - self.reservations.len();
        self.reserved_confirm_pending = self
            .reserved_confirm_pending
            .saturating_sub(expired as u32);
    }

    /// Remove queue entries past deadline or abandoned by their waiter.
    /// Returns the expired entries so the pool can fail them outside the lock.
    pub fn expire_queue(&mut self, now_ms: u64) -> Vec<QueuedEntry> {
        let mut expired = Vec::new();
        let mut kept = Vec::with_capacity(self.queue.len());
        for entry in self.queue.drain(..) {
            if entry.deadline_ms <= now_ms || entry.tx.is_closed() {
                self.reserved_for_queue = self.reserved_for_queue.saturating_sub(1);
                expired.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.queue = kept;
        expired
    }

    pub fn sort_queue(&mut self) {
        self.queue
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    pub fn record_success(&mut self) {
        self.success_count = self.success_count.saturating_add(1);
        self.failure_count = self.failure_count.saturating_sub(1);
        self.rate_limit_backoff_count = 0;
    }

    pub fn record_failure(&mut self, now_ms: u64, breaker: &CircuitBreakerConfig) {
        self.failure_count = self.failure_count.saturating_add(1);
        if self.failure_count >= breaker.failure_threshold {
            self.circuit_open = true;
            self.circuit_open_until_ms = now_ms.saturating_add(breaker.cooldown_period_ms);
        }
    }

    /// Exponential rate-limit backoff. An explicit retry-after becomes the
    /// new base when the config says to respect it.
    pub fn mark_rate_limit(
        &mut self,
        now_ms: u64,
        retry_after_ms: Option<u64>,
        config: &RateLimitConfig,
    ) {
        self.rate_limit_backoff_count = self.rate_limit_backoff_count.saturating_add(1);
        let delay = match retry_after_ms {
            Some(explicit) if config.respect_retry_after_header => {
                self.rate_limit_base_delay_ms = explicit;
                explicit
            }
            _ => {
                let exponent = self.rate_limit_backoff_count.saturating_sub(1);
                let scaled = self.rate_limit_base_delay_ms as f64
                    * config.backoff_multiplier.powi(exponent as i32);
                (scaled as u64).min(config.max_backoff_ms)
            }
        };
        self.rate_limit_until_ms = now_ms.saturating_add(delay);
    }

    pub fn success_rate(&self) -> f64 {
        let failures = u64::from(self.failure_count);
        let total = self.success_count + failures;
        if total == 0 {
            return 100.0;
        }
        self.success_count as f64 / total as f64 * 100.0
    }
}

/// Serialized view of a slot for the status endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct SlotSnapshot {
    pub provider: String,
    pub model: String,
    pub active: u32,
    pub reserved_confirm_pending: u32,
    pub reserved_for_queue: u32,
    pub max_concurrent: u32,
    pub queue_depth: usize,
    pub rate_limited: bool,
    pub rate_limit_until_ms: u64,
    pub circuit_open: bool,
    pub circuit_open_until_ms: u64,
    pub failure_count: u32,
    pub success_count: u64,
    pub last_used_ms: u64,
}
