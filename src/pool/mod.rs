//! Per-(provider, model) capacity pool: admission counters, circuit breaker,
//! rate-limit cooldowns, and a priority queue of waiters.

pub(crate) mod slot;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::ModelPoolConfig;
use crate::error::{RelayError, Result};

pub(crate) use slot::QueuedEntry;
use slot::SlotState;
pub use slot::SlotSnapshot;

/// Outcome delivered to a queued waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueVerdict {
    /// The waiter now owns one `active` unit and may proceed.
    Admitted,
    TimedOut,
    Cleared,
}

/// Future side of `enqueue`. Resolving to `Admitted` transfers ownership of
/// one active unit to the caller, who must pair it with a `release_slot`.
pub struct QueueWaiter {
    provider: String,
    model: String,
    rx: oneshot::Receiver<QueueVerdict>,
}

impl QueueWaiter {
    pub async fn wait(self) -> Result<()> {
        let verdict = self.rx.await.unwrap_or(QueueVerdict::Cleared);
        match verdict {
            QueueVerdict::Admitted => Ok(()),
            QueueVerdict::TimedOut | QueueVerdict::Cleared => Err(RelayError::QueueTimeout {
                provider: self.provider,
                model: self.model,
            }),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueEntrySnapshot {
    pub provider: String,
    pub model: String,
    pub id: u64,
    pub priority: i32,
    pub enqueued_at_ms: u64,
    pub deadline_ms: u64,
    pub preferred_provider: Option<String>,
}

pub struct ModelPool {
    slots: Mutex<HashMap<(String, String), SlotState>>,
    config: ModelPoolConfig,
    clock: Arc<dyn Clock>,
    reservation_seq: AtomicU64,
    queue_seq: AtomicU64,
}

impl ModelPool {
    pub fn new(config: ModelPoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
            clock,
            reservation_seq: AtomicU64::new(1),
            queue_seq: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ModelPoolConfig {
        &self.config
    }

    fn with_slot<T>(&self, provider: &str, model: &str, f: impl FnOnce(&mut SlotState, u64) -> T) -> T {
        let now = self.clock.now_millis();
        let mut slots = self.slots.lock().expect("model pool poisoned");
        let slot = slots
            .entry((provider.to_string(), model.to_string()))
            .or_insert_with(|| {
                SlotState::new(
                    self.config.max_concurrent_per_model,
                    self.config.rate_limit.default_retry_after_ms,
                )
            });
        f(slot, now)
    }

    /// Capacity probe. The only side effect is circuit-cooldown expiry: an
    /// elapsed cooldown clears the breaker so one probe request is admitted
    /// (half-open).
    pub fn has_capacity(&self, provider: &str, model: &str) -> bool {
        self.with_slot(provider, model, |slot, now| {
            slot.refresh_circuit(now, &self.config.circuit_breaker);
            slot.admissible(now)
        })
    }

    pub fn is_rate_limited(&self, provider: &str, model: &str) -> bool {
        self.with_slot(provider, model, |slot, now| slot.is_rate_limited(now))
    }

    pub fn is_circuit_open(&self, provider: &str, model: &str) -> bool {
        self.with_slot(provider, model, |slot, now| {
            slot.refresh_circuit(now, &self.config.circuit_breaker);
            slot.circuit_open
        })
    }

    /// Claim one unit of confirm-pending capacity. Health state (rate limit,
    /// circuit) is deliberately not consulted here; admission-path gating
    /// lives in the dispatcher so queue reservations stay orthogonal.
    pub fn reserve_slot(&self, provider: &str, model: &str, timeout_ms: u64) -> Option<u64> {
        self.with_slot(provider, model, |slot, now| {
            slot.expire_reservations(now);
            if slot.saturated() {
                return None;
            }
            let id = self.reservation_seq.fetch_add(1, Ordering::Relaxed);
            slot.reserved_confirm_pending += 1;
            slot.reservations.insert(id, now.saturating_add(timeout_ms));
            Some(id)
        })
    }

    /// Promote a reservation to an active request. Returns false when the
    /// reservation already expired.
    pub fn confirm_slot(&self, provider: &str, model: &str, reservation_id: u64) -> bool {
        self.with_slot(provider, model, |slot, now| {
            slot.expire_reservations(now);
            if slot.reservations.remove(&reservation_id).is_none() {
                return false;
            }
            slot.reserved_confirm_pending = slot.reserved_confirm_pending.saturating_sub(1);
            slot.active += 1;
            slot.last_used_ms = now;
            true
        })
    }

    pub fn release_reservation(&self, provider: &str, model: &str, reservation_id: u64) {
        self.with_slot(provider, model, |slot, _now| {
            if slot.reservations.remove(&reservation_id).is_some() {
                slot.reserved_confirm_pending = slot.reserved_confirm_pending.saturating_sub(1);
            }
        });
        self.process_queue(provider, model);
    }

    /// Reserve and immediately confirm, bypassing the confirm-pending window.
    pub fn try_acquire(&self, provider: &str, model: &str) -> bool {
        self.with_slot(provider, model, |slot, now| {
            slot.expire_reservations(now);
            if slot.saturated() {
                return false;
            }
            slot.active += 1;
            slot.last_used_ms = now;
            true
        })
    }

    /// Release an active unit, attributing the outcome to the slot's health.
    pub fn release_slot(&self, provider: &str, model: &str, success: bool) {
        self.with_slot(provider, model, |slot, now| {
            slot.active = slot.active.saturating_sub(1);
            if success {
                slot.record_success();
                slot.rate_limit_base_delay_ms = self.config.rate_limit.default_retry_after_ms;
            } else {
                slot.record_failure(now, &self.config.circuit_breaker);
            }
        });
        self.process_queue(provider, model);
    }

    /// Release without blaming the slot. Used for cancelled race losers so a
    /// cancellation never counts against the circuit breaker.
    pub fn release_slot_uncounted(&self, provider: &str, model: &str) {
        self.with_slot(provider, model, |slot, _| {
            slot.active = slot.active.saturating_sub(1);
        });
        self.process_queue(provider, model);
    }

    pub fn mark_rate_limit(&self, provider: &str, model: &str, retry_after_ms: Option<u64>) {
        self.with_slot(provider, model, |slot, now| {
            slot.mark_rate_limit(now, retry_after_ms, &self.config.rate_limit);
            debug!(
                provider,
                model,
                until_ms = slot.rate_limit_until_ms,
                backoff_count = slot.rate_limit_backoff_count,
                "rate limit cooldown set"
            );
        });
    }

    /// Park a request until capacity frees up. Rejects immediately when the
    /// queue is at its bound.
    pub fn enqueue(
        &self,
        provider: &str,
        model: &str,
        priority: i32,
        preferred_provider: Option<String>,
    ) -> Result<QueueWaiter> {
        let (tx, rx) = oneshot::channel();
        self.with_slot(provider, model, |slot, now| {
            if slot.queue.len() >= self.config.queue.max_queue_size {
                return Err(RelayError::QueueFull {
                    provider: provider.to_string(),
                    model: model.to_string(),
                });
            }
            let id = self.queue_seq.fetch_add(1, Ordering::Relaxed);
            let entry = QueuedEntry {
                id,
                priority,
                seq: id,
                enqueued_at_ms: now,
                deadline_ms: now.saturating_add(self.config.queue.queue_timeout_ms),
                tx,
                preferred_provider,
            };
            slot.reserved_for_queue += 1;
            slot.queue.push(entry);
            slot.sort_queue();
            Ok(())
        })?;
        // The caller may already hold no capacity; give the head a chance in
        // case a release landed between lock drops.
        self.process_queue(provider, model);
        Ok(QueueWaiter {
            provider: provider.to_string(),
            model: model.to_string(),
            rx,
        })
    }

    /// Admit queue heads while capacity remains. The queue-to-active
    /// transition happens inside the slot lock so concurrent invocations see
    /// a consistent snapshot.
    pub fn process_queue(&self, provider: &str, model: &str) {
        self.with_slot(provider, model, |slot, now| {
            loop {
                slot.expire_reservations(now);
                if slot.saturated() || slot.queue.is_empty() {
                    break;
                }
                if self.config.queue.skip_rate_limited && slot.is_rate_limited(now) {
                    break;
                }
                let entry = slot.queue.remove(0);
                slot.reserved_for_queue = slot.reserved_for_queue.saturating_sub(1);
                slot.active += 1;
                slot.last_used_ms = now;
                if entry.tx.send(QueueVerdict::Admitted).is_err() {
                    // Waiter abandoned the queue; hand the unit back.
                    slot.active = slot.active.saturating_sub(1);
                }
            }
        });
    }

    /// Background tick: expire reservations and queue deadlines, re-admit
    /// heads, and watch queue depth.
    pub fn sweep(&self) {
        let keys: Vec<(String, String)> = {
            let slots = self.slots.lock().expect("model pool poisoned");
            slots.keys().cloned().collect()
        };
        for (provider, model) in keys {
            let expired = self.with_slot(&provider, &model, |slot, now| {
                slot.refresh_circuit(now, &self.config.circuit_breaker);
                slot.expire_reservations(now);
                let expired = slot.expire_queue(now);
                let depth = slot.queue.len();
                let cap = self.config.queue.max_queue_size;
                if cap > 0 {
                    if depth * 100 >= cap * 95 {
                        error!(provider, model, depth, cap, "queue depth critical");
                    } else if depth * 100 >= cap * 80 {
                        warn!(provider, model, depth, cap, "queue depth high");
                    }
                }
                expired
            });
            for entry in expired {
                let _ = entry.tx.send(QueueVerdict::TimedOut);
            }
            self.process_queue(&provider, &model);
        }
    }

    /// Subset of the candidates that are admissible right now.
    pub fn get_available_alternatives(
        &self,
        candidates: &[(String, String)],
    ) -> Vec<(String, String)> {
        candidates
            .iter()
            .filter(|(provider, model)| self.has_capacity(provider, model))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let now = self.clock.now_millis();
        let slots = self.slots.lock().expect("model pool poisoned");
        let mut out: Vec<SlotSnapshot> = slots
            .iter()
            .map(|((provider, model), slot)| SlotSnapshot {
                provider: provider.clone(),
                model: model.clone(),
                active: slot.active,
                reserved_confirm_pending: slot.reserved_confirm_pending,
                reserved_for_queue: slot.reserved_for_queue,
                max_concurrent: slot.max_concurrent,
                queue_depth: slot.queue.len(),
                rate_limited: slot.is_rate_limited(now),
                rate_limit_until_ms: slot.rate_limit_until_ms,
                circuit_open: slot.circuit_open,
                circuit_open_until_ms: slot.circuit_open_until_ms,
                failure_count: slot.failure_count,
                success_count: slot.success_count,
                last_used_ms: slot.last_used_ms,
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        out
    }

    pub fn queue_snapshot(&self) -> Vec<QueueEntrySnapshot> {
        let slots = self.slots.lock().expect("model pool poisoned");
        let mut out = Vec::new();
        for ((provider, model), slot) in slots.iter() {
            for entry in &slot.queue {
                out.push(QueueEntrySnapshot {
                    provider: provider.clone(),
                    model: model.clone(),
                    id: entry.id,
                    priority: entry.priority,
                    enqueued_at_ms: entry.enqueued_at_ms,
                    deadline_ms: entry.deadline_ms,
                    preferred_provider: entry.preferred_provider.clone(),
                });
            }
        }
        out.sort_by_key(|entry| entry.id);
        out
    }

    /// Drop every queued waiter. Returns how many were cleared.
    pub fn clear_queues(&self) -> usize {
        let drained: Vec<QueuedEntry> = {
            let mut slots = self.slots.lock().expect("model pool poisoned");
            let mut drained = Vec::new();
            for slot in slots.values_mut() {
                slot.reserved_for_queue = slot
                    .reserved_for_queue
                    .saturating_sub(slot.queue.len() as u32);
                drained.append(&mut slot.queue);
            }
            drained
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(QueueVerdict::Cleared);
        }
        count
    }

    /// Force-close every open breaker. Returns how many were reset.
    pub fn reset_circuit_breakers(&self) -> usize {
        let mut slots = self.slots.lock().expect("model pool poisoned");
        let mut reset = 0;
        for slot in slots.values_mut() {
            if slot.circuit_open {
                slot.circuit_open = false;
                slot.circuit_open_until_ms = 0;
                slot.failure_count = 0;
                reset += 1;
            }
        }
        reset
    }

    /// Internal status used by the selector's scoring pass.
    pub(crate) fn slot_status(&self, provider: &str, model: &str) -> SlotStatus {
        self.with_slot(provider, model, |slot, now| SlotStatus {
            in_use: slot.in_use(),
            max_concurrent: slot.max_concurrent,
            failure_count: slot.failure_count,
            success_rate: slot.success_rate(),
            rate_limited: slot.is_rate_limited(now),
            circuit_open: slot.circuit_open,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct SlotStatus {
    pub in_use: u32,
    pub max_concurrent: u32,
    pub failure_count: u32,
    pub success_rate: f64,
    pub rate_limited: bool,
    pub circuit_open: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CircuitBreakerConfig, QueueConfig, RateLimitConfig};

    fn pool_with(clock: Arc<ManualClock>, max_concurrent: u32) -> ModelPool {
        let config = ModelPoolConfig {
            max_concurrent_per_model: max_concurrent,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                cooldown_period_ms: 60_000,
                test_request_after_cooldown: true,
            },
            rate_limit: RateLimitConfig {
                default_retry_after_ms: 60_000,
                respect_retry_after_header: true,
                backoff_multiplier: 1.5,
                max_backoff_ms: 300_000,
            },
            queue: QueueConfig {
                max_queue_size: 3,
                queue_timeout_ms: 30_000,
                priority_levels: 3,
                skip_rate_limited: true,
            },
            priority_failover: false,
        };
        ModelPool::new(config, clock)
    }

    #[test]
    fn basic_admit_and_release() {
        let clock = ManualClock::new(1_000);
        let pool = pool_with(clock, 2);

        assert!(pool.try_acquire("a", "m"));
        assert!(pool.try_acquire("a", "m"));
        assert!(!pool.try_acquire("a", "m"));

        pool.release_slot("a", "m", true);
        assert!(pool.try_acquire("a", "m"));
        pool.release_slot("a", "m", true);
        pool.release_slot("a", "m", true);

        let snap = &pool.snapshot()[0];
        assert_eq!(snap.success_count, 3);
        assert_eq!(snap.failure_count, 0);
    }

    #[test]
    fn counters_never_exceed_max_at_admission() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 2);

        let r1 = pool.reserve_slot("a", "m", 5_000).unwrap();
        assert!(pool.try_acquire("a", "m"));
        assert!(pool.reserve_slot("a", "m", 5_000).is_none());
        assert!(!pool.try_acquire("a", "m"));

        assert!(pool.confirm_slot("a", "m", r1));
        let snap = &pool.snapshot()[0];
        assert_eq!(snap.active, 2);
        assert_eq!(snap.reserved_confirm_pending, 0);
    }

    #[tokio::test]
    async fn priority_queue_admits_in_priority_then_fifo_order() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 2);
        assert!(pool.try_acquire("a", "m"));
        assert!(pool.try_acquire("a", "m"));

        let low = pool.enqueue("a", "m", -10, None).unwrap();
        let high = pool.enqueue("a", "m", 10, None).unwrap();
        let normal = pool.enqueue("a", "m", 0, None).unwrap();

        pool.release_slot("a", "m", true);
        high.wait().await.unwrap();

        pool.release_slot("a", "m", true);
        normal.wait().await.unwrap();

        pool.release_slot("a", "m", true);
        low.wait().await.unwrap();
    }

    #[test]
    fn queue_rejects_when_full() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 1);
        assert!(pool.try_acquire("a", "m"));
        let _w1 = pool.enqueue("a", "m", 0, None).unwrap();
        let _w2 = pool.enqueue("a", "m", 0, None).unwrap();
        let _w3 = pool.enqueue("a", "m", 0, None).unwrap();
        assert!(matches!(
            pool.enqueue("a", "m", 0, None),
            Err(RelayError::QueueFull { .. })
        ));
    }

    #[tokio::test]
    async fn queue_deadline_rejects_with_timeout() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 1);
        assert!(pool.try_acquire("a", "m"));
        let waiter = pool.enqueue("a", "m", 0, None).unwrap();

        clock.advance(30_001);
        pool.sweep();

        assert!(matches!(
            waiter.wait().await,
            Err(RelayError::QueueTimeout { .. })
        ));
        assert_eq!(pool.snapshot()[0].reserved_for_queue, 0);
    }

    #[test]
    fn circuit_opens_after_threshold_and_half_opens_after_cooldown() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 2);

        for _ in 0..5 {
            assert!(pool.try_acquire("a", "m"));
            pool.release_slot("a", "m", false);
        }
        assert!(pool.is_circuit_open("a", "m"));
        assert!(!pool.has_capacity("a", "m"));

        clock.advance(60_001);
        assert!(pool.has_capacity("a", "m"));
        assert!(!pool.is_circuit_open("a", "m"));
        assert_eq!(pool.snapshot()[0].failure_count, 0);
    }

    #[test]
    fn failures_after_probe_retrip_circuit() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 2);

        for _ in 0..5 {
            assert!(pool.try_acquire("a", "m"));
            pool.release_slot("a", "m", false);
        }
        clock.advance(60_001);
        assert!(pool.has_capacity("a", "m"));

        // Probe fails five more times before the breaker trips again.
        for _ in 0..5 {
            assert!(pool.try_acquire("a", "m"));
            pool.release_slot("a", "m", false);
        }
        assert!(pool.is_circuit_open("a", "m"));
    }

    #[test]
    fn rate_limit_backoff_grows_exponentially_and_caps() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 2);

        pool.mark_rate_limit("a", "m", None);
        pool.mark_rate_limit("a", "m", None);
        pool.mark_rate_limit("a", "m", None);
        // 60_000 * 1.5^2
        assert_eq!(pool.snapshot()[0].rate_limit_until_ms, 135_000);

        for _ in 0..17 {
            pool.mark_rate_limit("a", "m", None);
        }
        assert_eq!(pool.snapshot()[0].rate_limit_until_ms, 300_000);

        assert!(pool.try_acquire("a", "m"));
        pool.release_slot("a", "m", true);
        pool.mark_rate_limit("a", "m", None);
        assert_eq!(pool.snapshot()[0].rate_limit_until_ms, 60_000);
    }

    #[test]
    fn explicit_retry_after_becomes_new_base() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 2);

        pool.mark_rate_limit("a", "m", Some(10_000));
        assert_eq!(pool.snapshot()[0].rate_limit_until_ms, 10_000);

        clock.set(20_000);
        pool.mark_rate_limit("a", "m", None);
        // base is now 10_000, second mark => 10_000 * 1.5
        assert_eq!(pool.snapshot()[0].rate_limit_until_ms, 20_000 + 15_000);
    }

    #[test]
    fn rate_limited_slot_is_not_admissible_until_cooldown() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 2);
        pool.mark_rate_limit("a", "m", Some(5_000));
        assert!(!pool.has_capacity("a", "m"));
        clock.advance(5_001);
        assert!(pool.has_capacity("a", "m"));
    }

    #[test]
    fn reservation_expiry_returns_capacity() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 1);
        let id = pool.reserve_slot("a", "m", 1_000).unwrap();
        assert!(!pool.try_acquire("a", "m"));

        clock.advance(1_001);
        assert!(pool.try_acquire("a", "m"));
        // Stale confirm is refused.
        assert!(!pool.confirm_slot("a", "m", id));
    }

    #[test]
    fn release_reservation_frees_capacity() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 1);
        let id = pool.reserve_slot("a", "m", 10_000).unwrap();
        pool.release_reservation("a", "m", id);
        assert!(pool.try_acquire("a", "m"));
    }

    #[tokio::test]
    async fn clear_queues_rejects_waiters() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 1);
        assert!(pool.try_acquire("a", "m"));
        let waiter = pool.enqueue("a", "m", 0, None).unwrap();
        assert_eq!(pool.clear_queues(), 1);
        assert!(waiter.wait().await.is_err());
        assert_eq!(pool.snapshot()[0].reserved_for_queue, 0);
    }

    #[test]
    fn uncounted_release_does_not_touch_health() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 2);
        assert!(pool.try_acquire("a", "m"));
        pool.release_slot_uncounted("a", "m");
        let snap = &pool.snapshot()[0];
        assert_eq!(snap.active, 0);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[tokio::test]
    async fn queued_waiters_wait_out_rate_limit_cooldown() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock.clone(), 1);
        assert!(pool.try_acquire("a", "m"));
        let waiter = pool.enqueue("a", "m", 0, None).unwrap();

        pool.mark_rate_limit("a", "m", Some(5_000));
        pool.release_slot("a", "m", true);
        // Capacity is free but the cooldown gates queue admission.
        assert_eq!(pool.snapshot()[0].active, 0);
        assert_eq!(pool.snapshot()[0].reserved_for_queue, 1);

        clock.advance(5_001);
        pool.sweep();
        waiter.wait().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_active() {
        let clock = ManualClock::new(0);
        let pool = pool_with(clock, 1);
        assert!(pool.try_acquire("a", "m"));
        let waiter = pool.enqueue("a", "m", 0, None).unwrap();
        drop(waiter);
        pool.release_slot("a", "m", true);
        let snap = &pool.snapshot()[0];
        assert_eq!(snap.active, 0);
        assert_eq!(snap.reserved_for_queue, 0);
    }
}
