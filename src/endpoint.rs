//! Endpoint-level capacity groups. When several providers share one upstream
//! base URL the rate-limit pressure is per-endpoint, not per-model; this layer
//! mirrors the model pool's reservation protocol keyed by base URL and picks a
//! provider among the peers sharing it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::{
    CircuitBreakerConfig, EndpointRateLimitConfig, EndpointStrategy, RateLimitConfig,
};
use crate::pool::slot::SlotState;

pub struct EndpointGroups {
    groups: Mutex<HashMap<String, EndpointState>>,
    config: EndpointRateLimitConfig,
    breaker: CircuitBreakerConfig,
    rate_limit: RateLimitConfig,
    clock: Arc<dyn Clock>,
    reservation_seq: AtomicU64,
}

struct EndpointState {
    slot: SlotState,
    providers: BTreeSet<String>,
    rr_cursor: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointSnapshot {
    pub base_url: String,
    pub providers: Vec<String>,
    pub active: u32,
    pub reserved_confirm_pending: u32,
    pub max_concurrent: u32,
    pub rate_limited: bool,
    pub circuit_open: bool,
    pub failure_count: u32,
    pub success_count: u64,
}

impl EndpointGroups {
    pub fn new(
        config: EndpointRateLimitConfig,
        breaker: CircuitBreakerConfig,
        rate_limit: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            config,
            breaker,
            rate_limit,
            clock,
            reservation_seq: AtomicU64::new(1),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Register a provider as sharing the endpoint.
    pub fn register_provider(&self, base_url: &str, provider: &str) {
        let mut groups = self.groups.lock().expect("endpoint groups poisoned");
        let state = self.entry(&mut groups, base_url);
        state.providers.insert(provider.to_string());
    }

    fn entry<'a>(
        &self,
        groups: &'a mut HashMap<String, EndpointState>,
        base_url: &str,
    ) -> &'a mut EndpointState {
        groups
            .entry(base_url.to_string())
            .or_insert_with(|| EndpointState {
                slot: SlotState::new(
                    self.config.max_concurrent_per_endpoint,
                    self.rate_limit.default_retry_after_ms,
                ),
                providers: BTreeSet::new(),
                rr_cursor: 0,
            })
    }

    fn with_endpoint<T>(&self, base_url: &str, f: impl FnOnce(&mut EndpointState, u64) -> T) -> T {
        let now = self.clock.now_millis();
        let mut groups = self.groups.lock().expect("endpoint groups poisoned");
        let state = self.entry(&mut groups, base_url);
        f(state, now)
    }

    pub fn has_capacity(&self, base_url: &str) -> bool {
        self.with_endpoint(base_url, |state, now| {
            state.slot.refresh_circuit(now, &self.breaker);
            state.slot.admissible(now)
        })
    }

    pub fn reserve_slot(&self, base_url: &str, timeout_ms: u64) -> Option<u64> {
        self.with_endpoint(base_url, |state, now| {
            state.slot.expire_reservations(now);
            if state.slot.saturated() {
                return None;
            }
            let id = self.reservation_seq.fetch_add(1, Ordering::Relaxed);
            state.slot.reserved_confirm_pending += 1;
            state
                .slot
                .reservations
                .insert(id, now.saturating_add(timeout_ms));
            Some(id)
        })
    }

    pub fn confirm_slot(&self, base_url: &str, reservation_id: u64) -> bool {
        self.with_endpoint(base_url, |state, now| {
            state.slot.expire_reservations(now);
            if state.slot.reservations.remove(&reservation_id).is_none() {
                return false;
            }
            state.slot.reserved_confirm_pending =
                state.slot.reserved_confirm_pending.saturating_sub(1);
            state.slot.active += 1;
            state.slot.last_used_ms = now;
            true
        })
    }

    pub fn release_reservation(&self, base_url: &str, reservation_id: u64) {
        self.with_endpoint(base_url, |state, _now| {
            if state.slot.reservations.remove(&reservation_id).is_some() {
                state.slot.reserved_confirm_pending =
                    state.slot.reserved_confirm_pending.saturating_sub(1);
            }
        });
    }

    pub fn release_slot(&self, base_url: &str, success: bool) {
        self.with_endpoint(base_url, |state, now| {
            state.slot.active = state.slot.active.saturating_sub(1);
            if success {
                state.slot.record_success();
                state.slot.rate_limit_base_delay_ms = self.rate_limit.default_retry_after_ms;
            } else {
                state.slot.record_failure(now, &self.breaker);
            }
        });
    }

    pub fn release_slot_uncounted(&self, base_url: &str) {
        self.with_endpoint(base_url, |state, _now| {
            state.slot.active = state.slot.active.saturating_sub(1);
        });
    }

    pub fn mark_rate_limit(&self, base_url: &str, retry_after_ms: Option<u64>) {
        self.with_endpoint(base_url, |state, now| {
            state.slot.mark_rate_limit(now, retry_after_ms, &self.rate_limit);
        });
    }

    /// Pick a provider among the endpoint's peers. A preferred provider wins
    /// when it is registered; otherwise the configured strategy applies.
    pub fn select_provider(&self, base_url: &str, preferred: Option<&str>) -> Option<String> {
        self.with_endpoint(base_url, |state, _now| {
            if let Some(preferred) = preferred {
                if state.providers.contains(preferred) {
                    return Some(preferred.to_string());
                }
            }
            if state.providers.is_empty() {
                return None;
            }
            let names: Vec<&String> = state.providers.iter().collect();
            let picked = match self.config.strategy {
                EndpointStrategy::RoundRobin => {
                    let idx = state.rr_cursor % names.len();
                    state.rr_cursor = state.rr_cursor.wrapping_add(1);
                    names[idx].clone()
                }
                EndpointStrategy::LeastLoaded => {
                    // All peers share one counter set; fall back to the
                    // configured weights as a static load hint.
                    names
                        .iter()
                        .max_by_key(|name| {
                            self.config
                                .provider_weights
                                .get(name.as_str())
                                .copied()
                                .unwrap_or(1)
                        })
                        .map(|name| (*name).clone())
                        .unwrap_or_else(|| names[0].clone())
                }
                EndpointStrategy::Random => {
                    let seed = self.reservation_seq.fetch_add(1, Ordering::Relaxed);
                    let idx = (hash64_fnv1a(&seed.to_le_bytes()) as usize) % names.len();
                    names[idx].clone()
                }
            };
            Some(picked)
        })
    }

    pub fn sweep(&self) {
        let keys: Vec<String> = {
            let groups = self.groups.lock().expect("endpoint groups poisoned");
            groups.keys().cloned().collect()
        };
        for base_url in keys {
            self.with_endpoint(&base_url, |state, now| {
                state.slot.refresh_circuit(now, &self.breaker);
                state.slot.expire_reservations(now);
            });
        }
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let now = self.clock.now_millis();
        let groups = self.groups.lock().expect("endpoint groups poisoned");
        let mut out: Vec<EndpointSnapshot> = groups
            .iter()
            .map(|(base_url, state)| EndpointSnapshot {
                base_url: base_url.clone(),
                providers: state.providers.iter().cloned().collect(),
                active: state.slot.active,
                reserved_confirm_pending: state.slot.reserved_confirm_pending,
                max_concurrent: state.slot.max_concurrent,
                rate_limited: state.slot.is_rate_limited(now),
                circuit_open: state.slot.circuit_open,
                failure_count: state.slot.failure_count,
                success_count: state.slot.success_count,
            })
            .collect();
        out.sort_by(|a, b| a.base_url.cmp(&b.base_url));
        out
    }

    pub fn reset_circuit_breakers(&self) -> usize {
        let mut groups = self.groups.lock().expect("endpoint groups poisoned");
        let mut reset = 0;
        for state in groups.values_mut() {
            if state.slot.circuit_open {
                state.slot.circuit_open = false;
                state.slot.circuit_open_until_ms = 0;
                state.slot.failure_count = 0;
                reset += 1;
            }
        }
        reset
    }
}

/// FNV-1a, the deterministic pick used instead of a PRNG so endpoint
/// selection stays reproducible under test.
pub(crate) fn hash64_fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
