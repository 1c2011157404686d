//! Request tracker: append-only per-request records with windowed
//! aggregation and a retention sweep run by the background ticker.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::config::MetricsConfig;
use crate::scenario::ScenarioType;

#[derive(Clone, Debug, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub scenario: &'static str,
    pub success: bool,
    pub had_failover: bool,
    pub failover_attempts: u32,
    pub raced: bool,
    pub latency_ms: u64,
    pub start_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub failovers: u64,
    pub races: u64,
    pub avg_latency_ms: u64,
    pub by_provider: Vec<ProviderSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProviderSummary {
    pub provider: String,
    pub total: u64,
    pub succeeded: u64,
}

pub struct RequestTracker {
    records: Mutex<VecDeque<RequestRecord>>,
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
}

impl RequestTracker {
    pub fn new(config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            config,
            clock,
        }
    }

    pub fn record(&self, record: RequestRecord) {
        let mut records = self.records.lock().expect("tracker poisoned");
        records.push_back(record);
        // Size cap enforced inline; age-based eviction belongs to the sweep.
        while records.len() > self.config.max_records {
            records.pop_front();
        }
    }

    /// Evict records older than the retention window. Records are appended in
    /// start order, so eviction pops from the front.
    pub fn sweep(&self) {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(self.config.retention_ms);
        let mut records = self.records.lock().expect("tracker poisoned");
        while records
            .front()
            .is_some_and(|record| record.start_ms < cutoff)
        {
            records.pop_front();
        }
    }

    pub fn aggregate(&self, window_ms: Option<u64>, provider: Option<&str>) -> MetricsSummary {
        let now = self.clock.now_millis();
        let cutoff = window_ms.map(|window| now.saturating_sub(window));
        let records = self.records.lock().expect("tracker poisoned");

        let mut summary = MetricsSummary::default();
        let mut latency_total: u64 = 0;
        let mut providers: Vec<ProviderSummary> = Vec::new();

        for record in records.iter() {
            if cutoff.is_some_and(|cutoff| record.start_ms < cutoff) {
                continue;
            }
            if provider.is_some_and(|name| record.provider != name) {
                continue;
            }
            summary.total += 1;
            if record.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if record.had_failover {
                summary.failovers += 1;
            }
            if record.raced {
                summary.races += 1;
            }
            latency_total += record.latency_ms;

            match providers
                .iter_mut()
                .find(|entry| entry.provider == record.provider)
            {
                Some(entry) => {
                    entry.total += 1;
                    if record.success {
                        entry.succeeded += 1;
                    }
                }
                None => providers.push(ProviderSummary {
                    provider: record.provider.clone(),
                    total: 1,
                    succeeded: u64::from(record.success),
                }),
            }
        }

        if summary.total > 0 {
            summary.avg_latency_ms = latency_total / summary.total;
        }
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));
        summary.by_provider = providers;
        summary
    }

    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        let records = self.records.lock().expect("tracker poisoned");
        records.iter().rev().take(limit).cloned().collect()
    }
}

/// Builder used by the dispatcher while a request is in flight.
pub struct RecordBuilder {
    record: RequestRecord,
}

impl RecordBuilder {
    pub fn new(request_id: &str, scenario: ScenarioType, start_ms: u64) -> Self {
        Self {
            record: RequestRecord {
                request_id: request_id.to_string(),
                provider: String::new(),
                model: String::new(),
                scenario: scenario.as_str(),
                success: false,
                had_failover: false,
                failover_attempts: 0,
                raced: false,
                latency_ms: 0,
                start_ms,
                error_code: None,
            },
        }
    }

    pub fn provider(&mut self, provider: &str, model: &str) -> &mut Self {
        self.record.provider = provider.to_string();
        self.record.model = model.to_string();
        self
    }

    pub fn raced(&mut self) -> &mut Self {
        self.record.raced = true;
        self
    }

    pub fn failover(&mut self, attempts: u32) -> &mut Self {
        self.record.had_failover = true;
        self.record.failover_attempts = attempts;
        self
    }

    pub fn finish(mut self, success: bool, error_code: Option<String>, now_ms: u64) -> RequestRecord {
        self.record.success = success;
        self.record.error_code = error_code;
        self.record.latency_ms = now_ms.saturating_sub(self.record.start_ms);
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn record(start_ms: u64, provider: &str, success: bool) -> RequestRecord {
        RequestRecord {
            request_id: format!("req-{start_ms}"),
            provider: provider.to_string(),
            model: "m".to_string(),
            scenario: "default",
            success,
            had_failover: false,
            failover_attempts: 0,
            raced: false,
            latency_ms: 100,
            start_ms,
            error_code: None,
        }
    }

    #[test]
    fn aggregate_filters_by_window_and_provider() {
        let clock = ManualClock::new(100_000);
        let tracker = RequestTracker::new(MetricsConfig::default(), clock);
        tracker.record(record(10_000, "a", true));
        tracker.record(record(95_000, "a", false));
        tracker.record(record(96_000, "b", true));

        let all = tracker.aggregate(None, None);
        assert_eq!(all.total, 3);
        assert_eq!(all.succeeded, 2);

        let windowed = tracker.aggregate(Some(10_000), None);
        assert_eq!(windowed.total, 2);

        let provider_a = tracker.aggregate(None, Some("a"));
        assert_eq!(provider_a.total, 2);
        assert_eq!(provider_a.succeeded, 1);
    }

    #[test]
    fn sweep_evicts_past_retention() {
        let clock = ManualClock::new(0);
        let tracker = RequestTracker::new(
            MetricsConfig {
                retention_ms: 1_000,
                max_records: 100,
            },
            clock.clone(),
        );
        tracker.record(record(0, "a", true));
        tracker.record(record(500, "a", true));
        clock.set(1_200);
        tracker.sweep();
        assert_eq!(tracker.aggregate(None, None).total, 1);
    }

    #[test]
    fn size_cap_drops_oldest() {
        let clock = ManualClock::new(0);
        let tracker = RequestTracker::new(
            MetricsConfig {
                retention_ms: 60_000,
                max_records: 2,
            },
            clock,
        );
        tracker.record(record(1, "a", true));
        tracker.record(record(2, "a", true));
        tracker.record(record(3, "a", true));
        let recent = tracker.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].start_ms, 3);
    }
}
