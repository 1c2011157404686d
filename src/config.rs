use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::classify::FamilyErrorTable;
use crate::providers::ProviderConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub model_pool: ModelPoolConfig,
    #[serde(default)]
    pub model_selector: SelectorConfig,
    #[serde(default)]
    pub endpoint_rate_limiting: EndpointRateLimitConfig,
    #[serde(default)]
    pub router: RouteTable,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub retry: UpstreamRetryConfig,
    #[serde(default)]
    pub error_tables: Vec<FamilyErrorTable>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

fn default_listen() -> String {
    "127.0.0.1:3456".to_string()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            providers: Vec::new(),
            model_pool: ModelPoolConfig::default(),
            model_selector: SelectorConfig::default(),
            endpoint_rate_limiting: EndpointRateLimitConfig::default(),
            router: RouteTable::default(),
            failover: FailoverConfig::default(),
            streaming: StreamingConfig::default(),
            retry: UpstreamRetryConfig::default(),
            error_tables: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelPoolConfig {
    #[serde(default = "default_max_concurrent_per_model")]
    pub max_concurrent_per_model: u32,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub priority_failover: bool,
}

fn default_max_concurrent_per_model() -> u32 {
    5
}

impl Default for ModelPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_model: default_max_concurrent_per_model(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            queue: QueueConfig::default(),
            priority_failover: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_period_ms")]
    pub cooldown_period_ms: u64,
    #[serde(default = "default_true")]
    pub test_request_after_cooldown: bool,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_period_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_period_ms: default_cooldown_period_ms(),
            test_request_after_cooldown: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_retry_after_ms")]
    pub default_retry_after_ms: u64,
    #[serde(default = "default_true")]
    pub respect_retry_after_header: bool,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_retry_after_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_retry_after_ms: default_retry_after_ms(),
            respect_retry_after_header: true,
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u32,
    #[serde(default = "default_true")]
    pub skip_rate_limited: bool,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_priority_levels() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
            priority_levels: default_priority_levels(),
            skip_rate_limited: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default)]
    pub enable_proactive_failover: bool,
    #[serde(default = "default_true")]
    pub enable_health_based_routing: bool,
    #[serde(default = "default_true")]
    pub enable_performance_based_routing: bool,
    #[serde(default = "default_true")]
    pub prefer_healthy_models: bool,
    #[serde(default = "default_max_parallel_alternatives")]
    pub max_parallel_alternatives: usize,
    #[serde(default)]
    pub score_weights: ScoreWeights,
}

fn default_max_parallel_alternatives() -> usize {
    2
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            enable_proactive_failover: false,
            enable_health_based_routing: true,
            enable_performance_based_routing: true,
            prefer_healthy_models: true,
            max_parallel_alternatives: default_max_parallel_alternatives(),
            score_weights: ScoreWeights::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_weight_capacity")]
    pub capacity: f64,
    #[serde(default = "default_weight_health")]
    pub health: f64,
    #[serde(default = "default_weight_performance")]
    pub performance: f64,
    #[serde(default = "default_weight_priority")]
    pub priority: f64,
}

fn default_weight_capacity() -> f64 {
    0.4
}

fn default_weight_health() -> f64 {
    0.3
}

fn default_weight_performance() -> f64 {
    0.2
}

fn default_weight_priority() -> f64 {
    0.1
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capacity: default_weight_capacity(),
            health: default_weight_health(),
            performance: default_weight_performance(),
            priority: default_weight_priority(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointRateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent_per_endpoint")]
    pub max_concurrent_per_endpoint: u32,
    #[serde(default)]
    pub strategy: EndpointStrategy,
    #[serde(default)]
    pub provider_weights: BTreeMap<String, u32>,
}

fn default_max_concurrent_per_endpoint() -> u32 {
    10
}

impl Default for EndpointRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent_per_endpoint: default_max_concurrent_per_endpoint(),
            strategy: EndpointStrategy::default(),
            provider_weights: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Random,
}

/// Scenario routing table. Each entry is a `provider,model` routing key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteTable {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub think: String,
    #[serde(default)]
    pub long_context: String,
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u64,
    #[serde(default)]
    pub web_search: String,
    #[serde(default)]
    pub image: String,
}

fn default_long_context_threshold() -> u64 {
    60_000
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            default: String::new(),
            background: String::new(),
            think: String::new(),
            long_context: String::new(),
            long_context_threshold: default_long_context_threshold(),
            web_search: String::new(),
            image: String::new(),
        }
    }
}

/// Failover alternatives, per provider plus a global tail. An entry is either
/// a bare provider name (the failing model is kept) or an explicit pair.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(flatten)]
    pub per_provider: BTreeMap<String, Vec<FailoverTarget>>,
    #[serde(default)]
    pub global: Vec<FailoverTarget>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FailoverTarget {
    Provider(String),
    Pair { provider: String, model: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub sse_heartbeat_interval_ms: u64,
    #[serde(default = "default_true")]
    pub sse_enable_keepalive: bool,
    #[serde(default = "default_backpressure_timeout_ms")]
    pub sse_backpressure_timeout_ms: u64,
    #[serde(default)]
    pub sse_enable_staggered_detection: bool,
    #[serde(default = "default_max_inter_chunk_delay_ms")]
    pub sse_max_inter_chunk_delay_ms: u64,
    #[serde(default = "default_min_token_rate")]
    pub sse_min_token_rate: f64,
    #[serde(default = "default_read_timeout_ms")]
    pub sse_read_timeout_ms: u64,
    #[serde(default = "default_sse_max_retries")]
    pub sse_max_retries: u32,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_backpressure_timeout_ms() -> u64 {
    60_000
}

fn default_max_inter_chunk_delay_ms() -> u64 {
    10_000
}

fn default_min_token_rate() -> f64 {
    5.0
}

fn default_read_timeout_ms() -> u64 {
    180_000
}

fn default_sse_max_retries() -> u32 {
    2
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            sse_heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sse_enable_keepalive: true,
            sse_backpressure_timeout_ms: default_backpressure_timeout_ms(),
            sse_enable_staggered_detection: false,
            sse_max_inter_chunk_delay_ms: default_max_inter_chunk_delay_ms(),
            sse_min_token_rate: default_min_token_rate(),
            sse_read_timeout_ms: default_read_timeout_ms(),
            sse_max_retries: default_sse_max_retries(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamRetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

impl Default for UpstreamRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            multiplier: default_retry_multiplier(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

fn default_retention_ms() -> u64 {
    3_600_000
}

fn default_max_records() -> usize {
    10_000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
            max_records: default_max_records(),
        }
    }
}
