//! relay-llm: a reverse proxy and dispatch engine for LLM chat APIs.
//!
//! Requests enter through the OpenAI or Anthropic ingress routes, get
//! classified and routed to a `provider,model` pair, pass the per-model
//! capacity pool (circuit breaker, rate-limit cooldowns, priority queue),
//! optionally race against alternatives, and stream back through the SSE
//! relay with heartbeats, timeouts, and mid-stream reconnect.

pub mod classify;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod endpoint;
mod error;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod providers;
pub mod relay;
pub mod scenario;
pub mod selector;
pub mod sse;
pub mod transform;
pub mod upstream;

pub use classify::{ErrorClassifier, FamilyErrorTable, ProviderError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RelaySettings;
pub use context::RequestContext;
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use endpoint::EndpointGroups;
pub use error::{RelayError, Result};
pub use http::{RelayState, router};
pub use metrics::RequestTracker;
pub use pool::ModelPool;
pub use providers::{DialectFamily, ProviderConfig, ProviderRegistry};
pub use relay::{RelayConfig, SseRelay, StreamEnd};
pub use scenario::{Router as ScenarioRouter, ScenarioType};
pub use selector::{Candidate, ModelSelector};
