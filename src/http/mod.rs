//! HTTP surface: application state, route table, and the background ticker
//! that drives queue sweeps and metrics retention.

mod api;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};

use crate::clock::{Clock, SystemClock};
use crate::config::RelaySettings;
use crate::dispatch::Dispatcher;
use crate::endpoint::EndpointGroups;
use crate::metrics::RequestTracker;
use crate::pool::ModelPool;
use crate::providers::ProviderRegistry;
use crate::upstream::{HttpTransport, UpstreamTransport};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{seq}")
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct RelayState {
    pub settings: Arc<RelaySettings>,
    pub registry: Arc<ProviderRegistry>,
    pub pool: Arc<ModelPool>,
    pub endpoints: Arc<EndpointGroups>,
    pub tracker: Arc<RequestTracker>,
    pub dispatcher: Arc<Dispatcher>,
    _ticker: Arc<AbortOnDrop>,
}

impl RelayState {
    pub fn new(settings: RelaySettings) -> Self {
        let classifier = crate::classify::ErrorClassifier::with_builtin_tables(
            settings.error_tables.clone(),
        );
        Self::with_parts(
            settings,
            Arc::new(HttpTransport::new(classifier)),
            Arc::new(SystemClock),
        )
    }

    /// Construction seam used by tests to swap the transport and the clock.
    pub fn with_parts(
        settings: RelaySettings,
        transport: Arc<dyn UpstreamTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = Arc::new(settings);
        let registry = Arc::new(ProviderRegistry::new(settings.providers.clone()));
        let pool = Arc::new(ModelPool::new(settings.model_pool.clone(), clock.clone()));
        let endpoints = Arc::new(EndpointGroups::new(
            settings.endpoint_rate_limiting.clone(),
            settings.model_pool.circuit_breaker.clone(),
            settings.model_pool.rate_limit.clone(),
            clock.clone(),
        ));
        let tracker = Arc::new(RequestTracker::new(settings.metrics.clone(), clock.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            settings.clone(),
            registry.clone(),
            pool.clone(),
            endpoints.clone(),
            transport,
            tracker.clone(),
            clock,
        ));

        let ticker = {
            let pool = pool.clone();
            let endpoints = endpoints.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    pool.sweep();
                    endpoints.sweep();
                    tracker.sweep();
                }
            })
        };

        Self {
            settings,
            registry,
            pool,
            endpoints,
            tracker,
            dispatcher,
            _ticker: Arc::new(AbortOnDrop(ticker.abort_handle())),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/v1/messages", post(api::messages))
        .route("/v1/chat/completions", post(api::chat_completions))
        .route("/v1/models", get(api::models))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/metrics/recent", get(api::metrics_recent))
        .route("/model-pool/status", get(api::pool_status))
        .route("/model-pool/queue", get(api::pool_queue))
        .route("/model-pool/config", get(api::pool_config))
        .route(
            "/model-pool/reset-circuit-breakers",
            post(api::pool_reset_circuit_breakers),
        )
        .route("/model-pool/clear-queue", post(api::pool_clear_queue))
        .route("/endpoint-groups/status", get(api::endpoint_status))
        .route(
            "/endpoint-groups/reset-circuit-breakers",
            post(api::endpoint_reset_circuit_breakers),
        )
        .route("/providers", get(api::list_providers).post(api::upsert_provider))
        .route(
            "/providers/{id}",
            get(api::get_provider).delete(api::delete_provider),
        )
        .route("/providers/{id}/toggle", post(api::toggle_provider))
        .with_state(state)
}
