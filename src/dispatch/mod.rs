//! Request dispatch: routing decision to slot admission, upstream call,
//! response transformation, failover, and bookkeeping.

mod race;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::classify::ProviderError;
use crate::clock::Clock;
use crate::config::RelaySettings;
use crate::context::RequestContext;
use crate::endpoint::EndpointGroups;
use crate::error::{RelayError, Result};
use crate::metrics::{RecordBuilder, RequestTracker};
use crate::pool::ModelPool;
use crate::providers::{DialectFamily, ProviderRegistry, SignerSpec};
use crate::relay::{RelayBodyStream, RelayConfig, SseRelay, StreamEnd, UpstreamByteStream};
use crate::scenario::Router;
use crate::selector::{Candidate, ModelSelector};
use crate::transform::TransformerSet;
use crate::upstream::{
    HeaderBuilder, UpstreamBody, UpstreamRequest, UpstreamTransport, with_retry,
};

/// How long a confirm-pending reservation may sit before its capacity is
/// reclaimed.
const RESERVATION_CONFIRM_TIMEOUT_MS: u64 = 10_000;

pub enum DispatchOutcome {
    Json(Value),
    Stream(RelayBodyStream),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutcome::Json(value) => f.debug_tuple("Json").field(value).finish(),
            DispatchOutcome::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

pub struct Dispatcher {
    settings: Arc<RelaySettings>,
    registry: Arc<ProviderRegistry>,
    pool: Arc<ModelPool>,
    endpoints: Arc<EndpointGroups>,
    selector: ModelSelector,
    router: Router,
    transformers: TransformerSet,
    transport: Arc<dyn UpstreamTransport>,
    tracker: Arc<RequestTracker>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<RelaySettings>,
        registry: Arc<ProviderRegistry>,
        pool: Arc<ModelPool>,
        endpoints: Arc<EndpointGroups>,
        transport: Arc<dyn UpstreamTransport>,
        tracker: Arc<RequestTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let selector = ModelSelector::new(settings.model_selector.clone());
        let router = Router::new(settings.router.clone(), settings.failover.clone());
        Self {
            settings,
            registry,
            pool,
            endpoints,
            selector,
            router,
            transformers: TransformerSet::with_builtins(),
            transport,
            tracker,
            clock,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Single entry point for one ingress request.
    pub async fn handle(
        &self,
        mut ctx: RequestContext,
        model_field: &str,
        payload: Value,
    ) -> Result<DispatchOutcome> {
        let span = info_span!(
            "dispatch",
            request_id = %ctx.request_id,
            model = model_field,
            scenario = tracing::field::Empty,
            provider = tracing::field::Empty,
        );
        async {
            let decision = self.router.resolve(model_field, &payload, ctx.priority)?;
            ctx.scenario = decision.scenario;
            ctx.is_custom_model = decision.is_custom_model;
            ctx.log_stage("routed", self.clock.now_millis());
            tracing::Span::current().record("scenario", decision.scenario.as_str());

            let mut builder =
                RecordBuilder::new(&ctx.request_id, ctx.scenario, self.clock.now_millis());

            // Selection and racing apply to every request; only the post-hoc
            // failover below is reserved for the custom-model alias.
            let (selected, race_candidates) = if self.selector.config().enable_proactive_failover {
                match self.selector.select(
                    &self.pool,
                    &decision.primary,
                    &decision.alternatives,
                    decision.scenario,
                    ctx.priority,
                ) {
                    Some(selection) if selection.should_race => {
                        ctx.should_race = true;
                        (selection.selected, selection.race_candidates)
                    }
                    Some(selection) => (selection.selected, Vec::new()),
                    // Everything disqualified; fall through to the primary so
                    // the queue (or the failover path) can absorb the burst.
                    None => (decision.primary.clone(), Vec::new()),
                }
            } else {
                (decision.primary.clone(), Vec::new())
            };
            tracing::Span::current().record("provider", selected.provider.as_str());
            builder.provider(&selected.provider, &selected.model);

            let cancel = CancellationToken::new();

            if ctx.should_race && !race_candidates.is_empty() {
                builder.raced();
                let mut field = vec![selected.clone()];
                field.extend(race_candidates);
                let outcome = self
                    .run_race(&ctx, &field, &payload, cancel.clone())
                    .await;
                return self.finish(builder, &ctx, outcome);
            }

            let outcome = self
                .single_path(&ctx, &selected, &payload, cancel.clone(), true)
                .await;

            let outcome = match outcome {
                Err(RelayError::Upstream(err))
                    if decision.is_custom_model && err.is_failover_eligible() =>
                {
                    let admissible: Vec<Candidate> = {
                        let pairs: Vec<(String, String)> = decision
                            .alternatives
                            .iter()
                            .map(|alt| (alt.provider.clone(), alt.model.clone()))
                            .collect();
                        self.pool
                            .get_available_alternatives(&pairs)
                            .into_iter()
                            .map(|(provider, model)| Candidate { provider, model })
                            .collect()
                    };
                    if admissible.is_empty() {
                        debug!("no admissible failover alternatives");
                        Err(RelayError::Upstream(err))
                    } else {
                        warn!(
                            failed_provider = %err.provider,
                            alternatives = admissible.len(),
                            "failover after primary failure"
                        );
                        builder.failover(1);
                        self.run_race(&ctx, &admissible, &payload, CancellationToken::new())
                            .await
                    }
                }
                other => other,
            };

            self.finish(builder, &ctx, outcome)
        }
        .instrument(span)
        .await
    }

    fn finish(
        &self,
        mut builder: RecordBuilder,
        _ctx: &RequestContext,
        outcome: Result<DispatchOutcome>,
    ) -> Result<DispatchOutcome> {
        let now = self.clock.now_millis();
        let record = match &outcome {
            Ok(_) => builder.finish(true, None, now),
            Err(err) => {
                let code = err.code().map(str::to_string);
                builder.finish(false, code, now)
            }
        };
        self.tracker.record(record);
        outcome
    }

    /// Reserve -> send -> transform for one candidate. `allow_queue` is true
    /// on the single path; racers fail fast instead of queueing.
    pub(crate) async fn single_path(
        &self,
        ctx: &RequestContext,
        candidate: &Candidate,
        payload: &Value,
        cancel: CancellationToken,
        allow_queue: bool,
    ) -> Result<DispatchOutcome> {
        let provider = self.registry.get(&candidate.provider)?;
        if !provider.enabled {
            return Err(RelayError::ProviderNotFound {
                name: candidate.provider.clone(),
            });
        }

        let mut ctx = ctx.clone();
        ctx.commit(candidate);

        let guard = self.admit(candidate, &provider.base_url, ctx.priority, allow_queue).await?;
        ctx.log_stage("admitted", self.clock.now_millis());

        let attempt = self
            .send_attempt(&ctx, candidate, &provider, payload, cancel)
            .await;

        match attempt {
            Ok(AttemptOutput::Json(value)) => {
                guard.complete(true);
                Ok(DispatchOutcome::Json(value))
            }
            Ok(AttemptOutput::Stream { first, parts }) => {
                Ok(DispatchOutcome::Stream(self.spawn_relay(&ctx, first, parts, guard)))
            }
            Err(err) => {
                if err.is_cancelled() {
                    drop(guard); // releases without blame
                    return Err(RelayError::Cancelled);
                }
                if err.is_rate_limit() {
                    self.pool.mark_rate_limit(
                        &candidate.provider,
                        &candidate.model,
                        err.retry_after_ms,
                    );
                    if guard.endpoint_engaged() {
                        self.endpoints
                            .mark_rate_limit(&provider.base_url, err.retry_after_ms);
                    }
                }
                guard.complete(false);
                Err(RelayError::Upstream(err))
            }
        }
    }

    /// Admission per the dispatcher-owned gating rule: health is filtered
    /// here (never inside `reserve_slot`), and saturation falls back to the
    /// priority queue. Endpoint and model reservations are independent and
    /// both confirmed.
    async fn admit(
        &self,
        candidate: &Candidate,
        base_url: &str,
        priority: i32,
        allow_queue: bool,
    ) -> Result<SlotGuard> {
        let provider = &candidate.provider;
        let model = &candidate.model;

        if self.pool.has_capacity(provider, model) {
            if let Some(reservation) =
                self.pool
                    .reserve_slot(provider, model, RESERVATION_CONFIRM_TIMEOUT_MS)
            {
                match self.take_endpoint_slot(provider, base_url) {
                    Ok(endpoint_engaged) => {
                        self.pool.confirm_slot(provider, model, reservation);
                        return Ok(SlotGuard::new(
                            self.pool.clone(),
                            self.endpoints.clone(),
                            candidate.clone(),
                            endpoint_engaged.then(|| base_url.to_string()),
                        ));
                    }
                    Err(err) => {
                        self.pool.release_reservation(provider, model, reservation);
                        return Err(err);
                    }
                }
            }
        }

        if !allow_queue {
            return Err(RelayError::NoCapacity {
                provider: provider.clone(),
                model: model.clone(),
            });
        }

        let waiter = self.pool.enqueue(provider, model, priority, None)?;
        waiter.wait().await?;
        // The waiter now owns one active unit on the model slot; the endpoint
        // reservation is still taken (and released) independently.
        match self.take_endpoint_slot(provider, base_url) {
            Ok(endpoint_engaged) => Ok(SlotGuard::new(
                self.pool.clone(),
                self.endpoints.clone(),
                candidate.clone(),
                endpoint_engaged.then(|| base_url.to_string()),
            )),
            Err(err) => {
                self.pool.release_slot_uncounted(provider, model);
                Err(err)
            }
        }
    }

    /// Reserve-and-confirm on the endpoint layer when enabled. Returns
    /// whether the endpoint layer is engaged for this request.
    fn take_endpoint_slot(&self, provider: &str, base_url: &str) -> Result<bool> {
        if !self.endpoints.enabled() {
            return Ok(false);
        }
        self.endpoints.register_provider(base_url, provider);
        match self
            .endpoints
            .reserve_slot(base_url, RESERVATION_CONFIRM_TIMEOUT_MS)
        {
            Some(reservation) => {
                self.endpoints.confirm_slot(base_url, reservation);
                Ok(true)
            }
            None => Err(RelayError::NoCapacity {
                provider: provider.to_string(),
                model: base_url.to_string(),
            }),
        }
    }

    /// Transform, build headers, and POST with the retry wrapper. Headers are
    /// rebuilt per attempt so signers re-sign inside the verification window.
    async fn send_attempt(
        &self,
        ctx: &RequestContext,
        candidate: &Candidate,
        provider: &crate::providers::ProviderConfig,
        payload: &Value,
        cancel: CancellationToken,
    ) -> std::result::Result<AttemptOutput, ProviderError> {
        let chain = self
            .transformers
            .chain_for(ctx.ingress, provider, &candidate.model)
            .map_err(|err| ProviderError {
                code: crate::classify::codes::INVALID_REQUEST.to_string(),
                message: err.to_string(),
                http_status: 400,
                retryable: false,
                retry_after_ms: None,
                provider: candidate.provider.clone(),
            })?;

        let (mut body, _chain_config) = chain.apply_request(payload.clone(), ctx).map_err(|err| {
            ProviderError {
                code: crate::classify::codes::INVALID_REQUEST.to_string(),
                message: err.to_string(),
                http_status: 400,
                retryable: false,
                retry_after_ms: None,
                provider: candidate.provider.clone(),
            }
        })?;
        // Gemini addresses the model in the URL; every other family carries
        // it in the body, overriding whatever alias the client sent.
        if provider.kind != DialectFamily::Gemini {
            if let Some(object) = body.as_object_mut() {
                object.insert("model".to_string(), Value::String(candidate.model.clone()));
            }
        }

        let api_key = self
            .registry
            .next_api_key(&candidate.provider)
            .unwrap_or_default();

        // Bypass auth hook, when the chain short-circuits.
        let auth = chain.bypass_auth(ctx, &api_key);
        if let Some(auth) = &auth {
            if let Some(mutation) = &auth.body_mutation {
                if let (Some(object), Some(delta)) = (body.as_object_mut(), mutation.as_object()) {
                    for (key, value) in delta {
                        object.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        let auth_headers = auth.map(|outcome| outcome.headers).unwrap_or_default();

        let parts = AttemptParts {
            url: request_url(&provider.base_url, provider.kind, &candidate.model, ctx.stream),
            body,
            provider: candidate.provider.clone(),
            family: provider.kind,
            custom_headers: provider.headers.clone(),
            signer: provider.signer.clone(),
            api_key,
            ctx: ctx.clone(),
            transport: self.transport.clone(),
            clock: self.clock.clone(),
            retry: self.settings.retry.clone(),
        };

        let response = with_retry(&parts.retry, |_attempt| {
            let parts = &parts;
            let auth_headers = auth_headers.clone();
            let cancel = cancel.clone();
            async move {
                let mut headers = parts.build_headers()?;
                for (name, value) in &auth_headers {
                    if let (Ok(name), Ok(value)) = (
                        reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                        reqwest::header::HeaderValue::from_str(value),
                    ) {
                        headers.insert(name, value);
                    }
                }
                parts
                    .transport
                    .send(UpstreamRequest {
                        url: parts.url.clone(),
                        headers,
                        body: parts.body.clone(),
                        stream: parts.ctx.stream,
                        provider: parts.provider.clone(),
                        family: parts.family,
                        cancel,
                    })
                    .await
            }
        })
        .await?;

        match response.body {
            UpstreamBody::Json(value) => {
                let value = chain.apply_response(value, ctx).map_err(|err| ProviderError {
                    code: crate::classify::codes::PROVIDER_RESPONSE_ERROR.to_string(),
                    message: err.to_string(),
                    http_status: 502,
                    retryable: false,
                    retry_after_ms: None,
                    provider: candidate.provider.clone(),
                })?;
                Ok(AttemptOutput::Json(value))
            }
            UpstreamBody::Stream(stream) => Ok(AttemptOutput::Stream {
                first: stream,
                parts,
            }),
        }
    }

    /// Wire a winning stream attempt into the SSE relay. The slot guard moves
    /// into the relay's end-of-stream hook so release tracks the true stream
    /// disposition; iflow status comes from the committed context.
    fn spawn_relay(
        &self,
        ctx: &RequestContext,
        first: UpstreamByteStream,
        parts: AttemptParts,
        guard: SlotGuard,
    ) -> RelayBodyStream {
        let config = RelayConfig::from_settings(&self.settings.streaming, ctx.scenario);
        let cancel = CancellationToken::new();

        let reissue_parts = Arc::new(parts);
        let reissue = {
            let parts = reissue_parts.clone();
            let cancel = cancel.clone();
            Box::new(move |_attempt: u32| {
                let parts = parts.clone();
                let cancel = cancel.clone();
                Box::pin(async move {
                    let headers = parts.build_headers()?;
                    let response = parts
                        .transport
                        .send(UpstreamRequest {
                            url: parts.url.clone(),
                            headers,
                            body: parts.body.clone(),
                            stream: true,
                            provider: parts.provider.clone(),
                            family: parts.family,
                            cancel,
                        })
                        .await?;
                    match response.body {
                        UpstreamBody::Stream(stream) => Ok(stream),
                        UpstreamBody::Json(_) => Err(ProviderError {
                            code: crate::classify::codes::PROVIDER_RESPONSE_ERROR.to_string(),
                            message: "reissued upstream did not stream".to_string(),
                            http_status: 502,
                            retryable: false,
                            retry_after_ms: None,
                            provider: parts.provider.clone(),
                        }),
                    }
                })
                    as std::pin::Pin<
                        Box<
                            dyn std::future::Future<
                                    Output = std::result::Result<UpstreamByteStream, ProviderError>,
                                > + Send,
                        >,
                    >
            })
        };

        let relay = SseRelay {
            upstream: first,
            reissue: Some(reissue),
            config,
            cancel,
            on_staggered: None,
        };
        relay.spawn(move |end| match end {
            StreamEnd::Completed => guard.complete(true),
            StreamEnd::Error => guard.complete(false),
            StreamEnd::Aborted | StreamEnd::Disconnected => drop(guard),
        })
    }
}

pub(crate) enum AttemptOutput {
    Json(Value),
    Stream {
        first: UpstreamByteStream,
        parts: AttemptParts,
    },
}

/// Everything needed to rebuild (and re-sign) the upstream request, for
/// retries and mid-stream reconnects.
pub(crate) struct AttemptParts {
    url: String,
    body: Value,
    provider: String,
    family: DialectFamily,
    custom_headers: BTreeMap<String, String>,
    signer: Option<SignerSpec>,
    api_key: String,
    ctx: RequestContext,
    transport: Arc<dyn UpstreamTransport>,
    clock: Arc<dyn Clock>,
    retry: crate::config::UpstreamRetryConfig,
}

impl AttemptParts {
    fn build_headers(&self) -> std::result::Result<reqwest::header::HeaderMap, ProviderError> {
        HeaderBuilder::new(
            self.family,
            &self.api_key,
            &self.ctx,
            &self.custom_headers,
            self.signer.as_ref(),
        )
        .build(self.clock.now_millis())
        .map_err(|err| ProviderError {
            code: crate::classify::codes::INVALID_REQUEST.to_string(),
            message: err.to_string(),
            http_status: 400,
            retryable: false,
            retry_after_ms: None,
            provider: self.provider.clone(),
        })
    }
}

fn request_url(base_url: &str, family: DialectFamily, model: &str, stream: bool) -> String {
    let base = base_url.trim_end_matches('/');
    match family {
        DialectFamily::Anthropic => format!("{base}/messages"),
        DialectFamily::Gemini => {
            if stream {
                format!("{base}/models/{model}:streamGenerateContent?alt=sse")
            } else {
                format!("{base}/models/{model}:generateContent")
            }
        }
        DialectFamily::Openai | DialectFamily::Iflow => format!("{base}/chat/completions"),
    }
}

/// Owns one active unit on the model slot (and optionally one on the
/// endpoint slot). Dropping without `complete` releases without blame, which
/// is exactly the cancellation semantics races need.
pub(crate) struct SlotGuard {
    pool: Arc<ModelPool>,
    endpoints: Arc<EndpointGroups>,
    candidate: Candidate,
    endpoint_url: Option<String>,
    done: bool,
}

impl SlotGuard {
    fn new(
        pool: Arc<ModelPool>,
        endpoints: Arc<EndpointGroups>,
        candidate: Candidate,
        endpoint_url: Option<String>,
    ) -> Self {
        Self {
            pool,
            endpoints,
            candidate,
            endpoint_url,
            done: false,
        }
    }

    fn endpoint_engaged(&self) -> bool {
        self.endpoint_url.is_some()
    }

    fn complete(mut self, success: bool) {
        self.pool
            .release_slot(&self.candidate.provider, &self.candidate.model, success);
        if let Some(url) = &self.endpoint_url {
            self.endpoints.release_slot(url, success);
        }
        self.done = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.pool
            .release_slot_uncounted(&self.candidate.provider, &self.candidate.model);
        if let Some(url) = &self.endpoint_url {
            self.endpoints.release_slot_uncounted(url);
        }
    }
}
