//! Dispatcher behavior against a scripted upstream transport: failover
//! racing, queueing under saturation, rate-limit marking, and stream
//! slot accounting.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Value, json};

use relay_llm::classify::{ProviderError, codes};
use relay_llm::config::{FailoverTarget, RelaySettings};
use relay_llm::context::RequestContext;
use relay_llm::dispatch::DispatchOutcome;
use relay_llm::providers::{DialectFamily, ProviderConfig, TransformerSpec};
use relay_llm::upstream::{UpstreamBody, UpstreamRequest, UpstreamResponse, UpstreamTransport};
use relay_llm::{RelayError, RelayState, SystemClock};

#[derive(Clone)]
enum Behavior {
    Json { delay: Duration, body: Value },
    Fail(ProviderError),
    Stream { frames: Vec<&'static str> },
}

struct FakeTransport {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn new(behaviors: HashMap<String, Behavior>) -> Self {
        Self {
            behaviors,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamTransport for FakeTransport {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProviderError> {
        self.calls.lock().unwrap().push(request.provider.clone());
        match self
            .behaviors
            .get(&request.provider)
            .cloned()
            .expect("behavior for provider")
        {
            Behavior::Json { delay, body } => {
                tokio::select! {
                    _ = request.cancel.cancelled() => {
                        Err(ProviderError::cancelled(&request.provider))
                    }
                    _ = tokio::time::sleep(delay) => Ok(UpstreamResponse {
                        status: 200,
                        body: UpstreamBody::Json(body),
                    }),
                }
            }
            Behavior::Fail(err) => Err(err),
            Behavior::Stream { frames } => {
                let chunks: Vec<std::io::Result<Bytes>> = frames
                    .into_iter()
                    .map(|frame| Ok(Bytes::from(format!("data: {frame}\n\n"))))
                    .collect();
                Ok(UpstreamResponse {
                    status: 200,
                    body: UpstreamBody::Stream(stream::iter(chunks).boxed()),
                })
            }
        }
    }
}

fn provider(name: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        kind: DialectFamily::Openai,
        base_url: format!("https://{name}.example.com/v1"),
        api_keys: vec![format!("{name}-key")],
        models: vec!["m".to_string()],
        headers: BTreeMap::new(),
        transformer: TransformerSpec::default(),
        enabled: true,
        signer: None,
    }
}

fn settings() -> RelaySettings {
    let mut settings = RelaySettings::default();
    settings.providers = vec![provider("pa"), provider("pb"), provider("pc")];
    settings.router.default = "pa,m".to_string();
    settings.failover.per_provider.insert(
        "pa".to_string(),
        vec![
            FailoverTarget::Provider("pb".to_string()),
            FailoverTarget::Provider("pc".to_string()),
        ],
    );
    settings.retry.max_attempts = 2;
    settings.retry.base_delay_ms = 1;
    settings
}

fn rate_limited(provider: &str) -> ProviderError {
    ProviderError {
        code: codes::RATE_LIMIT.to_string(),
        message: "slow down".to_string(),
        http_status: 429,
        retryable: true,
        retry_after_ms: Some(60_000),
        provider: provider.to_string(),
    }
}

fn state_with(
    settings: RelaySettings,
    behaviors: HashMap<String, Behavior>,
) -> (RelayState, std::sync::Arc<FakeTransport>) {
    let transport = std::sync::Arc::new(FakeTransport::new(behaviors));
    let state = RelayState::with_parts(
        settings,
        transport.clone(),
        std::sync::Arc::new(SystemClock),
    );
    (state, transport)
}

fn ctx(request_id: &str) -> RequestContext {
    RequestContext::new(request_id.to_string(), DialectFamily::Openai, 0)
}

#[tokio::test]
async fn custom_model_failover_races_alternatives_and_fastest_wins() {
    let mut behaviors = HashMap::new();
    behaviors.insert("pa".to_string(), Behavior::Fail(rate_limited("pa")));
    behaviors.insert(
        "pb".to_string(),
        Behavior::Json {
            delay: Duration::from_millis(20),
            body: json!({"winner": "pb"}),
        },
    );
    behaviors.insert(
        "pc".to_string(),
        Behavior::Json {
            delay: Duration::from_millis(200),
            body: json!({"winner": "pc"}),
        },
    );
    let (state, _transport) = state_with(settings(), behaviors);

    let outcome = state
        .dispatcher
        .handle(ctx("r1"), "custom-model", json!({"messages": []}))
        .await
        .unwrap();
    let DispatchOutcome::Json(body) = outcome else {
        panic!("expected JSON outcome");
    };
    assert_eq!(body["winner"], "pb");

    // The failing primary is rate-limit cooled and blamed; racers leave no
    // residual capacity claims; the cancelled loser is not blamed.
    let snapshot = state.pool.snapshot();
    for slot in &snapshot {
        assert_eq!(slot.active, 0, "{} should be drained", slot.provider);
        assert_eq!(slot.reserved_confirm_pending, 0);
        assert_eq!(slot.reserved_for_queue, 0);
    }
    let pa = snapshot.iter().find(|s| s.provider == "pa").unwrap();
    assert!(pa.rate_limited);
    assert_eq!(pa.failure_count, 1);
    let pb = snapshot.iter().find(|s| s.provider == "pb").unwrap();
    assert_eq!(pb.success_count, 1);
    let pc = snapshot.iter().find(|s| s.provider == "pc").unwrap();
    assert_eq!(pc.success_count, 0);
    assert_eq!(pc.failure_count, 0);

    let summary = state.tracker.aggregate(None, None);
    assert_eq!(summary.failovers, 1);
    assert_eq!(summary.succeeded, 1);
    let recent = state.tracker.recent(1);
    assert!(recent[0].had_failover);
    assert_eq!(recent[0].failover_attempts, 1);
}

#[tokio::test]
async fn explicit_routing_key_gets_no_failover() {
    let mut behaviors = HashMap::new();
    behaviors.insert("pa".to_string(), Behavior::Fail(rate_limited("pa")));
    behaviors.insert(
        "pb".to_string(),
        Behavior::Json {
            delay: Duration::ZERO,
            body: json!({"winner": "pb"}),
        },
    );
    behaviors.insert(
        "pc".to_string(),
        Behavior::Json {
            delay: Duration::ZERO,
            body: json!({"winner": "pc"}),
        },
    );
    let (state, transport) = state_with(settings(), behaviors);

    let err = state
        .dispatcher
        .handle(ctx("r2"), "pa,m", json!({"messages": []}))
        .await
        .unwrap_err();
    match err {
        RelayError::Upstream(upstream) => assert_eq!(upstream.http_status, 429),
        other => panic!("unexpected error: {other}"),
    }

    // Only the primary was ever called, retried by the wrapper.
    assert!(transport.calls().iter().all(|name| name == "pa"));
    assert!(state.pool.snapshot()[0].rate_limited);
}

#[tokio::test]
async fn explicit_key_degraded_primary_reranks_to_healthy_alternative() {
    let mut config = settings();
    config.model_selector.enable_proactive_failover = true;
    let mut behaviors = HashMap::new();
    behaviors.insert("pa".to_string(), Behavior::Fail(rate_limited("pa")));
    behaviors.insert(
        "pb".to_string(),
        Behavior::Json {
            delay: Duration::ZERO,
            body: json!({"winner": "pb"}),
        },
    );
    let (state, transport) = state_with(config, behaviors);

    // Burn the primary's health score below the race threshold without
    // tripping the breaker.
    for _ in 0..4 {
        assert!(state.pool.try_acquire("pa", "m"));
        state.pool.release_slot("pa", "m", false);
    }

    // Explicitly addressed requests still go through selection: the healthy
    // alternative outranks the degraded primary and takes the call.
    let outcome = state
        .dispatcher
        .handle(ctx("r10"), "pa,m", json!({"messages": []}))
        .await
        .unwrap();
    let DispatchOutcome::Json(body) = outcome else {
        panic!("expected JSON outcome");
    };
    assert_eq!(body["winner"], "pb");
    assert_eq!(transport.calls(), vec!["pb".to_string()]);
}

#[tokio::test]
async fn explicit_key_degraded_primary_races_when_it_keeps_its_seat() {
    let mut config = settings();
    config.model_selector.enable_proactive_failover = true;
    config.model_selector.prefer_healthy_models = false;
    let mut behaviors = HashMap::new();
    behaviors.insert("pa".to_string(), Behavior::Fail(rate_limited("pa")));
    behaviors.insert(
        "pb".to_string(),
        Behavior::Json {
            delay: Duration::from_millis(20),
            body: json!({"winner": "pb"}),
        },
    );
    behaviors.insert(
        "pc".to_string(),
        Behavior::Json {
            delay: Duration::from_millis(200),
            body: json!({"winner": "pc"}),
        },
    );
    let (state, _transport) = state_with(config, behaviors);

    for _ in 0..4 {
        assert!(state.pool.try_acquire("pa", "m"));
        state.pool.release_slot("pa", "m", false);
    }

    // The primary keeps its seat (health preference off) but its score sits
    // below 70, so the request races the alternatives; the fastest healthy
    // racer wins while the primary's failure is recorded.
    let outcome = state
        .dispatcher
        .handle(ctx("r11"), "pa,m", json!({"messages": []}))
        .await
        .unwrap();
    let DispatchOutcome::Json(body) = outcome else {
        panic!("expected JSON outcome");
    };
    assert_eq!(body["winner"], "pb");

    let snapshot = state.pool.snapshot();
    for slot in &snapshot {
        assert_eq!(slot.active, 0, "{} should be drained", slot.provider);
        assert_eq!(slot.reserved_confirm_pending, 0);
    }
    let pa = snapshot.iter().find(|s| s.provider == "pa").unwrap();
    assert!(pa.rate_limited);
    let pb = snapshot.iter().find(|s| s.provider == "pb").unwrap();
    assert_eq!(pb.success_count, 1);

    let summary = state.tracker.aggregate(None, None);
    assert_eq!(summary.races, 1);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn saturated_slot_queues_then_admits() {
    let mut config = settings();
    config.model_pool.max_concurrent_per_model = 1;
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "pa".to_string(),
        Behavior::Json {
            delay: Duration::from_millis(50),
            body: json!({"ok": true}),
        },
    );
    let (state, transport) = state_with(config, behaviors);

    let first = state
        .dispatcher
        .handle(ctx("r3"), "pa,m", json!({"messages": []}));
    let second = state
        .dispatcher
        .handle(ctx("r4"), "pa,m", json!({"messages": []}));
    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(transport.calls().len(), 2);

    let slot = &state.pool.snapshot()[0];
    assert_eq!(slot.active, 0);
    assert_eq!(slot.success_count, 2);
}

#[tokio::test]
async fn full_queue_rejects_with_queue_full() {
    let mut config = settings();
    config.model_pool.max_concurrent_per_model = 1;
    config.model_pool.queue.max_queue_size = 0;
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "pa".to_string(),
        Behavior::Json {
            delay: Duration::from_millis(100),
            body: json!({"ok": true}),
        },
    );
    let (state, _transport) = state_with(config, behaviors);

    let holder = {
        let state = state.clone();
        tokio::spawn(async move {
            state
                .dispatcher
                .handle(ctx("r5"), "pa,m", json!({"messages": []}))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = state
        .dispatcher
        .handle(ctx("r6"), "pa,m", json!({"messages": []}))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::QueueFull { .. }));
    assert!(holder.await.unwrap().is_ok());
}

#[tokio::test]
async fn all_alternatives_failing_surfaces_all_attempts_failed() {
    let mut behaviors = HashMap::new();
    behaviors.insert("pa".to_string(), Behavior::Fail(rate_limited("pa")));
    behaviors.insert("pb".to_string(), Behavior::Fail(rate_limited("pb")));
    behaviors.insert("pc".to_string(), Behavior::Fail(rate_limited("pc")));
    let (state, _transport) = state_with(settings(), behaviors);

    let err = state
        .dispatcher
        .handle(ctx("r7"), "custom-model", json!({"messages": []}))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::AllAttemptsFailed));

    let summary = state.tracker.aggregate(None, None);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn stream_outcome_releases_slot_after_relay_completes() {
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "pa".to_string(),
        Behavior::Stream {
            frames: vec!["one", "two", "[DONE]"],
        },
    );
    let (state, _transport) = state_with(settings(), behaviors);

    let mut ctx = ctx("r8");
    ctx.stream = true;
    let outcome = state
        .dispatcher
        .handle(ctx, "pa,m", json!({"messages": [], "stream": true}))
        .await
        .unwrap();
    let DispatchOutcome::Stream(mut body) = outcome else {
        panic!("expected stream outcome");
    };

    let mut frames = Vec::new();
    while let Some(frame) = body.next().await {
        frames.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
    }
    assert_eq!(frames.len(), 3);
    assert!(frames[0].contains("one"));

    // Slot release rides the relay's end-of-stream hook.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let slot = &state.pool.snapshot()[0];
    assert_eq!(slot.active, 0);
    assert_eq!(slot.success_count, 1);
}

#[tokio::test]
async fn endpoint_layer_reservations_follow_the_model_layer() {
    let mut config = settings();
    config.endpoint_rate_limiting.enabled = true;
    config.endpoint_rate_limiting.max_concurrent_per_endpoint = 4;
    let mut behaviors = HashMap::new();
    behaviors.insert(
        "pa".to_string(),
        Behavior::Json {
            delay: Duration::ZERO,
            body: json!({"ok": true}),
        },
    );
    let (state, _transport) = state_with(config, behaviors);

    state
        .dispatcher
        .handle(ctx("r9"), "pa,m", json!({"messages": []}))
        .await
        .unwrap();

    let endpoints = state.endpoints.snapshot();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].active, 0);
    assert_eq!(endpoints[0].success_count, 1);
    assert_eq!(endpoints[0].providers, vec!["pa".to_string()]);
}
