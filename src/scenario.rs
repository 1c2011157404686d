//! Request classification and route resolution: scenario detection, the
//! `provider,model` routing key, and the failover alternative plan.

use serde::Serialize;
use serde_json::Value;

use crate::config::{FailoverConfig, FailoverTarget, RouteTable};
use crate::error::{RelayError, Result};
use crate::selector::Candidate;

pub const CUSTOM_MODEL: &str = "custom-model";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScenarioType {
    #[default]
    Default,
    Background,
    Think,
    LongContext,
    WebSearch,
}

impl ScenarioType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioType::Default => "default",
            ScenarioType::Background => "background",
            ScenarioType::Think => "think",
            ScenarioType::LongContext => "longContext",
            ScenarioType::WebSearch => "webSearch",
        }
    }
}

/// Outcome of routing one ingress request.
#[derive(Clone, Debug)]
pub struct RouteDecision {
    pub scenario: ScenarioType,
    pub primary: Candidate,
    pub alternatives: Vec<Candidate>,
    pub is_custom_model: bool,
}

pub struct Router {
    routes: RouteTable,
    failover: FailoverConfig,
}

impl Router {
    pub fn new(routes: RouteTable, failover: FailoverConfig) -> Self {
        Self { routes, failover }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Classify the request body into a scenario. Priority of signals:
    /// explicit thinking beats web search beats long context; a low-priority
    /// tag demotes to background only when nothing stronger matched.
    pub fn classify(&self, body: &Value, priority: i32) -> ScenarioType {
        if body.get("thinking").is_some_and(|v| !v.is_null())
            || body.get("reasoning").is_some_and(|v| !v.is_null())
        {
            return ScenarioType::Think;
        }
        if has_web_search_tool(body) {
            return ScenarioType::WebSearch;
        }
        if estimate_tokens(body) > self.routes.long_context_threshold {
            return ScenarioType::LongContext;
        }
        if priority < 0 {
            return ScenarioType::Background;
        }
        ScenarioType::Default
    }

    /// Resolve the `model` field into a routing decision. `custom-model` (or
    /// a bare alias without a comma) goes through the scenario table and is
    /// failover-eligible; an explicit `provider,model` key is taken verbatim.
    pub fn resolve(&self, model_field: &str, body: &Value, priority: i32) -> Result<RouteDecision> {
        let scenario = self.classify(body, priority);

        if let Some((provider, model)) = split_routing_key(model_field) {
            let primary = Candidate::new(provider, model);
            let alternatives = self.alternatives_for(&primary);
            return Ok(RouteDecision {
                scenario,
                primary,
                alternatives,
                is_custom_model: false,
            });
        }

        if model_field != CUSTOM_MODEL {
            return Err(RelayError::InvalidRequest {
                reason: format!(
                    "model must be `{CUSTOM_MODEL}` or `<provider>,<model>`, got `{model_field}`"
                ),
            });
        }

        let key = self.route_for(scenario);
        let (provider, model) =
            split_routing_key(key).ok_or_else(|| RelayError::InvalidRequest {
                reason: format!(
                    "router table has no `provider,model` route for scenario {}",
                    scenario.as_str()
                ),
            })?;
        let primary = Candidate::new(provider, model);
        let alternatives = self.alternatives_for(&primary);
        Ok(RouteDecision {
            scenario,
            primary,
            alternatives,
            is_custom_model: true,
        })
    }

    fn route_for(&self, scenario: ScenarioType) -> &str {
        let route = match scenario {
            ScenarioType::Default => &self.routes.default,
            ScenarioType::Background => &self.routes.background,
            ScenarioType::Think => &self.routes.think,
            ScenarioType::LongContext => &self.routes.long_context,
            ScenarioType::WebSearch => &self.routes.web_search,
        };
        if route.is_empty() {
            &self.routes.default
        } else {
            route
        }
    }

    /// Failover plan: per-provider entries first, then the global tail.
    /// Bare provider names inherit the primary's model. The primary itself
    /// and duplicates are dropped.
    pub fn alternatives_for(&self, primary: &Candidate) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::new();
        let mut push = |candidate: Candidate| {
            if candidate != *primary && !out.contains(&candidate) {
                out.push(candidate);
            }
        };

        if let Some(targets) = self.failover.per_provider.get(&primary.provider) {
            for target in targets {
                push(target_candidate(target, &primary.model));
            }
        }
        for target in &self.failover.global {
            push(target_candidate(target, &primary.model));
        }
        out
    }
}

fn target_candidate(target: &FailoverTarget, inherited_model: &str) -> Candidate {
    match target {
        FailoverTarget::Provider(name) => Candidate::new(name.clone(), inherited_model),
        FailoverTarget::Pair { provider, model } => Candidate::new(provider.clone(), model.clone()),
    }
}

pub fn split_routing_key(key: &str) -> Option<(&str, &str)> {
    let (provider, model) = key.split_once(',')?;
    let provider = provider.trim();
    let model = model.trim();
    if provider.is_empty() || model.is_empty() {
        return None;
    }
    Some((provider, model))
}

fn has_web_search_tool(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| {
            tools.iter().any(|tool| {
                tool.get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.starts_with("web_search"))
            })
        })
}

/// Cheap token estimate: explicit counts when present, otherwise a bytes/4
/// heuristic over the serialized messages.
fn estimate_tokens(body: &Value) -> u64 {
    if let Some(tokens) = body.get("input_tokens").and_then(Value::as_u64) {
        return tokens;
    }
    let messages_bytes = body
        .get("messages")
        .map(|messages| messages.to_string().len())
        .unwrap_or(0);
    let system_bytes = body
        .get("system")
        .map(|system| system.to_string().len())
        .unwrap_or(0);
    ((messages_bytes + system_bytes) / 4) as u64
}
