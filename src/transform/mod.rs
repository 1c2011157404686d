//! Dialect transformer chain. A transformer is a pure mapping over JSON
//! payloads with capability flags; the chain composes the ingress
//! transformer, the provider-level chain, and model-specific tails, with a
//! bypass when nothing would change the payload.

mod anthropic;
mod gemini;
mod iflow;
mod openai;
mod passthrough;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::providers::{DialectFamily, ProviderConfig};

pub use anthropic::AnthropicTransformer;
pub use gemini::GeminiTransformer;
pub use iflow::IflowTransformer;
pub use openai::OpenAiTransformer;
pub use passthrough::PassthroughTransformer;

/// What a transformer participates in. Bypass and ordering are closed-form
/// over these flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub request_out: bool,
    pub request_in: bool,
    pub response_out: bool,
    pub response_in: bool,
    pub auth: bool,
}

/// Authorization produced by a transformer's auth hook when the chain is
/// bypassed.
#[derive(Clone, Debug, Default)]
pub struct AuthOutcome {
    pub headers: Vec<(String, String)>,
    pub body_mutation: Option<Value>,
}

pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Client dialect -> unified.
    fn request_out(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(message)
    }

    /// Unified -> provider dialect. May also emit a config delta merged into
    /// the accumulated chain config.
    fn request_in(&self, message: Value, _ctx: &RequestContext) -> Result<(Value, Option<Value>)> {
        Ok((message, None))
    }

    /// Provider dialect -> unified (reverse order along the chain).
    fn response_out(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(message)
    }

    /// Unified -> client dialect, applied last.
    fn response_in(&self, message: Value, _ctx: &RequestContext) -> Result<Value> {
        Ok(message)
    }

    fn auth(&self, _ctx: &RequestContext, _api_key: &str) -> Option<AuthOutcome> {
        None
    }
}

/// Registry of transformers by name.
pub struct TransformerSet {
    by_name: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerSet {
    pub fn with_builtins() -> Self {
        let mut set = Self {
            by_name: HashMap::new(),
        };
        set.register(Arc::new(OpenAiTransformer));
        set.register(Arc::new(AnthropicTransformer));
        set.register(Arc::new(GeminiTransformer));
        set.register(Arc::new(IflowTransformer));
        set.register(Arc::new(PassthroughTransformer));
        set
    }

    pub fn register(&mut self, transformer: Arc<dyn Transformer>) {
        self.by_name.insert(transformer.name(), transformer);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Transformer>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::InvalidRequest {
                reason: format!("unknown transformer `{name}`"),
            })
    }

    pub fn for_ingress(&self, family: DialectFamily) -> Arc<dyn Transformer> {
        let name = match family {
            DialectFamily::Anthropic => "anthropic",
            _ => "openai",
        };
        self.by_name[name].clone()
    }

    /// Assemble the chain for one provider+model pair.
    pub fn chain_for(
        &self,
        ingress: DialectFamily,
        provider: &ProviderConfig,
        model: &str,
    ) -> Result<TransformerChain> {
        let mut provider_chain = Vec::new();
        for name in &provider.transformer.chain {
            provider_chain.push(self.get(name)?);
        }
        let mut model_chain = Vec::new();
        if let Some(names) = provider.transformer.per_model.get(model) {
            for name in names {
                model_chain.push(self.get(name)?);
            }
        }
        Ok(TransformerChain {
            ingress: self.for_ingress(ingress),
            provider_chain,
            model_chain,
        })
    }
}

pub struct TransformerChain {
    ingress: Arc<dyn Transformer>,
    provider_chain: Vec<Arc<dyn Transformer>>,
    model_chain: Vec<Arc<dyn Transformer>>,
}

impl TransformerChain {
    /// Bypass: the ingress dialect equals the sole provider transformer and
    /// no model-level transformers apply, so the payload passes unchanged.
    pub fn is_bypass(&self) -> bool {
        self.model_chain.is_empty()
            && self.provider_chain.len() == 1
            && self.provider_chain[0].name() == self.ingress.name()
    }

    /// Auth hook of the active transformer, consulted only on bypass.
    pub fn bypass_auth(&self, ctx: &RequestContext, api_key: &str) -> Option<AuthOutcome> {
        if !self.is_bypass() {
            return None;
        }
        let active = &self.provider_chain[0];
        if !active.capabilities().auth {
            return None;
        }
        active.auth(ctx, api_key)
    }

    /// Ingress dialect -> provider dialect. Returns the transformed payload
    /// plus the shallow-merged config accumulated along the chain.
    pub fn apply_request(&self, message: Value, ctx: &RequestContext) -> Result<(Value, Value)> {
        let mut config = Value::Object(Map::new());
        if self.is_bypass() {
            return Ok((message, config));
        }

        let mut message = if self.ingress.capabilities().request_out {
            self.ingress.request_out(message, ctx)?
        } else {
            message
        };

        for transformer in self.provider_chain.iter().chain(self.model_chain.iter()) {
            if !transformer.capabilities().request_in {
                continue;
            }
            let (next, delta) = transformer.request_in(message, ctx)?;
            message = next;
            if let Some(delta) = delta {
                shallow_merge(&mut config, delta);
            }
        }
        Ok((message, config))
    }

    /// Provider dialect -> ingress dialect: provider chain reversed, model
    /// chain reversed, ingress last.
    pub fn apply_response(&self, message: Value, ctx: &RequestContext) -> Result<Value> {
        if self.is_bypass() {
            return Ok(message);
        }

        let mut message = message;
        for transformer in self
            .model_chain
            .iter()
            .rev()
            .chain(self.provider_chain.iter().rev())
        {
            if transformer.capabilities().response_out {
                message = transformer.response_out(message, ctx)?;
            }
        }
        if self.ingress.capabilities().response_in {
            message = self.ingress.response_in(message, ctx)?;
        }
        Ok(message)
    }
}

/// Later keys win; nested objects are replaced, not merged.
fn shallow_merge(into: &mut Value, delta: Value) {
    let (Value::Object(into), Value::Object(delta)) = (into, delta) else {
        return;
    };
    for (key, value) in delta {
        into.insert(key, value);
    }
}
