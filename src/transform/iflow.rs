use serde_json::{Value, json};

use super::{AuthOutcome, Capabilities, Transformer};
use crate::context::RequestContext;
use crate::error::Result;

/// The iflow family speaks OpenAI-shaped payloads but carries its own auth
/// quirks: a lowercase bearer header plus a session echo in the body. The
/// auth hook runs when the chain is bypassed; otherwise the header builder's
/// family overlay covers it.
pub struct IflowTransformer;

impl Transformer for IflowTransformer {
    fn name(&self) -> &'static str {
        "iflow"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_out: false,
            request_in: true,
            response_out: true,
            response_in: false,
            auth: true,
        }
    }

    fn request_in(&self, message: Value, ctx: &RequestContext) -> Result<(Value, Option<Value>)> {
        let mut message = message;
        if let Some(object) = message.as_object_mut() {
            if let Some(session) = &ctx.session_id {
                object.insert("session_id".to_string(), json!(session));
            }
        }
        Ok((message, None))
    }

    fn auth(&self, ctx: &RequestContext, api_key: &str) -> Option<AuthOutcome> {
        let mut outcome = AuthOutcome {
            headers: vec![("authorization".to_string(), format!("Bearer {api_key}"))],
            body_mutation: None,
        };
        if let Some(session) = &ctx.session_id {
            outcome.body_mutation = Some(json!({ "session_id": session }));
        }
        Some(outcome)
    }
}
