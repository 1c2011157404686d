use super::{Capabilities, Transformer};

/// The unified internal form is OpenAI chat-completions shaped, so this
/// transformer inherits the identity default on every leg. It exists so
/// bypass detection and chain assembly treat the OpenAI dialect like any
/// other.
pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            request_out: true,
            request_in: true,
            response_out: true,
            response_in: true,
            auth: false,
        }
    }
}
