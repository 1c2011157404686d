use super::{Capabilities, Transformer};

/// Inert chain member. Declares no capabilities, so the chain skips it on
/// every leg; useful as a placeholder in provider configs.
pub struct PassthroughTransformer;

impl Transformer for PassthroughTransformer {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }
}
