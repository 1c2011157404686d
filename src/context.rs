//! Per-request record threaded through routing, dispatch, and the stream
//! relay.

use serde::Serialize;

use crate::endpoint::hash64_fnv1a;
use crate::providers::DialectFamily;
use crate::scenario::ScenarioType;
use crate::selector::Candidate;

#[derive(Clone, Debug, Serialize)]
pub struct RequestContext {
    pub request_id: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub priority: i32,
    pub provider: String,
    pub model: String,
    pub scenario: ScenarioType,
    pub is_custom_model: bool,
    pub should_race: bool,
    pub ingress: DialectFamily,
    pub stream: bool,
    pub start_ms: u64,
    pub stage_log: Vec<StageEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StageEntry {
    pub stage: &'static str,
    pub at_ms: u64,
}

impl RequestContext {
    pub fn new(request_id: String, ingress: DialectFamily, start_ms: u64) -> Self {
        Self {
            request_id,
            session_id: None,
            conversation_id: None,
            priority: 0,
            provider: String::new(),
            model: String::new(),
            scenario: ScenarioType::Default,
            is_custom_model: false,
            should_race: false,
            ingress,
            stream: false,
            start_ms,
            stage_log: Vec::new(),
        }
    }

    pub fn log_stage(&mut self, stage: &'static str, at_ms: u64) {
        self.stage_log.push(StageEntry { stage, at_ms });
    }

    /// Commit the winning candidate onto the context.
    pub fn commit(&mut self, candidate: &Candidate) {
        self.provider = candidate.provider.clone();
        self.model = candidate.model.clone();
    }

    /// Context for one racer. The iflow family requires per-session
    /// exclusivity upstream, so each iflow racer gets a fresh deterministic
    /// session suffix; every other family shares the ids unchanged.
    pub fn for_racer(&self, candidate: &Candidate, family: DialectFamily, ordinal: usize) -> Self {
        let mut ctx = self.clone();
        ctx.commit(candidate);
        if family.is_iflow() {
            let seed = format!("{}:{ordinal}", self.request_id);
            let suffix = hash64_fnv1a(seed.as_bytes()) & 0xffff_ffff;
            if let Some(session) = ctx.session_id.as_mut() {
                session.push_str(&format!("-r{suffix:08x}"));
            } else {
                ctx.session_id = Some(format!("{}-r{suffix:08x}", self.request_id));
            }
            if let Some(conversation) = ctx.conversation_id.as_mut() {
                conversation.push_str(&format!("-r{suffix:08x}"));
            }
        }
        ctx
    }
}

/// Map the `x-ccr-priority` header to a numeric priority.
pub fn priority_from_tag(tag: Option<&str>) -> i32 {
    match tag {
        Some("high") => 10,
        Some("low") => -10,
        _ => 0,
    }
}
