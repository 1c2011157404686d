//! Parallel racing: dispatch a candidate field concurrently, first success
//! wins and cancels the rest. Used both for proactive races and for the
//! post-failure failover round.

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DispatchOutcome, Dispatcher};
use crate::context::RequestContext;
use crate::error::{RelayError, Result};
use crate::selector::Candidate;

impl Dispatcher {
    /// Race every candidate with one shared cancellation token. Candidates
    /// that cannot reserve a slot fail individually without aborting the
    /// race. Losers cancelled mid-flight release their slots without blame;
    /// the winner's slot follows its response to completion.
    pub(crate) async fn run_race(
        &self,
        ctx: &RequestContext,
        field: &[Candidate],
        payload: &Value,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome> {
        let mut attempts = FuturesUnordered::new();
        for (ordinal, candidate) in field.iter().enumerate() {
            let family = self
                .registry
                .get(&candidate.provider)
                .map(|provider| provider.kind)
                .unwrap_or_default();
            // Fresh per-racer session ids for the iflow family; shared
            // everywhere else.
            let racer_ctx = ctx.for_racer(candidate, family, ordinal);
            let child = cancel.child_token();
            attempts.push(async move {
                let result = self
                    .single_path(&racer_ctx, candidate, payload, child, false)
                    .await;
                (candidate.clone(), result)
            });
        }

        let mut failures: Vec<RelayError> = Vec::new();
        while let Some((candidate, result)) = attempts.next().await {
            match result {
                Ok(outcome) => {
                    debug!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        "race winner; cancelling peers"
                    );
                    cancel.cancel();
                    drop(attempts);
                    return Ok(outcome);
                }
                Err(err) => {
                    debug!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        error = %err,
                        "race candidate failed"
                    );
                    failures.push(err);
                }
            }
        }

        warn!(
            candidates = field.len(),
            failures = failures.len(),
            "all parallel attempts failed"
        );
        Err(RelayError::AllAttemptsFailed)
    }
}
