//! Candidate scoring and the proactive-race decision.

use serde::Serialize;

use crate::config::SelectorConfig;
use crate::pool::ModelPool;
use crate::scenario::ScenarioType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
}

impl Candidate {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: f64,
    pub admissible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disqualified: Option<&'static str>,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub selected: Candidate,
    pub score: f64,
    pub should_race: bool,
    pub race_candidates: Vec<Candidate>,
}

pub struct ModelSelector {
    config: SelectorConfig,
}

impl ModelSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn score(
        &self,
        pool: &ModelPool,
        candidate: &Candidate,
        is_primary: bool,
        request_priority: i32,
    ) -> ScoredCandidate {
        if pool.is_circuit_open(&candidate.provider, &candidate.model) {
            return disqualified(candidate, "circuit open");
        }
        if pool.is_rate_limited(&candidate.provider, &candidate.model) {
            return disqualified(candidate, "rate limited");
        }
        if !pool.has_capacity(&candidate.provider, &candidate.model) {
            return disqualified(candidate, "saturated");
        }

        let status = pool.slot_status(&candidate.provider, &candidate.model);
        let free = status.max_concurrent.saturating_sub(status.in_use);
        let capacity_score = if status.max_concurrent == 0 {
            0.0
        } else {
            f64::from(free) / f64::from(status.max_concurrent) * 100.0
        };
        let health_score = if self.config.enable_health_based_routing {
            status.success_rate
        } else {
            100.0
        };
        let performance_score = if self.config.enable_performance_based_routing {
            (100.0 - 10.0 * f64::from(status.failure_count)).max(0.0)
        } else {
            100.0
        };
        let candidate_priority = if is_primary { 10.0 } else { 0.0 };
        let priority_score = candidate_priority + f64::from(request_priority);

        let weights = self.config.score_weights;
        let score = weights.capacity * capacity_score
            + weights.health * health_score
            + weights.performance * performance_score
            + weights.priority * priority_score;

        ScoredCandidate {
            candidate: candidate.clone(),
            score,
            admissible: true,
            disqualified: None,
        }
    }

    /// Rank the primary and its alternatives; decide whether to race.
    ///
    /// Racing only triggers for the default scenario with proactive failover
    /// on: a selected score below 50 always races, 50..70 races when any
    /// alternative is admissible, 70 and above never races.
    pub fn select(
        &self,
        pool: &ModelPool,
        primary: &Candidate,
        alternatives: &[Candidate],
        scenario: ScenarioType,
        request_priority: i32,
    ) -> Option<Selection> {
        let mut scored = Vec::with_capacity(alternatives.len() + 1);
        scored.push(self.score(pool, primary, true, request_priority));
        for alt in alternatives {
            scored.push(self.score(pool, alt, false, request_priority));
        }

        let mut admissible: Vec<&ScoredCandidate> =
            scored.iter().filter(|entry| entry.admissible).collect();
        admissible.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let best = admissible.first()?;
        // With health preference off, an admissible primary keeps its seat
        // even when an alternative outscores it.
        let (selected, score) = if self.config.prefer_healthy_models {
            (best.candidate.clone(), best.score)
        } else {
            admissible
                .iter()
                .find(|entry| entry.candidate == *primary)
                .map(|entry| (entry.candidate.clone(), entry.score))
                .unwrap_or((best.candidate.clone(), best.score))
        };

        let others: Vec<Candidate> = admissible
            .iter()
            .filter(|entry| entry.candidate != selected)
            .map(|entry| entry.candidate.clone())
            .collect();

        let should_race = self.config.enable_proactive_failover
            && scenario == ScenarioType::Default
            && !others.is_empty()
            && score < 70.0;

        let race_candidates = if should_race {
            others
                .into_iter()
                .take(self.config.max_parallel_alternatives)
                .collect()
        } else {
            Vec::new()
        };

        Some(Selection {
            selected,
            score,
            should_race,
            race_candidates,
        })
    }
}

fn disqualified(candidate: &Candidate, reason: &'static str) -> ScoredCandidate {
    ScoredCandidate {
        candidate: candidate.clone(),
        score: 0.0,
        admissible: false,
        disqualified: Some(reason),
    }
}
