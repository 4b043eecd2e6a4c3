use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::memory::{LLM_ONLY_SENTINEL, Strategy};

/* ============================= SELECTION ============================= */

/// The decision for one incident: either a concrete learned/seeded
/// strategy, or the LLM-only sentinel that makes the planner generate
/// from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub strategy_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub explored: bool,
    pub rationale: String,
}

impl Selection {
    fn sentinel(rationale: impl Into<String>, explored: bool) -> Self {
        Self {
            strategy_id: LLM_ONLY_SENTINEL.to_string(),
            strategy: None,
            explored,
            rationale: rationale.into(),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.strategy_id == LLM_ONLY_SENTINEL
    }
}

/* ============================= ENGINE ============================= */

/// Exploration/exploitation policy over the strategy set.
///
/// Most incidents ride the best learned strategy; a fraction (epsilon)
/// plus every low-confidence situation goes back to the LLM so the
/// strategy set keeps evolving.
pub struct DecisionEngine {
    epsilon: f64,
    confidence_floor: f64,
}

impl DecisionEngine {
    pub fn new(epsilon: f64, confidence_floor: f64) -> Self {
        Self {
            epsilon,
            confidence_floor,
        }
    }

    pub fn select<R: Rng>(&self, strategies: &[Strategy], rng: &mut R) -> Selection {
        if strategies.is_empty() {
            return Selection::sentinel("no strategies recorded for this category", false);
        }

        let draw: f64 = rng.r#gen();
        if draw < self.epsilon {
            let selection = Selection::sentinel(
                format!("exploring (draw {draw:.3} < epsilon {:.3})", self.epsilon),
                true,
            );
            info!(rationale = %selection.rationale, "strategy_selected");
            return selection;
        }

        let best = strategies
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.last_success_at.cmp(&b.last_success_at))
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .expect("non-empty strategy list");

        if best.confidence < self.confidence_floor {
            return Selection::sentinel(
                format!(
                    "best confidence {:.2} below floor {:.2}",
                    best.confidence, self.confidence_floor
                ),
                false,
            );
        }

        let selection = Selection {
            strategy_id: best.id.clone(),
            strategy: Some(best.clone()),
            explored: false,
            rationale: format!(
                "exploiting '{}' (confidence {:.2}, {}/{} successes)",
                best.description, best.confidence, best.success_count, best.usage_count
            ),
        };
        info!(strategy_id = %selection.strategy_id, rationale = %selection.rationale, "strategy_selected");
        selection
    }
}
