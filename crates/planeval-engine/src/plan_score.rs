//! Composite plan scoring against a population reference.
//!
//! A plan's score is the weight-normalized mean of its per-constraint
//! percentiles. Scores are derived values: they depend on the reference
//! they were computed against and are never stored on the plan itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constraint_key::ConstraintKeyId;
use crate::plan::{Plan, PlanId};
use crate::population_reference::ScoringReference;

/// Outcome of scoring one plan against one reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanScore {
    pub plan_id: PlanId,
    pub protocol_name: String,
    /// Weighted mean percentile in [0, 1]; `None` when no key contributed.
    pub composite: Option<f64>,
    /// Percentile per contributing key; callers derive coverage from this.
    pub percentiles: BTreeMap<ConstraintKeyId, f64>,
    /// Keys the plan carries observations for.
    pub matched_constraints: usize,
    /// Keys that actually contributed to the composite.
    pub scored_constraints: usize,
}

/// Scores `plan` against `reference`.
///
/// Keys present on only one side, keys without a direction, and keys
/// without a weight are skipped; partial coverage is expected, not an
/// error. Zero contributing keys yields a `None` composite.
pub fn score_plan<R>(plan: &Plan, reference: &R) -> PlanScore
where
    R: ScoringReference + ?Sized,
{
    let mut percentiles = BTreeMap::new();
    let mut total_weight = 0.0;
    let mut total_score = 0.0;

    for (key_id, achieved) in plan.observation_map() {
        let Some(percentile) = reference.percentile(key_id, *achieved) else {
            continue;
        };
        let Some(weight) = reference.weight(key_id) else {
            continue;
        };
        percentiles.insert(key_id.clone(), percentile);
        total_score += weight * percentile;
        total_weight += weight;
    }

    let scored_constraints = percentiles.len();
    let composite = if total_weight > 0.0 {
        Some(total_score / total_weight)
    } else {
        None
    };

    PlanScore {
        plan_id: plan.plan_id.clone(),
        protocol_name: plan.protocol_name.clone(),
        composite,
        percentiles,
        matched_constraints: plan.matched_constraints(),
        scored_constraints,
    }
}
