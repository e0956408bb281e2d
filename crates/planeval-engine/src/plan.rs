//! Plan entities and matched constraint observations.
//!
//! The external loader hands the engine one evaluation per approved
//! (patient, plan, protocol) attempt. Matching applies the key resolver to
//! every raw result and keeps the achieved values of keys the protocol
//! catalog declares. Results with unresolvable structures, missing metric
//! display, or non-numeric achieved values are dropped at this boundary,
//! never imputed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constraint_key::{
    normalize_text, parse_numeric, parse_priority, ConstraintBound, ConstraintKey,
    ConstraintKeyId, ResolveError, StructureAliasTable,
};
use crate::protocol_catalog::{resolve_metric_display, ProtocolCatalog};

const ERROR_DUPLICATE_PLAN_IDENTITY: &str = "PE-PLAN-1001";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanId(pub String);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatientId(pub String);

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One raw constraint result inside an evaluation record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPlanResult {
    pub structure: Option<String>,
    /// TG-263 structure name; preferred over `structure` when present.
    pub structure_tg263: Option<String>,
    pub metric_display: Option<String>,
    pub objective: Option<String>,
    pub goal_operator: Option<String>,
    pub goal_value: Option<serde_json::Value>,
    pub variation_operator: Option<String>,
    pub variation_value: Option<serde_json::Value>,
    pub priority: Option<serde_json::Value>,
    pub achieved_value: Option<serde_json::Value>,
}

/// One evaluation record as delivered by the loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEvaluation {
    pub plan_id: PlanId,
    pub patient_id: PatientId,
    pub protocol_name: String,
    pub is_approved: bool,
    pub attempt_number: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub results: Vec<RawPlanResult>,
}

/// A matched (key, achieved value) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintObservation {
    pub key: ConstraintKeyId,
    pub achieved: f64,
}

/// A plan with its matched observations. Read-only for the lifetime of an
/// experiment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: PlanId,
    pub patient_id: PatientId,
    pub protocol_name: String,
    pub is_approved: bool,
    pub attempt_number: Option<u32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    observations: BTreeMap<ConstraintKeyId, f64>,
    /// Results dropped during matching, with the reason.
    dropped: Vec<ResolveError>,
}

impl Plan {
    /// Matches an evaluation's results against a compiled catalog. The first
    /// result per key wins; later duplicates are ignored.
    pub fn match_evaluation(
        evaluation: &PlanEvaluation,
        catalog: &ProtocolCatalog,
        aliases: &StructureAliasTable,
        min_structure_overlap: f64,
    ) -> Self {
        let mut observations = BTreeMap::new();
        let mut dropped = Vec::new();

        for result in &evaluation.results {
            let raw_structure = result
                .structure_tg263
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .or(result.structure.as_deref())
                .unwrap_or("");
            let structure =
                match catalog.resolve_structure(raw_structure, aliases, min_structure_overlap) {
                    Ok(structure) => structure,
                    Err(err) => {
                        dropped.push(err);
                        continue;
                    }
                };
            let metric_display = match resolve_metric_display(
                result.metric_display.as_deref(),
                result.objective.as_deref(),
                raw_structure,
            ) {
                Ok(display) => display,
                Err(err) => {
                    dropped.push(err);
                    continue;
                }
            };
            let key = ConstraintKey {
                // resolve_structure returns a declared spelling; the key
                // stores the normalized form.
                structure: normalize_text(&structure).unwrap_or(structure),
                metric_display,
                goal: ConstraintBound::new(
                    result.goal_operator.as_deref(),
                    parse_numeric(result.goal_value.as_ref()),
                ),
                variation: ConstraintBound::new(
                    result.variation_operator.as_deref(),
                    parse_numeric(result.variation_value.as_ref()),
                ),
                priority: parse_priority(result.priority.as_ref()),
            };
            let key_id = key.id();
            if !catalog.contains(&key_id) {
                continue;
            }
            let Some(achieved) = parse_numeric(result.achieved_value.as_ref()) else {
                continue;
            };
            observations.entry(key_id).or_insert(achieved);
        }

        Self {
            plan_id: evaluation.plan_id.clone(),
            patient_id: evaluation.patient_id.clone(),
            protocol_name: evaluation.protocol_name.clone(),
            is_approved: evaluation.is_approved,
            attempt_number: evaluation.attempt_number,
            created_at: evaluation.created_at,
            updated_at: evaluation.updated_at,
            observations,
            dropped,
        }
    }

    pub fn observations(&self) -> impl Iterator<Item = ConstraintObservation> + '_ {
        self.observations
            .iter()
            .map(|(key, achieved)| ConstraintObservation {
                key: key.clone(),
                achieved: *achieved,
            })
    }

    pub fn achieved(&self, key: &ConstraintKeyId) -> Option<f64> {
        self.observations.get(key).copied()
    }

    pub fn observation_map(&self) -> &BTreeMap<ConstraintKeyId, f64> {
        &self.observations
    }

    pub fn matched_constraints(&self) -> usize {
        self.observations.len()
    }

    pub fn dropped(&self) -> &[ResolveError] {
        &self.dropped
    }

    /// Chronological ordering key: attempt number, then created-at (falling
    /// back to updated-at), then updated-at. `None` sorts earliest.
    pub fn attempt_order_key(
        &self,
    ) -> (Option<u32>, Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (
            self.attempt_number,
            self.created_at.or(self.updated_at),
            self.updated_at,
        )
    }
}

/// Picks the most recent plan by [`Plan::attempt_order_key`].
pub fn select_latest_attempt<'a, I>(plans: I) -> Option<&'a Plan>
where
    I: IntoIterator<Item = &'a Plan>,
{
    plans.into_iter().max_by_key(|plan| plan.attempt_order_key())
}

/// Loader invariant violation: two plans sharing (plan id, protocol name).
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("duplicate plan identity `{plan_id}` within protocol `{protocol_name}`")]
pub struct DuplicatePlanIdentity {
    pub plan_id: PlanId,
    pub protocol_name: String,
}

impl DuplicatePlanIdentity {
    pub fn stable_code(&self) -> &'static str {
        ERROR_DUPLICATE_PLAN_IDENTITY
    }
}

/// Validates the loader precondition that plans are de-duplicated to one
/// approved attempt per identity.
pub fn validate_unique_identities(plans: &[Plan]) -> Result<(), DuplicatePlanIdentity> {
    let mut seen = BTreeSet::new();
    for plan in plans {
        let identity = (plan.plan_id.clone(), plan.protocol_name.clone());
        if !seen.insert(identity) {
            return Err(DuplicatePlanIdentity {
                plan_id: plan.plan_id.clone(),
                protocol_name: plan.protocol_name.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_catalog::{RawConstraint, WeightPolicy};
    use chrono::TimeZone;
    use serde_json::json;

    fn catalog() -> ProtocolCatalog {
        let records = vec![
            RawConstraint {
                structure: Some("Spinal_Cord".into()),
                metric_display: Some("Max Dose".into()),
                goal_operator: Some("<=".into()),
                goal_value: Some(json!(45.0)),
                priority: Some(json!(1)),
                ..RawConstraint::default()
            },
            RawConstraint {
                structure: Some("PTV".into()),
                metric_display: Some("V95%".into()),
                goal_operator: Some(">=".into()),
                goal_value: Some(json!(95.0)),
                priority: Some(json!(2)),
                ..RawConstraint::default()
            },
        ];
        ProtocolCatalog::compile("Test Protocol", &records, &WeightPolicy::default())
    }

    fn result(structure: &str, metric: &str, goal_op: &str, goal_value: f64, priority: u32, achieved: serde_json::Value) -> RawPlanResult {
        RawPlanResult {
            structure: Some(structure.into()),
            metric_display: Some(metric.into()),
            goal_operator: Some(goal_op.into()),
            goal_value: Some(json!(goal_value)),
            priority: Some(json!(priority)),
            achieved_value: Some(achieved),
            ..RawPlanResult::default()
        }
    }

    fn evaluation(results: Vec<RawPlanResult>) -> PlanEvaluation {
        PlanEvaluation {
            plan_id: PlanId("plan-1".into()),
            patient_id: PatientId("pt-1".into()),
            protocol_name: "Test Protocol".into(),
            is_approved: true,
            attempt_number: Some(2),
            created_at: None,
            updated_at: None,
            results,
        }
    }

    fn matched(results: Vec<RawPlanResult>) -> Plan {
        Plan::match_evaluation(
            &evaluation(results),
            &catalog(),
            &StructureAliasTable::default(),
            0.0,
        )
    }

    // ── match_evaluation ──────────────────────────────────────────

    #[test]
    fn matches_declared_constraints() {
        let plan = matched(vec![
            result("Spinal_Cord", "Max Dose", "<=", 45.0, 1, json!(39.5)),
            result("PTV", "V95%", ">=", 95.0, 2, json!(97.1)),
        ]);
        assert_eq!(plan.matched_constraints(), 2);
    }

    #[test]
    fn non_numeric_achieved_value_is_dropped_not_imputed() {
        let plan = matched(vec![result(
            "Spinal_Cord",
            "Max Dose",
            "<=",
            45.0,
            1,
            json!("pending"),
        )]);
        assert_eq!(plan.matched_constraints(), 0);
    }

    #[test]
    fn undeclared_key_is_skipped_silently() {
        // same structure, different threshold: not in the catalog.
        let plan = matched(vec![result("Spinal_Cord", "Max Dose", "<=", 50.0, 1, json!(39.5))]);
        assert_eq!(plan.matched_constraints(), 0);
        assert!(plan.dropped().is_empty());
    }

    #[test]
    fn unresolvable_structure_is_recorded_and_recovered() {
        let plan = matched(vec![
            result("Femur", "Max Dose", "<=", 45.0, 1, json!(10.0)),
            result("PTV", "V95%", ">=", 95.0, 2, json!(97.1)),
        ]);
        assert_eq!(plan.matched_constraints(), 1);
        assert_eq!(plan.dropped().len(), 1);
        assert_eq!(plan.dropped()[0].stable_code(), "PE-KEY-1001");
    }

    #[test]
    fn tg263_name_is_preferred_over_raw_structure() {
        let mut r = result("totally wrong", "Max Dose", "<=", 45.0, 1, json!(30.0));
        r.structure_tg263 = Some("Spinal_Cord".into());
        let plan = matched(vec![r]);
        assert_eq!(plan.matched_constraints(), 1);
    }

    #[test]
    fn first_result_per_key_wins() {
        let plan = matched(vec![
            result("Spinal_Cord", "Max Dose", "<=", 45.0, 1, json!(39.5)),
            result("Spinal_Cord", "Max Dose", "<=", 45.0, 1, json!(41.0)),
        ]);
        let obs: Vec<_> = plan.observations().collect();
        assert_eq!(obs.len(), 1);
        assert_eq!(obs[0].achieved, 39.5);
    }

    #[test]
    fn fuzzy_structure_match_feeds_key_resolution() {
        let plan = matched(vec![result(
            "spinal cord prv",
            "Max Dose",
            "<=",
            45.0,
            1,
            json!(39.5),
        )]);
        assert_eq!(plan.matched_constraints(), 1);
    }

    // ── attempt ordering ──────────────────────────────────────────

    #[test]
    fn latest_attempt_prefers_attempt_number_then_timestamps() {
        let ts = |day| Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single();
        let mut first = matched(vec![]);
        first.attempt_number = Some(1);
        first.created_at = ts(20);
        let mut second = matched(vec![]);
        second.attempt_number = Some(2);
        second.created_at = ts(10);
        let plans = vec![first, second];
        let latest = select_latest_attempt(&plans).expect("latest");
        assert_eq!(latest.attempt_number, Some(2));

        let mut a = matched(vec![]);
        a.created_at = ts(10);
        let mut b = matched(vec![]);
        b.created_at = None;
        b.updated_at = ts(15);
        let plans = vec![a, b];
        let latest = select_latest_attempt(&plans).expect("latest");
        assert_eq!(latest.updated_at, ts(15));
    }

    // ── identity validation ───────────────────────────────────────

    #[test]
    fn duplicate_identity_is_rejected() {
        let plan = matched(vec![]);
        let err = validate_unique_identities(&[plan.clone(), plan]).unwrap_err();
        assert_eq!(err.stable_code(), "PE-PLAN-1001");
    }

    #[test]
    fn distinct_protocols_may_share_plan_ids() {
        let a = matched(vec![]);
        let mut b = a.clone();
        b.protocol_name = "Other Protocol".into();
        assert!(validate_unique_identities(&[a, b]).is_ok());
    }
}
