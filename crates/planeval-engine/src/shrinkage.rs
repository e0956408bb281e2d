//! Shrinkage blending of a protocol-specific reference with a generic
//! pooled reference.
//!
//! Small protocols produce noisy percentile estimates. The blend scores a
//! value against both references and mixes the percentiles with
//! w = n / (n + k), where n is the protocol-specific plan count and k the
//! shrinkage constant: w = 0 recovers the generic reference, w -> 1 the
//! protocol-specific one. The percentile-averaging formulation is fixed for
//! a whole experiment run; bootstrap variance comparisons depend on the
//! method not changing mid-run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constraint_key::ConstraintKeyId;
use crate::population_reference::{PopulationReference, ScoringReference};

const ERROR_NON_POSITIVE_CONSTANT: &str = "PE-BLEND-1001";

/// w(n) = n / (n + k). Well-defined for n = 0 because k is positive.
pub fn shrinkage_weight(n: usize, k: f64) -> f64 {
    let n = n as f64;
    n / (n + k)
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShrinkageError {
    #[error("shrinkage constant must be positive, got {k}")]
    NonPositiveConstant { k: f64 },
}

impl ShrinkageError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::NonPositiveConstant { .. } => ERROR_NON_POSITIVE_CONSTANT,
        }
    }
}

/// A scoring view over two references. Holds no data of its own.
#[derive(Debug, Clone, Copy)]
pub struct BlendedReference<'a> {
    protocol: &'a PopulationReference,
    generic: &'a PopulationReference,
    /// Protocol-side mixing weight in [0, 1).
    pub weight: f64,
}

/// Builds the blend for a protocol-specific sample of size `n`.
pub fn blend<'a>(
    protocol: &'a PopulationReference,
    generic: &'a PopulationReference,
    n: usize,
    k: f64,
) -> Result<BlendedReference<'a>, ShrinkageError> {
    if !(k > 0.0) {
        return Err(ShrinkageError::NonPositiveConstant { k });
    }
    Ok(BlendedReference {
        protocol,
        generic,
        weight: shrinkage_weight(n, k),
    })
}

impl ScoringReference for BlendedReference<'_> {
    /// w-weighted average of the per-source percentiles. A key covered by
    /// exactly one source uses that source's percentile alone.
    fn percentile(&self, key: &ConstraintKeyId, value: f64) -> Option<f64> {
        let from_protocol = self.protocol.percentile(key, value);
        let from_generic = self.generic.percentile(key, value);
        match (from_protocol, from_generic) {
            (Some(p), Some(g)) => Some(self.weight * p + (1.0 - self.weight) * g),
            (Some(p), None) => Some(p),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        }
    }

    fn weight(&self, key: &ConstraintKeyId) -> Option<f64> {
        self.protocol.weight(key).or_else(|| self.generic.weight(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint_key::StructureAliasTable;
    use crate::plan::{PatientId, Plan, PlanEvaluation, PlanId, RawPlanResult};
    use crate::protocol_catalog::{ProtocolCatalog, RawConstraint, WeightPolicy};
    use serde_json::json;

    fn catalog() -> ProtocolCatalog {
        ProtocolCatalog::compile(
            "Test Protocol",
            &[RawConstraint {
                structure: Some("Spinal_Cord".into()),
                metric_display: Some("Max Dose".into()),
                goal_operator: Some("<=".into()),
                goal_value: Some(json!(45.0)),
                priority: Some(json!(1)),
                ..RawConstraint::default()
            }],
            &WeightPolicy::default(),
        )
    }

    fn plan(id: &str, achieved: f64) -> Plan {
        let evaluation = PlanEvaluation {
            plan_id: PlanId(id.into()),
            patient_id: PatientId(format!("pt-{id}")),
            protocol_name: "Test Protocol".into(),
            is_approved: true,
            attempt_number: Some(1),
            created_at: None,
            updated_at: None,
            results: vec![RawPlanResult {
                structure: Some("Spinal_Cord".into()),
                metric_display: Some("Max Dose".into()),
                goal_operator: Some("<=".into()),
                goal_value: Some(json!(45.0)),
                priority: Some(json!(1)),
                achieved_value: Some(json!(achieved)),
                ..RawPlanResult::default()
            }],
        };
        Plan::match_evaluation(&evaluation, &catalog(), &StructureAliasTable::default(), 0.0)
    }

    fn reference(values: &[f64]) -> PopulationReference {
        let plans: Vec<Plan> = values
            .iter()
            .enumerate()
            .map(|(i, v)| plan(&format!("p{i}"), *v))
            .collect();
        PopulationReference::build(&catalog(), &plans, 1)
    }

    fn key(reference: &PopulationReference) -> ConstraintKeyId {
        reference.constraint_meta().keys().next().cloned().expect("key")
    }

    // ── shrinkage_weight ──────────────────────────────────────────

    #[test]
    fn weight_is_zero_at_n_zero_without_division_by_zero() {
        assert_eq!(shrinkage_weight(0, 25.0), 0.0);
    }

    #[test]
    fn weight_converges_to_one_as_n_dominates_k() {
        let k = 25.0;
        let mut previous = 0.0;
        for n in [10, 100, 1_000, 100_000] {
            let w = shrinkage_weight(n, k);
            assert!(w > previous);
            previous = w;
        }
        assert!(shrinkage_weight(1_000_000, k) > 0.999_9);
    }

    // ── blend ─────────────────────────────────────────────────────

    #[test]
    fn non_positive_constant_is_rejected() {
        let protocol = reference(&[1.0, 2.0]);
        let generic = reference(&[1.0, 2.0]);
        let err = blend(&protocol, &generic, 10, 0.0).unwrap_err();
        assert_eq!(err.stable_code(), "PE-BLEND-1001");
        assert!(blend(&protocol, &generic, 10, -3.0).is_err());
    }

    #[test]
    fn n_zero_reproduces_the_generic_reference() {
        let protocol = reference(&[100.0, 200.0, 300.0]);
        let generic = reference(&[1.0, 2.0, 3.0]);
        let blended = blend(&protocol, &generic, 0, 25.0).unwrap();
        let key = key(&generic);
        for value in [0.5, 1.5, 2.5, 3.5] {
            assert_eq!(
                blended.percentile(&key, value),
                generic.percentile(&key, value)
            );
        }
    }

    #[test]
    fn large_n_approaches_the_protocol_reference() {
        let protocol = reference(&[1.0, 2.0, 3.0]);
        let generic = reference(&[100.0, 200.0, 300.0]);
        let blended = blend(&protocol, &generic, 1_000_000, 25.0).unwrap();
        let key = key(&protocol);
        let p = protocol.percentile(&key, 1.5).unwrap();
        let b = blended.percentile(&key, 1.5).unwrap();
        assert!((p - b).abs() < 1e-4);
    }

    #[test]
    fn mid_blend_averages_source_percentiles() {
        let protocol = reference(&[1.0, 2.0, 3.0]);
        let generic = reference(&[2.0, 3.0, 4.0]);
        // n = k -> w = 0.5
        let blended = blend(&protocol, &generic, 25, 25.0).unwrap();
        let key = key(&protocol);
        let p = protocol.percentile(&key, 2.5).unwrap();
        let g = generic.percentile(&key, 2.5).unwrap();
        let b = blended.percentile(&key, 2.5).unwrap();
        assert!((b - 0.5 * (p + g)).abs() < 1e-12);
    }

    #[test]
    fn single_source_key_uses_that_source_alone() {
        let protocol = reference(&[]);
        let generic = reference(&[1.0, 2.0, 3.0]);
        let blended = blend(&protocol, &generic, 50, 25.0).unwrap();
        let key = key(&generic);
        assert_eq!(
            blended.percentile(&key, 1.5),
            generic.percentile(&key, 1.5)
        );
    }
}
