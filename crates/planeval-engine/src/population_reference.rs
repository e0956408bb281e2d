//! Empirical population references.
//!
//! A reference maps each constraint key to the sorted achieved values of a
//! cohort of approved plans, together with the key's scoring direction and
//! weight. It is immutable once built: rebuilding from a different plan set
//! produces a new reference, never a mutation. Percentiles use the inclusive
//! empirical rank, so the distribution's own median scores exactly 0.5.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::constraint_key::{ConstraintKey, ConstraintKeyId, Direction};
use crate::plan::Plan;
use crate::protocol_catalog::ProtocolCatalog;

/// Inclusive empirical percentile of `value` within `sorted` (ascending,
/// non-empty). Rank is the count of reference values at or below `value`,
/// clamped to `[1, n]`; base percentile is `(rank - 1) / (n - 1)`, inverted
/// for lower-is-better keys.
///
/// A one-point distribution cannot interpolate: it maps any
/// direction-favorable value (ties favorable) to exactly 1.0 and anything
/// else to exactly 0.0, never NaN.
pub fn compute_percentile(sorted: &[f64], value: f64, direction: Direction) -> f64 {
    let n = sorted.len();
    debug_assert!(n > 0, "empty distributions are filtered before lookup");
    if n == 1 {
        let favorable = match direction {
            Direction::LowerIsBetter => value <= sorted[0],
            Direction::HigherIsBetter => value >= sorted[0],
        };
        return if favorable { 1.0 } else { 0.0 };
    }
    let rank = sorted.partition_point(|v| *v <= value).clamp(1, n);
    let base = (rank - 1) as f64 / (n - 1) as f64;
    match direction {
        Direction::LowerIsBetter => 1.0 - base,
        Direction::HigherIsBetter => base,
    }
}

/// Anything a plan can be percentile-scored against: a plain population
/// reference or a shrinkage blend of two of them.
pub trait ScoringReference {
    /// Percentile of `value` for `key`, or `None` when the key has no
    /// distribution or no direction.
    fn percentile(&self, key: &ConstraintKeyId, value: f64) -> Option<f64>;
    /// Composite-score weight for `key`.
    fn weight(&self, key: &ConstraintKeyId) -> Option<f64>;
}

/// Empirical reference for one cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationReference {
    pub protocol_name: String,
    constraint_meta: BTreeMap<ConstraintKeyId, ConstraintKey>,
    /// Sorted achieved values per key; keys without any value are absent.
    distributions: BTreeMap<ConstraintKeyId, Vec<f64>>,
    directions: BTreeMap<ConstraintKeyId, Direction>,
    weights: BTreeMap<ConstraintKeyId, f64>,
    /// Keys with fewer observations than the configured minimum.
    low_confidence: BTreeSet<ConstraintKeyId>,
    plan_count: usize,
}

impl PopulationReference {
    /// Builds the reference for a plan set. Pure; an empty plan set yields
    /// an empty reference rather than an error. Accepts any iterator of
    /// borrowed plans, so a bootstrap sample can repeat a plan without
    /// cloning it.
    pub fn build<'a, I>(catalog: &ProtocolCatalog, plans: I, min_observations: usize) -> Self
    where
        I: IntoIterator<Item = &'a Plan>,
    {
        let mut values_per_key: BTreeMap<ConstraintKeyId, Vec<f64>> = BTreeMap::new();
        let mut plan_count = 0;
        for plan in plans {
            plan_count += 1;
            for (key_id, achieved) in plan.observation_map() {
                if catalog.contains(key_id) {
                    values_per_key.entry(key_id.clone()).or_default().push(*achieved);
                }
            }
        }

        let mut distributions = BTreeMap::new();
        let mut low_confidence = BTreeSet::new();
        for (key_id, mut values) in values_per_key {
            if values.is_empty() {
                continue;
            }
            values.sort_by(f64::total_cmp);
            if values.len() < min_observations {
                low_confidence.insert(key_id.clone());
            }
            distributions.insert(key_id, values);
        }

        Self {
            protocol_name: catalog.protocol_name.clone(),
            constraint_meta: catalog.constraint_meta().clone(),
            distributions,
            directions: catalog.directions().clone(),
            weights: catalog.weights().clone(),
            low_confidence,
            plan_count,
        }
    }

    /// Pools several references into one generic reference by concatenating
    /// per-key sequences. Metadata comes from the first reference carrying
    /// the key.
    pub fn merge<'a, I>(name: &str, references: I, min_observations: usize) -> Self
    where
        I: IntoIterator<Item = &'a PopulationReference>,
    {
        let mut constraint_meta = BTreeMap::new();
        let mut pooled: BTreeMap<ConstraintKeyId, Vec<f64>> = BTreeMap::new();
        let mut directions = BTreeMap::new();
        let mut weights = BTreeMap::new();
        let mut plan_count = 0;

        for reference in references {
            plan_count += reference.plan_count;
            for (key_id, values) in &reference.distributions {
                pooled
                    .entry(key_id.clone())
                    .or_default()
                    .extend_from_slice(values);
            }
            for (key_id, meta) in &reference.constraint_meta {
                constraint_meta
                    .entry(key_id.clone())
                    .or_insert_with(|| meta.clone());
            }
            for (key_id, direction) in &reference.directions {
                directions.entry(key_id.clone()).or_insert(*direction);
            }
            for (key_id, weight) in &reference.weights {
                weights.entry(key_id.clone()).or_insert(*weight);
            }
        }

        let mut distributions = BTreeMap::new();
        let mut low_confidence = BTreeSet::new();
        for (key_id, mut values) in pooled {
            values.sort_by(f64::total_cmp);
            if values.len() < min_observations {
                low_confidence.insert(key_id.clone());
            }
            distributions.insert(key_id, values);
        }

        Self {
            protocol_name: name.to_string(),
            constraint_meta,
            distributions,
            directions,
            weights,
            low_confidence,
            plan_count,
        }
    }

    pub fn distribution(&self, key: &ConstraintKeyId) -> Option<&[f64]> {
        self.distributions.get(key).map(Vec::as_slice)
    }

    pub fn direction(&self, key: &ConstraintKeyId) -> Option<Direction> {
        self.directions.get(key).copied()
    }

    pub fn constraint_meta(&self) -> &BTreeMap<ConstraintKeyId, ConstraintKey> {
        &self.constraint_meta
    }

    pub fn is_low_confidence(&self, key: &ConstraintKeyId) -> bool {
        self.low_confidence.contains(key)
    }

    /// Declared constraint count.
    pub fn constraints_total(&self) -> usize {
        self.constraint_meta.len()
    }

    /// Keys that actually carry values.
    pub fn constraints_with_values(&self) -> usize {
        self.distributions.len()
    }

    pub fn plan_count(&self) -> usize {
        self.plan_count
    }

    pub fn is_empty(&self) -> bool {
        self.distributions.is_empty()
    }
}

impl ScoringReference for PopulationReference {
    fn percentile(&self, key: &ConstraintKeyId, value: f64) -> Option<f64> {
        let sorted = self.distributions.get(key)?;
        let direction = self.directions.get(key)?;
        Some(compute_percentile(sorted, value, *direction))
    }

    fn weight(&self, key: &ConstraintKeyId) -> Option<f64> {
        self.weights.get(key).copied()
    }
}
