//! Compiled protocol constraint sets.
//!
//! A protocol arrives as an ordered list of raw constraint records, from
//! either a canonical-standard source or a template source. Compilation
//! canonicalizes each record into a [`ConstraintKey`], keeps the first
//! occurrence per key, and derives the per-key scoring direction and weight.
//! The declared structure list (in declaration order) is what evaluation
//! results are fuzzy-matched against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constraint_key::{
    normalize_text, parse_numeric, parse_priority, ConstraintBound, ConstraintKey,
    ConstraintKeyId, Direction, ResolveError, StructureAliasTable,
};
use crate::structure_match::best_token_match;

/// One raw constraint record from a protocol definition. All fields are
/// optional at this boundary; compilation decides what is usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConstraint {
    pub structure: Option<String>,
    /// `metric.display` of the source record, when present.
    pub metric_display: Option<String>,
    /// Fallback display text used when `metric_display` is absent.
    pub objective: Option<String>,
    pub goal_operator: Option<String>,
    pub goal_value: Option<serde_json::Value>,
    pub variation_operator: Option<String>,
    pub variation_value: Option<serde_json::Value>,
    pub priority: Option<serde_json::Value>,
}

/// Metric display selection: `metric.display` if non-empty, else the
/// objective text. Both absent is a resolution failure.
pub fn resolve_metric_display(
    metric_display: Option<&str>,
    objective: Option<&str>,
    structure: &str,
) -> Result<String, ResolveError> {
    metric_display
        .and_then(normalize_text)
        .or_else(|| objective.and_then(normalize_text))
        .ok_or_else(|| ResolveError::MissingMetricDisplay {
            structure: structure.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Priority weighting
// ---------------------------------------------------------------------------

/// Maps constraint priority to its weight in the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPolicy {
    /// Priority 1 weighs 2.0; priority 2 weighs 1.0; everything else,
    /// including records without a priority, weighs 1.0.
    PriorityTiered,
    /// Explicit per-priority table; priorities not listed (and records
    /// without a priority) weigh 1.0.
    Custom(BTreeMap<u32, f64>),
}

impl Default for WeightPolicy {
    fn default() -> Self {
        Self::PriorityTiered
    }
}

impl WeightPolicy {
    pub fn weight_for(&self, priority: Option<u32>) -> f64 {
        match self {
            Self::PriorityTiered => match priority {
                Some(1) => 2.0,
                _ => 1.0,
            },
            Self::Custom(table) => priority
                .and_then(|p| table.get(&p).copied())
                .unwrap_or(1.0),
        }
    }
}

// ---------------------------------------------------------------------------
// ProtocolCatalog
// ---------------------------------------------------------------------------

/// Compiled constraint set of one protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCatalog {
    pub protocol_name: String,
    /// Canonical key metadata, first declaration wins.
    lookup: BTreeMap<ConstraintKeyId, ConstraintKey>,
    /// Declared structure names in declaration order (deduplicated).
    declared_structures: Vec<String>,
    /// Normalized structure name -> declared spelling.
    structure_map: BTreeMap<String, String>,
    directions: BTreeMap<ConstraintKeyId, Direction>,
    weights: BTreeMap<ConstraintKeyId, f64>,
    /// Records dropped during compilation, with the reason.
    dropped: Vec<ResolveError>,
}

impl ProtocolCatalog {
    pub fn compile(
        protocol_name: &str,
        records: &[RawConstraint],
        weight_policy: &WeightPolicy,
    ) -> Self {
        let mut lookup = BTreeMap::new();
        let mut declared_structures: Vec<String> = Vec::new();
        let mut structure_map = BTreeMap::new();
        let mut directions = BTreeMap::new();
        let mut weights = BTreeMap::new();
        let mut dropped = Vec::new();

        for record in records {
            let raw_structure = record.structure.as_deref().unwrap_or("");
            let Some(structure_norm) = normalize_text(raw_structure) else {
                dropped.push(ResolveError::UnresolvableStructure {
                    raw: raw_structure.to_string(),
                });
                continue;
            };
            let metric_display = match resolve_metric_display(
                record.metric_display.as_deref(),
                record.objective.as_deref(),
                raw_structure,
            ) {
                Ok(display) => display,
                Err(err) => {
                    dropped.push(err);
                    continue;
                }
            };

            if !structure_map.contains_key(&structure_norm) {
                declared_structures.push(raw_structure.trim().to_string());
                structure_map.insert(structure_norm.clone(), raw_structure.trim().to_string());
            }

            let key = ConstraintKey {
                structure: structure_norm,
                metric_display,
                goal: ConstraintBound::new(
                    record.goal_operator.as_deref(),
                    parse_numeric(record.goal_value.as_ref()),
                ),
                variation: ConstraintBound::new(
                    record.variation_operator.as_deref(),
                    parse_numeric(record.variation_value.as_ref()),
                ),
                priority: parse_priority(record.priority.as_ref()),
            };
            let key_id = key.id();
            if lookup.contains_key(&key_id) {
                continue;
            }
            if let Some(direction) = key.direction() {
                directions.insert(key_id.clone(), direction);
            }
            weights.insert(key_id.clone(), weight_policy.weight_for(key.priority));
            lookup.insert(key_id, key);
        }

        Self {
            protocol_name: protocol_name.to_string(),
            lookup,
            declared_structures,
            structure_map,
            directions,
            weights,
            dropped,
        }
    }

    /// Canonicalizes a raw structure name: alias table, then the protocol's
    /// declared names, then token-overlap matching in declaration order.
    pub fn resolve_structure(
        &self,
        raw: &str,
        aliases: &StructureAliasTable,
        min_overlap: f64,
    ) -> Result<String, ResolveError> {
        let unresolvable = || ResolveError::UnresolvableStructure {
            raw: raw.to_string(),
        };
        let normalized = normalize_text(raw).ok_or_else(unresolvable)?;
        if let Some(canonical) = aliases.canonical_for(&normalized) {
            return Ok(canonical.to_string());
        }
        if let Some(declared) = self.structure_map.get(&normalized) {
            return Ok(declared.clone());
        }
        best_token_match(
            raw,
            self.declared_structures.iter().map(String::as_str),
            min_overlap,
        )
        .map(|m| m.canonical)
        .ok_or_else(unresolvable)
    }

    pub fn contains(&self, key_id: &ConstraintKeyId) -> bool {
        self.lookup.contains_key(key_id)
    }

    pub fn constraint_meta(&self) -> &BTreeMap<ConstraintKeyId, ConstraintKey> {
        &self.lookup
    }

    pub fn directions(&self) -> &BTreeMap<ConstraintKeyId, Direction> {
        &self.directions
    }

    pub fn weights(&self) -> &BTreeMap<ConstraintKeyId, f64> {
        &self.weights
    }

    pub fn dropped(&self) -> &[ResolveError] {
        &self.dropped
    }

    /// Total declared (deduplicated) constraint count.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}
