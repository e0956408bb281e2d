//! Canonical constraint identity.
//!
//! A constraint evaluated for a plan and a constraint declared by a protocol
//! are "the same" iff their canonical keys are equal. The key carries the
//! canonical structure, the metric display, both thresholds, and the
//! priority, so template protocols that declare several variants over one
//! structure/metric stay distinguishable. All textual fields are normalized
//! (trim, casefold, whitespace collapse) before key construction so that
//! formatting differences cannot create spurious duplicates.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ERROR_UNRESOLVABLE_STRUCTURE: &str = "PE-KEY-1001";
const ERROR_MISSING_METRIC_DISPLAY: &str = "PE-KEY-1002";

/// Trims, casefolds, and collapses internal whitespace. Empty input (after
/// trimming) normalizes to `None` rather than an empty string.
pub fn normalize_text(raw: &str) -> Option<String> {
    let collapsed = raw
        .split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Extracts a finite numeric value from a loosely-typed field. Accepts JSON
/// numbers and numeric strings; booleans, nulls, and everything else are
/// `None`. Missing values stay missing; they are never coerced to zero.
pub fn parse_numeric(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(number) => number.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(text) => {
            let cleaned = text.trim();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Extracts a priority rank. Accepts integers and integer strings.
pub fn parse_priority(value: Option<&serde_json::Value>) -> Option<u32> {
    let numeric = parse_numeric(value)?;
    if numeric < 0.0 || numeric.fract() != 0.0 || numeric > u32::MAX as f64 {
        return None;
    }
    Some(numeric as u32)
}

// ---------------------------------------------------------------------------
// Bound operators and scoring direction
// ---------------------------------------------------------------------------

/// Whether smaller or larger achieved values are preferable for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    LowerIsBetter,
    HigherIsBetter,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LowerIsBetter => f.write_str("lower"),
            Self::HigherIsBetter => f.write_str("higher"),
        }
    }
}

/// Comparison operator of a goal or variation bound.
///
/// A record without a bound carries the explicit `Unconstrained` variant;
/// it participates in key equality, so two records both lacking a goal
/// still match on that field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundOperator {
    LessEqual,
    Less,
    GreaterEqual,
    Greater,
    /// Operator text the engine does not interpret (kept normalized).
    Other(String),
    Unconstrained,
}

impl BoundOperator {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::Unconstrained;
        };
        match raw.trim() {
            "" => Self::Unconstrained,
            "<=" => Self::LessEqual,
            "<" => Self::Less,
            ">=" => Self::GreaterEqual,
            ">" => Self::Greater,
            other => Self::Other(other.to_lowercase()),
        }
    }

    /// Scoring direction implied by the operator, if any.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Self::LessEqual | Self::Less => Some(Direction::LowerIsBetter),
            Self::GreaterEqual | Self::Greater => Some(Direction::HigherIsBetter),
            Self::Other(_) | Self::Unconstrained => None,
        }
    }

    fn key_fragment(&self) -> &str {
        match self {
            Self::LessEqual => "<=",
            Self::Less => "<",
            Self::GreaterEqual => ">=",
            Self::Greater => ">",
            Self::Other(text) => text,
            Self::Unconstrained => "",
        }
    }
}

/// One threshold of a constraint: operator plus optional numeric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintBound {
    pub operator: BoundOperator,
    pub value: Option<f64>,
}

impl ConstraintBound {
    pub fn unconstrained() -> Self {
        Self {
            operator: BoundOperator::Unconstrained,
            value: None,
        }
    }

    pub fn new(operator: Option<&str>, value: Option<f64>) -> Self {
        Self {
            operator: BoundOperator::parse(operator),
            value,
        }
    }
}

// ---------------------------------------------------------------------------
// ConstraintKey and its canonical identifier
// ---------------------------------------------------------------------------

/// Canonical identifier of a constraint, stable across protocol sources and
/// evaluation records. Used as the map key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstraintKeyId(pub String);

impl fmt::Display for ConstraintKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured constraint identity. Equality of the derived [`ConstraintKeyId`]
/// defines sameness of two constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintKey {
    /// Canonical structure name, normalized.
    pub structure: String,
    /// Metric display text, normalized.
    pub metric_display: String,
    pub goal: ConstraintBound,
    pub variation: ConstraintBound,
    pub priority: Option<u32>,
}

impl ConstraintKey {
    /// Canonical `||`-joined identifier. Absent fields render empty, so a
    /// record missing its variation matches another record missing its
    /// variation.
    pub fn id(&self) -> ConstraintKeyId {
        let mut parts: Vec<String> = Vec::with_capacity(7);
        parts.push(self.structure.clone());
        parts.push(self.metric_display.clone());
        parts.push(self.goal.operator.key_fragment().to_string());
        parts.push(format_value(self.goal.value));
        parts.push(self.variation.operator.key_fragment().to_string());
        parts.push(format_value(self.variation.value));
        parts.push(match self.priority {
            Some(priority) => priority.to_string(),
            None => String::new(),
        });
        ConstraintKeyId(parts.join("||"))
    }

    /// Direction derived from the goal operator; `None` means the key
    /// cannot be percentile-scored.
    pub fn direction(&self) -> Option<Direction> {
        self.goal.operator.direction()
    }
}

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v}"),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Structure alias table
// ---------------------------------------------------------------------------

/// Maps normalized alias spellings to canonical structure names. Canonical
/// names are registered as aliases of themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureAliasTable {
    aliases: BTreeMap<String, String>,
}

impl StructureAliasTable {
    pub fn new<I, A>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, A)>,
        A: IntoIterator<Item = String>,
    {
        let mut aliases = BTreeMap::new();
        for (canonical, alias_list) in entries {
            if let Some(canonical_norm) = normalize_text(&canonical) {
                aliases.insert(canonical_norm, canonical.clone());
            }
            for alias in alias_list {
                if let Some(alias_norm) = normalize_text(&alias) {
                    aliases.insert(alias_norm, canonical.clone());
                }
            }
        }
        Self { aliases }
    }

    /// Looks up an already-normalized name.
    pub fn canonical_for(&self, normalized: &str) -> Option<&str> {
        self.aliases.get(normalized).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Resolution failures
// ---------------------------------------------------------------------------

/// Per-record resolution failure. Recovered locally by dropping the record;
/// never aborts a batch.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveError {
    #[error("structure `{raw}` cannot be resolved to a canonical name")]
    UnresolvableStructure { raw: String },
    #[error("constraint on `{structure}` carries neither metric display nor objective")]
    MissingMetricDisplay { structure: String },
}

impl ResolveError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::UnresolvableStructure { .. } => ERROR_UNRESOLVABLE_STRUCTURE,
            Self::MissingMetricDisplay { .. } => ERROR_MISSING_METRIC_DISPLAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(structure: &str, metric: &str, goal_op: Option<&str>, goal_value: Option<f64>) -> ConstraintKey {
        ConstraintKey {
            structure: normalize_text(structure).unwrap(),
            metric_display: normalize_text(metric).unwrap(),
            goal: ConstraintBound::new(goal_op, goal_value),
            variation: ConstraintBound::unconstrained(),
            priority: Some(1),
        }
    }

    // ── normalize_text ────────────────────────────────────────────

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize_text("  Spinal   CORD  "), Some("spinal cord".into()));
    }

    #[test]
    fn normalize_empty_is_none() {
        assert_eq!(normalize_text("   "), None);
    }

    // ── parse_numeric / parse_priority ────────────────────────────

    #[test]
    fn numeric_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse_numeric(Some(&json!(45.0))), Some(45.0));
        assert_eq!(parse_numeric(Some(&json!(" 45.5 "))), Some(45.5));
    }

    #[test]
    fn numeric_rejects_bools_nulls_and_text() {
        assert_eq!(parse_numeric(Some(&json!(true))), None);
        assert_eq!(parse_numeric(Some(&json!(null))), None);
        assert_eq!(parse_numeric(Some(&json!("n/a"))), None);
        assert_eq!(parse_numeric(None), None);
    }

    #[test]
    fn priority_rejects_fractions_and_negatives() {
        assert_eq!(parse_priority(Some(&json!(1))), Some(1));
        assert_eq!(parse_priority(Some(&json!("2"))), Some(2));
        assert_eq!(parse_priority(Some(&json!(1.5))), None);
        assert_eq!(parse_priority(Some(&json!(-1))), None);
    }

    // ── BoundOperator ─────────────────────────────────────────────

    #[test]
    fn operator_parse_and_direction() {
        assert_eq!(BoundOperator::parse(Some("<=")), BoundOperator::LessEqual);
        assert_eq!(
            BoundOperator::parse(Some("<=")).direction(),
            Some(Direction::LowerIsBetter)
        );
        assert_eq!(
            BoundOperator::parse(Some(">")).direction(),
            Some(Direction::HigherIsBetter)
        );
        assert_eq!(BoundOperator::parse(None), BoundOperator::Unconstrained);
        assert_eq!(BoundOperator::parse(Some("  ")), BoundOperator::Unconstrained);
        assert_eq!(
            BoundOperator::parse(Some("IS")),
            BoundOperator::Other("is".into())
        );
        assert_eq!(BoundOperator::parse(Some("is")).direction(), None);
    }

    // ── ConstraintKey identity ────────────────────────────────────

    #[test]
    fn key_id_round_trips_all_fields() {
        let k = key("Spinal Cord", "D0.03cc [Gy]", Some("<="), Some(45.0));
        assert_eq!(k.id().0, "spinal cord||d0.03cc [gy]||<=||45||||||1");
    }

    #[test]
    fn keys_differing_only_in_threshold_are_distinct() {
        let a = key("PTV", "V95%", Some(">="), Some(95.0));
        let b = key("PTV", "V95%", Some(">="), Some(98.0));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn records_both_lacking_goal_match_on_that_field() {
        let a = key("PTV", "V95%", None, None);
        let b = key("PTV", "V95%", None, None);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.direction(), None);
    }

    #[test]
    fn formatting_differences_do_not_split_keys() {
        let a = key("Spinal  Cord ", "Max  Dose", Some("<="), Some(45.0));
        let b = key("spinal cord", "max dose", Some("<="), Some(45.0));
        assert_eq!(a.id(), b.id());
    }

    // ── StructureAliasTable ───────────────────────────────────────

    #[test]
    fn alias_table_resolves_aliases_and_canonicals() {
        let table = StructureAliasTable::new([(
            "SpinalCord".to_string(),
            vec!["Spinal Cord".to_string(), "cord".to_string()],
        )]);
        assert_eq!(table.canonical_for("spinal cord"), Some("SpinalCord"));
        assert_eq!(table.canonical_for("cord"), Some("SpinalCord"));
        assert_eq!(table.canonical_for("spinalcord"), Some("SpinalCord"));
        assert_eq!(table.canonical_for("bladder"), None);
    }

    // ── ResolveError ──────────────────────────────────────────────

    #[test]
    fn resolve_error_stable_codes() {
        assert_eq!(
            ResolveError::UnresolvableStructure { raw: "x".into() }.stable_code(),
            "PE-KEY-1001"
        );
        assert_eq!(
            ResolveError::MissingMetricDisplay {
                structure: "x".into()
            }
            .stable_code(),
            "PE-KEY-1002"
        );
    }
}
