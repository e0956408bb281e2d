//! Bootstrap stability experiment over reference size.
//!
//! For each protocol the experiment freezes a held-out test set, then for
//! every target reference size N draws bootstrap samples from the train
//! pool, rebuilds the reference per draw, and compares test-set scores
//! against the train-pool baseline. Per-(protocol, N) aggregates of the
//! comparison metrics feed the plateau fit.
//!
//! Cells are mutually independent: each (protocol, N, iteration) owns a
//! hash-derived RNG seed, so the optional worker pool produces results
//! bit-identical to the sequential order. Cancellation is cooperative and
//! partial aggregates stay valid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fmt, thread};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constraint_key::StructureAliasTable;
use crate::curve_fit::{estimate_n_star, FitPoint, NStarEstimate};
use crate::plan::{validate_unique_identities, Plan, PlanEvaluation, PlanId};
use crate::plan_score::score_plan;
use crate::population_reference::PopulationReference;
use crate::protocol_catalog::{ProtocolCatalog, RawConstraint, WeightPolicy};
use crate::sampling::{
    bootstrap_indices, derive_cell_seed, derive_split_seed, permutation, DeterministicRng,
};
use crate::score_metrics::{
    bottom_decile_agreement, ks_distance, mean_absolute_error, summarize, wasserstein_distance,
    MetricSummary,
};
use crate::shrinkage::blend;

pub const STABILITY_COMPONENT: &str = "stability_experiment";

const ERROR_EMPTY_SAMPLE_SIZES: &str = "PE-CFG-1001";
const ERROR_ZERO_SAMPLE_SIZE: &str = "PE-CFG-1002";
const ERROR_ZERO_BOOTSTRAPS: &str = "PE-CFG-1003";
const ERROR_TEST_FRACTION: &str = "PE-CFG-1004";
const ERROR_ZERO_TEST_MINIMUM: &str = "PE-CFG-1005";
const ERROR_ZERO_MIN_VALID: &str = "PE-CFG-1006";
const ERROR_SHRINKAGE_CONSTANT: &str = "PE-CFG-1007";
const ERROR_PLATEAU_FRACTION: &str = "PE-CFG-1008";
const ERROR_FIT_THRESHOLD: &str = "PE-CFG-1009";
const ERROR_ZERO_WORKERS: &str = "PE-CFG-1010";
const ERROR_STRUCTURE_OVERLAP: &str = "PE-CFG-1011";

const ERROR_MISSING_CONSTRAINTS: &str = "PE-DATA-1001";
const ERROR_NO_ELIGIBLE_PLANS: &str = "PE-DATA-1002";
const ERROR_SPLIT_INFEASIBLE: &str = "PE-DATA-1003";
const ERROR_TEST_BELOW_MINIMUM: &str = "PE-DATA-1004";
const ERROR_NO_FEASIBLE_SIZE: &str = "PE-DATA-1005";
const ERROR_DUPLICATE_IDENTITY: &str = "PE-DATA-1006";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Shrinkage blending toggle. The constant has no default; enabling
/// shrinkage means supplying a k.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShrinkageSettings {
    pub k: f64,
}

/// Immutable experiment configuration. Validated before any computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Target reference sizes; deduplicated and sorted ascending on use.
    pub sample_sizes: Vec<usize>,
    /// Bootstrap iterations per (protocol, N).
    pub bootstraps: u32,
    /// Held-out fraction of eligible plans.
    pub test_fraction: f64,
    /// Minimum absolute held-out size; protocols that cannot grant it are
    /// skipped.
    pub test_min: usize,
    /// Minimum jointly-scoreable test plans for an iteration to count.
    pub min_valid_plans: usize,
    /// Observation count under which a reference key is flagged
    /// low-confidence.
    pub min_observations: usize,
    /// Token-overlap floor for fuzzy structure matching (exclusive).
    pub min_structure_overlap: f64,
    pub weight_policy: WeightPolicy,
    pub shrinkage: Option<ShrinkageSettings>,
    /// Remaining-improvement fraction that defines the plateau.
    pub plateau_fraction: f64,
    /// R-squared under which a fit is not usable.
    pub fit_r2_threshold: f64,
    pub base_seed: u64,
    /// Worker threads for bootstrap cells; 1 runs sequentially.
    pub worker_threads: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            sample_sizes: vec![10, 20, 30, 50, 75, 100],
            bootstraps: 100,
            test_fraction: 0.2,
            test_min: 20,
            min_valid_plans: 10,
            min_observations: 1,
            min_structure_overlap: 0.0,
            weight_policy: WeightPolicy::default(),
            shrinkage: None,
            plateau_fraction: 0.10,
            fit_r2_threshold: 0.5,
            base_seed: 7,
            worker_threads: 1,
        }
    }
}

impl ExperimentConfig {
    /// Fails fast on any invalid field, before data is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_sizes.is_empty() {
            return Err(ConfigError::EmptySampleSizes);
        }
        if self.sample_sizes.contains(&0) {
            return Err(ConfigError::ZeroSampleSize);
        }
        if self.bootstraps == 0 {
            return Err(ConfigError::ZeroBootstraps);
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ConfigError::TestFractionOutOfRange {
                value: self.test_fraction,
            });
        }
        if self.test_min == 0 {
            return Err(ConfigError::ZeroTestMinimum);
        }
        if self.min_valid_plans == 0 {
            return Err(ConfigError::ZeroMinimumValidPlans);
        }
        if let Some(shrinkage) = &self.shrinkage {
            if !(shrinkage.k > 0.0) {
                return Err(ConfigError::NonPositiveShrinkageConstant { k: shrinkage.k });
            }
        }
        if !(self.plateau_fraction > 0.0 && self.plateau_fraction < 1.0) {
            return Err(ConfigError::PlateauFractionOutOfRange {
                value: self.plateau_fraction,
            });
        }
        if !self.fit_r2_threshold.is_finite() {
            return Err(ConfigError::NonFiniteFitThreshold {
                value: self.fit_r2_threshold,
            });
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkerThreads);
        }
        if !(0.0..1.0).contains(&self.min_structure_overlap) {
            return Err(ConfigError::StructureOverlapOutOfRange {
                value: self.min_structure_overlap,
            });
        }
        Ok(())
    }

    fn normalized_sample_sizes(&self) -> Vec<usize> {
        let mut sizes = self.sample_sizes.clone();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }
}

/// Fatal configuration error, surfaced before any computation starts.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigError {
    #[error("sample size list is empty")]
    EmptySampleSizes,
    #[error("sample sizes must be positive")]
    ZeroSampleSize,
    #[error("bootstrap iteration count must be positive")]
    ZeroBootstraps,
    #[error("test fraction {value} is outside (0, 1)")]
    TestFractionOutOfRange { value: f64 },
    #[error("minimum test size must be positive")]
    ZeroTestMinimum,
    #[error("minimum valid plan count must be positive")]
    ZeroMinimumValidPlans,
    #[error("shrinkage constant must be positive, got {k}")]
    NonPositiveShrinkageConstant { k: f64 },
    #[error("plateau fraction {value} is outside (0, 1)")]
    PlateauFractionOutOfRange { value: f64 },
    #[error("fit r2 threshold {value} is not finite")]
    NonFiniteFitThreshold { value: f64 },
    #[error("worker thread count must be positive")]
    ZeroWorkerThreads,
    #[error("structure overlap floor {value} is outside [0, 1)")]
    StructureOverlapOutOfRange { value: f64 },
}

impl ConfigError {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::EmptySampleSizes => ERROR_EMPTY_SAMPLE_SIZES,
            Self::ZeroSampleSize => ERROR_ZERO_SAMPLE_SIZE,
            Self::ZeroBootstraps => ERROR_ZERO_BOOTSTRAPS,
            Self::TestFractionOutOfRange { .. } => ERROR_TEST_FRACTION,
            Self::ZeroTestMinimum => ERROR_ZERO_TEST_MINIMUM,
            Self::ZeroMinimumValidPlans => ERROR_ZERO_MIN_VALID,
            Self::NonPositiveShrinkageConstant { .. } => ERROR_SHRINKAGE_CONSTANT,
            Self::PlateauFractionOutOfRange { .. } => ERROR_PLATEAU_FRACTION,
            Self::NonFiniteFitThreshold { .. } => ERROR_FIT_THRESHOLD,
            Self::ZeroWorkerThreads => ERROR_ZERO_WORKERS,
            Self::StructureOverlapOutOfRange { .. } => ERROR_STRUCTURE_OVERLAP,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// One protocol's worth of loader output: its constraint definitions and
/// the evaluations of its approved plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolDataset {
    pub protocol_name: String,
    pub constraints: Vec<RawConstraint>,
    pub evaluations: Vec<PlanEvaluation>,
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a protocol was excluded from the analysis. Recorded, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingConstraints,
    NoEligiblePlans,
    InsufficientPlansForSplit,
    TestSetBelowMinimum,
    NoFeasibleSampleSize,
    DuplicatePlanIdentity,
}

impl SkipReason {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::MissingConstraints => ERROR_MISSING_CONSTRAINTS,
            Self::NoEligiblePlans => ERROR_NO_ELIGIBLE_PLANS,
            Self::InsufficientPlansForSplit => ERROR_SPLIT_INFEASIBLE,
            Self::TestSetBelowMinimum => ERROR_TEST_BELOW_MINIMUM,
            Self::NoFeasibleSampleSize => ERROR_NO_FEASIBLE_SIZE,
            Self::DuplicatePlanIdentity => ERROR_DUPLICATE_IDENTITY,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MissingConstraints => "missing_constraints",
            Self::NoEligiblePlans => "no_eligible_plans",
            Self::InsufficientPlansForSplit => "insufficient_plans_for_split",
            Self::TestSetBelowMinimum => "test_set_below_minimum",
            Self::NoFeasibleSampleSize => "no_feasible_sample_size",
            Self::DuplicatePlanIdentity => "duplicate_plan_identity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedProtocol {
    pub protocol_name: String,
    pub plans_total: usize,
    pub reason: SkipReason,
}

/// One kept bootstrap iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityRun {
    pub n: usize,
    pub iteration: u32,
    /// Test plans scoreable under both the sampled and baseline reference.
    pub valid_plans: usize,
    pub mae: f64,
    pub ks: f64,
    pub wasserstein: f64,
    pub bottom_decile_agreement: f64,
}

/// Aggregates of one (protocol, N) cell across bootstrap iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSummary {
    pub n: usize,
    /// Iterations that met the valid-plan minimum.
    pub bootstrap_runs: usize,
    /// Iterations discarded for falling short of it.
    pub discarded_runs: usize,
    pub valid_plans_median: Option<f64>,
    pub valid_plans_min: Option<usize>,
    pub mae: Option<MetricSummary>,
    pub ks: Option<MetricSummary>,
    pub wasserstein: Option<MetricSummary>,
    pub bottom_decile_agreement: Option<MetricSummary>,
}

/// Full stability outcome of one protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStability {
    pub protocol_name: String,
    pub plans_total: usize,
    pub plans_eligible: usize,
    pub train_size: usize,
    pub test_size: usize,
    pub constraints_total: usize,
    pub constraints_with_values: usize,
    /// Configured sizes that fit the train pool, ascending.
    pub feasible_sample_sizes: Vec<usize>,
    pub test_plan_ids: Vec<PlanId>,
    /// Raw kept iterations, ordered by (n, iteration).
    pub runs: Vec<StabilityRun>,
    pub cells: Vec<CellSummary>,
    /// Plateau estimate fitted on the MAE medians.
    pub n_star: NStarEstimate,
}

/// Typed log record appended to the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityLogEvent {
    pub component: String,
    pub protocol: Option<String>,
    pub event: String,
    pub outcome: String,
    pub error_code: Option<String>,
}

/// Everything the experiment produces, serializable as one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub config: ExperimentConfig,
    pub protocols: Vec<ProtocolStability>,
    pub skipped: Vec<SkippedProtocol>,
    pub events: Vec<StabilityLogEvent>,
    /// True when the run stopped early via the cancellation flag. The
    /// aggregates present are complete for every finished cell.
    pub cancelled: bool,
    pub total_runs: usize,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative stop signal. Checked between cells; in-flight iterations
/// finish and their aggregates remain valid.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<AtomicBool>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Experiment
// ---------------------------------------------------------------------------

/// Validated, immutable experiment driver.
#[derive(Debug, Clone)]
pub struct StabilityExperiment {
    config: ExperimentConfig,
}

/// Per-protocol state frozen before any bootstrap cell runs.
struct PreparedProtocol {
    catalog: ProtocolCatalog,
    full_reference: PopulationReference,
    train: Vec<Plan>,
    test: Vec<Plan>,
    plans_total: usize,
    plans_eligible: usize,
    feasible_sizes: Vec<usize>,
}

impl StabilityExperiment {
    pub fn new(config: ExperimentConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn run(
        &self,
        datasets: &[ProtocolDataset],
        aliases: &StructureAliasTable,
    ) -> StabilityReport {
        self.run_with_cancellation(datasets, aliases, &CancellationFlag::new())
    }

    /// Runs the experiment, checking `cancel` between cells. A cancelled
    /// run returns valid partial aggregates and `cancelled = true`.
    pub fn run_with_cancellation(
        &self,
        datasets: &[ProtocolDataset],
        aliases: &StructureAliasTable,
        cancel: &CancellationFlag,
    ) -> StabilityReport {
        let sizes = self.config.normalized_sample_sizes();
        let mut events = Vec::new();
        let mut skipped = Vec::new();
        let mut prepared: Vec<PreparedProtocol> = Vec::new();

        for dataset in datasets {
            match self.prepare_protocol(dataset, aliases, &sizes) {
                Ok(protocol) => {
                    events.push(StabilityLogEvent {
                        component: STABILITY_COMPONENT.to_string(),
                        protocol: Some(dataset.protocol_name.clone()),
                        event: "train_test_split".to_string(),
                        outcome: "ok".to_string(),
                        error_code: None,
                    });
                    prepared.push(protocol);
                }
                Err(reason) => {
                    events.push(StabilityLogEvent {
                        component: STABILITY_COMPONENT.to_string(),
                        protocol: Some(dataset.protocol_name.clone()),
                        event: "protocol_skipped".to_string(),
                        outcome: reason.to_string(),
                        error_code: Some(reason.stable_code().to_string()),
                    });
                    skipped.push(SkippedProtocol {
                        protocol_name: dataset.protocol_name.clone(),
                        plans_total: dataset.evaluations.len(),
                        reason,
                    });
                }
            }
        }

        // Generic pooled reference across all prepared protocols; only
        // needed when shrinkage is configured.
        let generic_reference = self.config.shrinkage.as_ref().map(|_| {
            PopulationReference::merge(
                "pooled",
                prepared.iter().map(|p| &p.full_reference),
                self.config.min_observations,
            )
        });

        let mut protocols = Vec::new();
        let mut cancelled = false;
        let mut total_runs = 0;

        for protocol in &prepared {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let outcome =
                self.run_protocol(protocol, generic_reference.as_ref(), cancel, &mut events);
            cancelled = cancelled || cancel.is_cancelled();
            total_runs += outcome.runs.len();
            protocols.push(outcome);
        }

        events.push(StabilityLogEvent {
            component: STABILITY_COMPONENT.to_string(),
            protocol: None,
            event: "experiment_completed".to_string(),
            outcome: if cancelled { "cancelled" } else { "ok" }.to_string(),
            error_code: None,
        });

        StabilityReport {
            config: self.config.clone(),
            protocols,
            skipped,
            events,
            cancelled,
            total_runs,
        }
    }

    /// Compiles the catalog, matches plans, applies eligibility, and
    /// freezes the train/test split.
    fn prepare_protocol(
        &self,
        dataset: &ProtocolDataset,
        aliases: &StructureAliasTable,
        sizes: &[usize],
    ) -> Result<PreparedProtocol, SkipReason> {
        let catalog = ProtocolCatalog::compile(
            &dataset.protocol_name,
            &dataset.constraints,
            &self.config.weight_policy,
        );
        if catalog.is_empty() {
            return Err(SkipReason::MissingConstraints);
        }

        let plans: Vec<Plan> = dataset
            .evaluations
            .iter()
            .filter(|evaluation| evaluation.is_approved)
            .map(|evaluation| {
                Plan::match_evaluation(
                    evaluation,
                    &catalog,
                    aliases,
                    self.config.min_structure_overlap,
                )
            })
            .collect();
        if validate_unique_identities(&plans).is_err() {
            return Err(SkipReason::DuplicatePlanIdentity);
        }

        // Eligibility: scoreable against the full-cohort reference.
        let cohort_reference =
            PopulationReference::build(&catalog, &plans, self.config.min_observations);
        let eligible: Vec<Plan> = plans
            .iter()
            .filter(|plan| score_plan(*plan, &cohort_reference).composite.is_some())
            .cloned()
            .collect();
        if eligible.is_empty() {
            return Err(SkipReason::NoEligiblePlans);
        }

        let eligible_count = eligible.len();
        let min_size = *sizes.first().expect("validated non-empty");
        let mut test_size = (self.config.test_fraction * eligible_count as f64).round() as usize;
        test_size = test_size.max(self.config.test_min);
        let max_test = eligible_count.saturating_sub(min_size);
        if max_test == 0 {
            return Err(SkipReason::InsufficientPlansForSplit);
        }
        test_size = test_size.min(max_test);
        if test_size < self.config.test_min {
            return Err(SkipReason::TestSetBelowMinimum);
        }

        let mut rng = DeterministicRng::seeded(derive_split_seed(
            self.config.base_seed,
            &dataset.protocol_name,
        ));
        let permuted = permutation(&mut rng, eligible_count);
        let test: Vec<Plan> = permuted[..test_size]
            .iter()
            .map(|i| eligible[*i].clone())
            .collect();
        let train: Vec<Plan> = permuted[test_size..]
            .iter()
            .map(|i| eligible[*i].clone())
            .collect();

        let feasible_sizes: Vec<usize> = sizes
            .iter()
            .copied()
            .filter(|size| *size <= train.len())
            .collect();
        if feasible_sizes.is_empty() {
            return Err(SkipReason::NoFeasibleSampleSize);
        }

        Ok(PreparedProtocol {
            catalog,
            full_reference: cohort_reference,
            train,
            test,
            plans_total: dataset.evaluations.len(),
            plans_eligible: eligible_count,
            feasible_sizes,
        })
    }

    fn run_protocol(
        &self,
        protocol: &PreparedProtocol,
        generic: Option<&PopulationReference>,
        cancel: &CancellationFlag,
        events: &mut Vec<StabilityLogEvent>,
    ) -> ProtocolStability {
        let baseline_reference = PopulationReference::build(
            &protocol.catalog,
            &protocol.train,
            self.config.min_observations,
        );
        let baseline_scores =
            self.score_test_set(protocol, &baseline_reference, protocol.train.len(), generic);

        let mut runs: Vec<StabilityRun> = Vec::new();
        let mut completed_sizes: Vec<usize> = Vec::new();
        for &n in &protocol.feasible_sizes {
            if cancel.is_cancelled() {
                break;
            }
            let mut cell_runs = self.run_cell(protocol, generic, &baseline_scores, n);
            runs.append(&mut cell_runs);
            completed_sizes.push(n);
            events.push(StabilityLogEvent {
                component: STABILITY_COMPONENT.to_string(),
                protocol: Some(protocol.catalog.protocol_name.clone()),
                event: format!("cell_aggregated_n{n}"),
                outcome: "ok".to_string(),
                error_code: None,
            });
        }

        // Deterministic regardless of completion order.
        runs.sort_by_key(|run| (run.n, run.iteration));

        // Cells interrupted by cancellation are omitted rather than
        // reported as empty; finished cells stay valid.
        let cells: Vec<CellSummary> = completed_sizes
            .iter()
            .map(|&n| aggregate_cell(n, self.config.bootstraps, &runs))
            .collect();

        let fit_points: Vec<FitPoint> = cells
            .iter()
            .filter_map(|cell| {
                cell.mae.as_ref().map(|mae| FitPoint {
                    n: cell.n,
                    value: mae.median,
                })
            })
            .collect();
        let n_star = estimate_n_star(
            &fit_points,
            self.config.plateau_fraction,
            self.config.fit_r2_threshold,
        );
        events.push(StabilityLogEvent {
            component: STABILITY_COMPONENT.to_string(),
            protocol: Some(protocol.catalog.protocol_name.clone()),
            event: "plateau_fit".to_string(),
            outcome: if n_star.n_star.is_some() { "ok" } else { "not_usable" }.to_string(),
            error_code: n_star.diagnostic.map(|d| d.stable_code().to_string()),
        });

        ProtocolStability {
            protocol_name: protocol.catalog.protocol_name.clone(),
            plans_total: protocol.plans_total,
            plans_eligible: protocol.plans_eligible,
            train_size: protocol.train.len(),
            test_size: protocol.test.len(),
            constraints_total: protocol.full_reference.constraints_total(),
            constraints_with_values: protocol.full_reference.constraints_with_values(),
            feasible_sample_sizes: protocol.feasible_sizes.clone(),
            test_plan_ids: protocol.test.iter().map(|p| p.plan_id.clone()).collect(),
            runs,
            cells,
            n_star,
        }
    }

    /// Runs every bootstrap iteration of one (protocol, N) cell, fanning
    /// out over scoped workers when configured.
    fn run_cell(
        &self,
        protocol: &PreparedProtocol,
        generic: Option<&PopulationReference>,
        baseline_scores: &[Option<f64>],
        n: usize,
    ) -> Vec<StabilityRun> {
        let iterations: Vec<u32> = (0..self.config.bootstraps).collect();
        if self.config.worker_threads <= 1 {
            return iterations
                .iter()
                .filter_map(|&iteration| {
                    self.run_iteration(protocol, generic, baseline_scores, n, iteration)
                })
                .collect();
        }

        let chunk_len = iterations.len().div_ceil(self.config.worker_threads);
        let mut runs = Vec::new();
        thread::scope(|scope| {
            let handles: Vec<_> = iterations
                .chunks(chunk_len)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .filter_map(|&iteration| {
                                self.run_iteration(
                                    protocol,
                                    generic,
                                    baseline_scores,
                                    n,
                                    iteration,
                                )
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            for handle in handles {
                runs.extend(handle.join().expect("bootstrap worker panicked"));
            }
        });
        runs
    }

    /// One bootstrap iteration. `None` when too few test plans were
    /// jointly scoreable.
    fn run_iteration(
        &self,
        protocol: &PreparedProtocol,
        generic: Option<&PopulationReference>,
        baseline_scores: &[Option<f64>],
        n: usize,
        iteration: u32,
    ) -> Option<StabilityRun> {
        let seed = derive_cell_seed(
            self.config.base_seed,
            &protocol.catalog.protocol_name,
            n,
            iteration,
        );
        let mut rng = DeterministicRng::seeded(seed);
        let indices = bootstrap_indices(&mut rng, protocol.train.len(), n);
        let sample_reference = PopulationReference::build(
            &protocol.catalog,
            indices.iter().map(|i| &protocol.train[*i]),
            self.config.min_observations,
        );
        let sample_scores = self.score_test_set(protocol, &sample_reference, n, generic);

        let mut sampled = Vec::new();
        let mut baseline = Vec::new();
        for (sample, full) in sample_scores.iter().zip(baseline_scores) {
            if let (Some(sample), Some(full)) = (sample, full) {
                sampled.push(*sample);
                baseline.push(*full);
            }
        }
        if sampled.len() < self.config.min_valid_plans {
            return None;
        }

        Some(StabilityRun {
            n,
            iteration,
            valid_plans: sampled.len(),
            mae: mean_absolute_error(&sampled, &baseline)?,
            ks: ks_distance(&sampled, &baseline)?,
            wasserstein: wasserstein_distance(&sampled, &baseline)?,
            bottom_decile_agreement: bottom_decile_agreement(&sampled, &baseline)?,
        })
    }

    /// Scores the held-out set against a reference, blending with the
    /// pooled reference when shrinkage is configured.
    fn score_test_set(
        &self,
        protocol: &PreparedProtocol,
        reference: &PopulationReference,
        reference_plan_count: usize,
        generic: Option<&PopulationReference>,
    ) -> Vec<Option<f64>> {
        match (self.config.shrinkage.as_ref(), generic) {
            (Some(settings), Some(generic)) => {
                let blended = blend(reference, generic, reference_plan_count, settings.k)
                    .expect("validated shrinkage constant");
                protocol
                    .test
                    .iter()
                    .map(|plan| score_plan(plan, &blended).composite)
                    .collect()
            }
            _ => protocol
                .test
                .iter()
                .map(|plan| score_plan(plan, reference).composite)
                .collect(),
        }
    }
}

fn aggregate_cell(n: usize, bootstraps: u32, runs: &[StabilityRun]) -> CellSummary {
    let cell_runs: Vec<&StabilityRun> = runs.iter().filter(|run| run.n == n).collect();
    let kept = cell_runs.len();
    let discarded = bootstraps as usize - kept;

    let collect = |f: fn(&StabilityRun) -> f64| -> Vec<f64> {
        cell_runs.iter().map(|run| f(run)).collect()
    };
    let valid_counts: Vec<f64> = cell_runs.iter().map(|run| run.valid_plans as f64).collect();

    CellSummary {
        n,
        bootstrap_runs: kept,
        discarded_runs: discarded,
        valid_plans_median: summarize(&valid_counts).map(|s| s.median),
        valid_plans_min: cell_runs.iter().map(|run| run.valid_plans).min(),
        mae: summarize(&collect(|run| run.mae)),
        ks: summarize(&collect(|run| run.ks)),
        wasserstein: summarize(&collect(|run| run.wasserstein)),
        bottom_decile_agreement: summarize(&collect(|run| run.bottom_decile_agreement)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Experiment-level behavior is covered by the integration suite; the
    // unit tests here pin configuration validation and aggregation.

    #[test]
    fn default_config_is_valid() {
        assert!(ExperimentConfig::default().validate().is_ok());
    }

    #[test]
    fn invalid_configs_fail_fast_with_stable_codes() {
        let cases: Vec<(ExperimentConfig, &str)> = vec![
            (
                ExperimentConfig {
                    sample_sizes: vec![],
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1001",
            ),
            (
                ExperimentConfig {
                    sample_sizes: vec![0, 10],
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1002",
            ),
            (
                ExperimentConfig {
                    bootstraps: 0,
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1003",
            ),
            (
                ExperimentConfig {
                    test_fraction: 1.0,
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1004",
            ),
            (
                ExperimentConfig {
                    shrinkage: Some(ShrinkageSettings { k: 0.0 }),
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1007",
            ),
            (
                ExperimentConfig {
                    plateau_fraction: 0.0,
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1008",
            ),
            (
                ExperimentConfig {
                    worker_threads: 0,
                    ..ExperimentConfig::default()
                },
                "PE-CFG-1010",
            ),
        ];
        for (config, code) in cases {
            let err = config.validate().unwrap_err();
            assert_eq!(err.stable_code(), code);
            assert!(StabilityExperiment::new(config).is_err());
        }
    }

    #[test]
    fn sample_sizes_are_deduplicated_and_sorted() {
        let config = ExperimentConfig {
            sample_sizes: vec![50, 10, 50, 20],
            ..ExperimentConfig::default()
        };
        assert_eq!(config.normalized_sample_sizes(), vec![10, 20, 50]);
    }

    #[test]
    fn aggregate_cell_counts_discarded_iterations() {
        let runs = vec![
            StabilityRun {
                n: 10,
                iteration: 0,
                valid_plans: 12,
                mae: 0.05,
                ks: 0.2,
                wasserstein: 0.04,
                bottom_decile_agreement: 0.9,
            },
            StabilityRun {
                n: 10,
                iteration: 2,
                valid_plans: 14,
                mae: 0.07,
                ks: 0.3,
                wasserstein: 0.06,
                bottom_decile_agreement: 0.8,
            },
        ];
        let cell = aggregate_cell(10, 5, &runs);
        assert_eq!(cell.bootstrap_runs, 2);
        assert_eq!(cell.discarded_runs, 3);
        assert_eq!(cell.valid_plans_min, Some(12));
        assert_eq!(cell.valid_plans_median, Some(13.0));
        let mae = cell.mae.expect("mae summary");
        assert!((mae.median - 0.06).abs() < 1e-12);
        assert!((mae.mean - 0.06).abs() < 1e-12);
    }

    #[test]
    fn aggregate_cell_with_no_kept_runs_is_all_none() {
        let cell = aggregate_cell(20, 5, &[]);
        assert_eq!(cell.bootstrap_runs, 0);
        assert_eq!(cell.discarded_runs, 5);
        assert_eq!(cell.mae, None);
        assert_eq!(cell.valid_plans_median, None);
    }

    #[test]
    fn cancellation_flag_round_trip() {
        let flag = CancellationFlag::new();
        assert!(!flag.is_cancelled());
        let shared = flag.clone();
        shared.cancel();
        assert!(flag.is_cancelled());
    }
}
