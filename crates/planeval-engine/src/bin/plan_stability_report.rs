#![forbid(unsafe_code)]

//! Runs the stability experiment on a synthetic single-constraint cohort
//! and prints the JSON report. Exercises the whole pipeline end-to-end;
//! real cohorts come from the external loader, not from here.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use planeval_engine::constraint_key::StructureAliasTable;
use planeval_engine::plan::{PatientId, PlanEvaluation, PlanId, RawPlanResult};
use planeval_engine::protocol_catalog::RawConstraint;
use planeval_engine::sampling::DeterministicRng;
use planeval_engine::stability::{
    ExperimentConfig, ProtocolDataset, StabilityExperiment, StabilityReport,
};

const SYNTHETIC_PROTOCOL: &str = "Synthetic Uniform";
const SYNTHETIC_PLANS: usize = 100;
const SYNTHETIC_SEED: u64 = 20_260_301;

#[derive(Debug, Serialize)]
struct ReportEnvelope {
    schema_version: String,
    generated_at_utc: String,
    cohort: String,
    plan_count: usize,
    report: StabilityReport,
}

fn uniform_unit(rng: &mut DeterministicRng) -> f64 {
    // 53-bit mantissa fraction in [0, 1)
    (rng.next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

fn synthetic_dataset() -> ProtocolDataset {
    let constraint = RawConstraint {
        structure: Some("Target".into()),
        metric_display: Some("Normalized Deviation".into()),
        goal_operator: Some("<=".into()),
        goal_value: Some(json!(1.0)),
        priority: Some(json!(1)),
        ..RawConstraint::default()
    };

    let mut rng = DeterministicRng::seeded(SYNTHETIC_SEED);
    let evaluations = (0..SYNTHETIC_PLANS)
        .map(|i| PlanEvaluation {
            plan_id: PlanId(format!("synthetic-{i:03}")),
            patient_id: PatientId(format!("patient-{i:03}")),
            protocol_name: SYNTHETIC_PROTOCOL.into(),
            is_approved: true,
            attempt_number: Some(1),
            created_at: None,
            updated_at: None,
            results: vec![RawPlanResult {
                structure: Some("Target".into()),
                metric_display: Some("Normalized Deviation".into()),
                goal_operator: Some("<=".into()),
                goal_value: Some(json!(1.0)),
                priority: Some(json!(1)),
                achieved_value: Some(json!(uniform_unit(&mut rng))),
                ..RawPlanResult::default()
            }],
        })
        .collect();

    ProtocolDataset {
        protocol_name: SYNTHETIC_PROTOCOL.into(),
        constraints: vec![constraint],
        evaluations,
    }
}

fn main() -> Result<()> {
    let config = ExperimentConfig {
        bootstraps: 50,
        ..ExperimentConfig::default()
    };
    let experiment = StabilityExperiment::new(config).context("experiment configuration")?;

    let dataset = synthetic_dataset();
    let report = experiment.run(&[dataset], &StructureAliasTable::default());

    let envelope = ReportEnvelope {
        schema_version: "planeval-engine.stability-report.v1".into(),
        generated_at_utc: Utc::now().to_rfc3339(),
        cohort: SYNTHETIC_PROTOCOL.into(),
        plan_count: SYNTHETIC_PLANS,
        report,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&envelope).context("serializing report")?
    );
    Ok(())
}
