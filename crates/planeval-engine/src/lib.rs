#![forbid(unsafe_code)]

//! Population-reference scoring and reference-size stability analysis for
//! radiotherapy plan evaluations.
//!
//! The engine answers two questions about protocol-aware plan quality
//! scoring:
//! - **Scoring**: given a cohort of approved plans, where does a plan sit,
//!   constraint by constraint, within the cohort's achieved-value
//!   distributions, and what single weighted-percentile score summarizes it?
//! - **Stability**: how many reference plans does a protocol need before
//!   those scores stop moving, and can a pooled or shrinkage-blended
//!   reference stand in while the protocol is still small?
//!
//! Everything here is pure computation over loader-provided inputs; data
//! acquisition and artifact export live outside this crate.

pub mod constraint_key;
pub mod curve_fit;
pub mod plan;
pub mod plan_score;
pub mod population_reference;
pub mod protocol_catalog;
pub mod sampling;
pub mod score_metrics;
pub mod shrinkage;
pub mod stability;
pub mod structure_match;
