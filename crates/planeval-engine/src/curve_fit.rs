//! Saturating-curve fit of a stability metric against reference size.
//!
//! Convergence of percentile estimates follows an inverse-square-root law,
//! so the metric median per N is fitted as y = intercept + slope / sqrt(N)
//! by closed-form least squares. N* is the smallest observed N at which the
//! fitted curve has exhausted all but a configured fraction of its total
//! improvement. Sparse or flat curves degrade to a null N* with a
//! diagnostic; many protocols simply do not have enough data for a fit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ERROR_TOO_FEW_POINTS: &str = "PE-FIT-1001";
const ERROR_DEGENERATE_INPUTS: &str = "PE-FIT-1002";
const ERROR_LOW_R2: &str = "PE-FIT-1003";

/// Minimum number of distinct N values a fit needs.
pub const MIN_FIT_POINTS: usize = 3;

/// One aggregated observation: metric median at reference size N.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitPoint {
    pub n: usize,
    pub value: f64,
}

/// Least-squares parameters of y = intercept + slope / sqrt(N).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InverseSqrtFit {
    pub intercept: f64,
    pub slope: f64,
    pub r2: f64,
}

impl InverseSqrtFit {
    pub fn predict(&self, n: usize) -> f64 {
        self.intercept + self.slope / (n as f64).sqrt()
    }
}

/// Why a fit produced no usable N*.
#[derive(Debug, Error, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FitDiagnostic {
    #[error("{available} distinct N values, {required} required")]
    TooFewPoints { available: usize, required: usize },
    #[error("metric values carry no variance to fit")]
    DegenerateInputs,
    #[error("fit r2 {r2} below usability threshold {threshold}")]
    LowR2 { r2: f64, threshold: f64 },
}

impl FitDiagnostic {
    pub fn stable_code(&self) -> &'static str {
        match self {
            Self::TooFewPoints { .. } => ERROR_TOO_FEW_POINTS,
            Self::DegenerateInputs => ERROR_DEGENERATE_INPUTS,
            Self::LowR2 { .. } => ERROR_LOW_R2,
        }
    }
}

/// Plateau estimate with fit parameters and failure diagnostics. Either
/// `n_star` is present, or `diagnostic` explains its absence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NStarEstimate {
    pub n_star: Option<usize>,
    pub fit: Option<InverseSqrtFit>,
    pub plateau_fraction: f64,
    pub diagnostic: Option<FitDiagnostic>,
}

/// Closed-form least squares of y on 1/sqrt(N).
pub fn fit_inverse_sqrt(points: &[FitPoint]) -> Result<InverseSqrtFit, FitDiagnostic> {
    let mut distinct: Vec<usize> = points.iter().map(|p| p.n).collect();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() < MIN_FIT_POINTS {
        return Err(FitDiagnostic::TooFewPoints {
            available: distinct.len(),
            required: MIN_FIT_POINTS,
        });
    }

    let xs: Vec<f64> = points.iter().map(|p| 1.0 / (p.n as f64).sqrt()).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.value).collect();
    let count = points.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / count;
    let mean_y = ys.iter().sum::<f64>() / count;

    let mut covariance = 0.0;
    let mut variance_x = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        covariance += (x - mean_x) * (y - mean_y);
        variance_x += (x - mean_x) * (x - mean_x);
    }
    if variance_x <= 0.0 {
        return Err(FitDiagnostic::DegenerateInputs);
    }
    let slope = covariance / variance_x;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in xs.iter().zip(&ys) {
        let predicted = intercept + slope * x;
        ss_res += (y - predicted) * (y - predicted);
        ss_tot += (y - mean_y) * (y - mean_y);
    }
    if ss_tot <= 0.0 {
        return Err(FitDiagnostic::DegenerateInputs);
    }

    Ok(InverseSqrtFit {
        intercept,
        slope,
        r2: 1.0 - ss_res / ss_tot,
    })
}

/// Fits the curve and locates the plateau. Never errors: insufficient or
/// unusable data yields a null N* with the reason attached.
pub fn estimate_n_star(
    points: &[FitPoint],
    plateau_fraction: f64,
    r2_threshold: f64,
) -> NStarEstimate {
    let fit = match fit_inverse_sqrt(points) {
        Ok(fit) => fit,
        Err(diagnostic) => {
            return NStarEstimate {
                n_star: None,
                fit: None,
                plateau_fraction,
                diagnostic: Some(diagnostic),
            }
        }
    };

    if !fit.r2.is_finite() || fit.r2 < r2_threshold {
        return NStarEstimate {
            n_star: None,
            fit: Some(fit),
            plateau_fraction,
            diagnostic: Some(FitDiagnostic::LowR2 {
                r2: fit.r2,
                threshold: r2_threshold,
            }),
        };
    }

    let mut ns: Vec<usize> = points.iter().map(|p| p.n).collect();
    ns.sort_unstable();
    ns.dedup();

    let predictions: Vec<f64> = ns.iter().map(|n| fit.predict(*n)).collect();
    let max_predicted = predictions.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let target = fit.intercept + plateau_fraction * (max_predicted - fit.intercept);

    let n_star = ns
        .iter()
        .zip(&predictions)
        .find(|(_, predicted)| **predicted <= target)
        .map(|(n, _)| *n)
        .or_else(|| ns.last().copied());

    NStarEstimate {
        n_star,
        fit: Some(fit),
        plateau_fraction,
        diagnostic: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(intercept: f64, slope: f64, ns: &[usize]) -> Vec<FitPoint> {
        ns.iter()
            .map(|n| FitPoint {
                n: *n,
                value: intercept + slope / (*n as f64).sqrt(),
            })
            .collect()
    }

    // ── fit_inverse_sqrt ──────────────────────────────────────────

    #[test]
    fn exact_curve_is_recovered() {
        let points = curve(0.02, 0.5, &[10, 20, 30, 50, 75, 100]);
        let fit = fit_inverse_sqrt(&points).expect("fit");
        assert!((fit.intercept - 0.02).abs() < 1e-9);
        assert!((fit.slope - 0.5).abs() < 1e-9);
        assert!((fit.r2 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn too_few_distinct_points_is_diagnosed() {
        let points = curve(0.02, 0.5, &[10, 20]);
        let err = fit_inverse_sqrt(&points).unwrap_err();
        assert_eq!(err.stable_code(), "PE-FIT-1001");
        assert_eq!(
            err,
            FitDiagnostic::TooFewPoints {
                available: 2,
                required: 3
            }
        );
    }

    #[test]
    fn flat_metric_curve_is_degenerate() {
        let points: Vec<FitPoint> = [10, 20, 30]
            .iter()
            .map(|n| FitPoint { n: *n, value: 0.05 })
            .collect();
        let err = fit_inverse_sqrt(&points).unwrap_err();
        assert_eq!(err.stable_code(), "PE-FIT-1002");
    }

    // ── estimate_n_star ───────────────────────────────────────────

    #[test]
    fn n_star_lands_where_improvement_is_spent() {
        let ns = [10, 50, 100, 500, 1_100, 2_000];
        let points = curve(0.01, 0.4, &ns);
        let estimate = estimate_n_star(&points, 0.10, 0.5);
        // 90% of the fitted improvement over N=10 is spent by N=1100
        assert_eq!(estimate.n_star, Some(1_100));
        let fit = estimate.fit.expect("fit");
        let target = fit.intercept + 0.10 * (fit.predict(10) - fit.intercept);
        assert!(fit.predict(1_100) <= target);
        assert!(fit.predict(500) > target);
    }

    #[test]
    fn n_star_falls_back_to_largest_observed_n() {
        // slope so shallow relative to the plateau band that no observed N
        // reaches the target
        let points = curve(0.01, 0.4, &[10, 12, 14]);
        let estimate = estimate_n_star(&points, 0.01, 0.5);
        assert_eq!(estimate.n_star, Some(14));
        assert!(estimate.diagnostic.is_none());
    }

    #[test]
    fn noisy_curve_below_r2_threshold_has_null_n_star() {
        let points = vec![
            FitPoint { n: 10, value: 0.05 },
            FitPoint { n: 20, value: 0.30 },
            FitPoint { n: 30, value: 0.02 },
            FitPoint { n: 50, value: 0.28 },
            FitPoint { n: 75, value: 0.04 },
        ];
        let estimate = estimate_n_star(&points, 0.10, 0.9);
        assert_eq!(estimate.n_star, None);
        assert!(matches!(
            estimate.diagnostic,
            Some(FitDiagnostic::LowR2 { .. })
        ));
        // fit parameters are still reported for diagnostics
        assert!(estimate.fit.is_some());
    }

    #[test]
    fn sparse_curve_has_null_n_star_not_a_panic() {
        let estimate = estimate_n_star(&[], 0.10, 0.5);
        assert_eq!(estimate.n_star, None);
        assert_eq!(
            estimate.diagnostic,
            Some(FitDiagnostic::TooFewPoints {
                available: 0,
                required: 3
            })
        );
    }
}
