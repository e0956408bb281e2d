//! Metric kernels for comparing score vectors.
//!
//! All functions are pure and deterministic. Pairwise metrics (MAE,
//! bottom-decile agreement) expect the two vectors to be index-aligned:
//! entry i of each side belongs to the same test plan. Empty or misaligned
//! input yields `None`, never NaN.

use serde::{Deserialize, Serialize};

/// Linear-interpolation quantile over an ascending-sorted slice.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let n = sorted.len();
    if n == 1 {
        return Some(sorted[0]);
    }
    let position = q * (n - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let fraction = position - lower as f64;
    Some(sorted[lower] + fraction * (sorted[upper] - sorted[lower]))
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Mean / median / interquartile summary of one metric across bootstrap
/// iterations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub median: f64,
    pub p25: f64,
    pub p75: f64,
    pub iqr: f64,
}

pub fn summarize(values: &[f64]) -> Option<MetricSummary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = quantile_sorted(&sorted, 0.5)?;
    let p25 = quantile_sorted(&sorted, 0.25)?;
    let p75 = quantile_sorted(&sorted, 0.75)?;
    Some(MetricSummary {
        mean: mean(&sorted)?,
        median,
        p25,
        p75,
        iqr: p75 - p25,
    })
}

/// Mean absolute difference between index-aligned score vectors.
pub fn mean_absolute_error(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let total: f64 = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum();
    Some(total / a.len() as f64)
}

/// Two-sample Kolmogorov-Smirnov statistic: the largest vertical distance
/// between the two empirical CDFs, evaluated at every distinct value.
pub fn ks_distance(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut a_sorted = a.to_vec();
    a_sorted.sort_by(f64::total_cmp);
    let mut b_sorted = b.to_vec();
    b_sorted.sort_by(f64::total_cmp);

    let mut combined: Vec<f64> = a_sorted.iter().chain(b_sorted.iter()).copied().collect();
    combined.sort_by(f64::total_cmp);
    combined.dedup();

    let mut largest = 0.0_f64;
    for value in combined {
        let cdf_a = cdf_at(&a_sorted, value);
        let cdf_b = cdf_at(&b_sorted, value);
        largest = largest.max((cdf_a - cdf_b).abs());
    }
    Some(largest)
}

fn cdf_at(sorted: &[f64], value: f64) -> f64 {
    sorted.partition_point(|v| *v <= value) as f64 / sorted.len() as f64
}

/// First-order Wasserstein distance via the quantile coupling: mean
/// absolute difference of the sorted vectors, truncated to the shorter
/// length.
pub fn wasserstein_distance(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let mut a_sorted = a.to_vec();
    a_sorted.sort_by(f64::total_cmp);
    let mut b_sorted = b.to_vec();
    b_sorted.sort_by(f64::total_cmp);
    let n = a_sorted.len().min(b_sorted.len());
    let total: f64 = a_sorted[..n]
        .iter()
        .zip(&b_sorted[..n])
        .map(|(x, y)| (x - y).abs())
        .sum();
    Some(total / n as f64)
}

/// Fraction of index-aligned plans whose membership in the bottom decile
/// agrees between the two score vectors. Each side uses its own 10th
/// percentile as the cut.
pub fn bottom_decile_agreement(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut a_sorted = a.to_vec();
    a_sorted.sort_by(f64::total_cmp);
    let mut b_sorted = b.to_vec();
    b_sorted.sort_by(f64::total_cmp);
    let threshold_a = quantile_sorted(&a_sorted, 0.1)?;
    let threshold_b = quantile_sorted(&b_sorted, 0.1)?;

    let agreeing = a
        .iter()
        .zip(b)
        .filter(|(x, y)| (**x <= threshold_a) == (**y <= threshold_b))
        .count();
    Some(agreeing as f64 / a.len() as f64)
}
