//! # Stage: Statistics Engine
//!
//! ## Responsibility
//! Aggregates a point-in-time snapshot of the participation ledger into
//! per-variant metrics, normal-approximation confidence intervals, a
//! two-proportion z-test between the two best variants, and human-readable
//! recommendations.
//!
//! ## Guarantees
//! - Non-panicking and infallible: zero participants, a single variant, or
//!   identical rates all produce neutral results (`p = 1`, no winner)
//! - Deterministic: the same snapshot always yields the same results
//! - Only the top two variants by conversion rate are ever compared;
//!   ties keep definition order
//!
//! ## NOT Responsible For
//! - Loading or persisting anything (see `service`)
//! - Multiple-comparison, Bayesian or sequential corrections

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use statrs::function::erf::erf;

use crate::model::{ConfidenceInterval, Participation, Test, TestResults, VariantResult};

// ---------------------------------------------------------------------------
// Normal distribution helpers
// ---------------------------------------------------------------------------

/// Two-sided critical value for a confidence level in percent.
/// Unmapped levels fall back to 95%.
pub fn z_score(confidence_level: u8) -> f64 {
    match confidence_level {
        90 => 1.645,
        95 => 1.96,
        99 => 2.576,
        _ => 1.96,
    }
}

/// Standard normal CDF, Φ(x) = ½(1 + erf(x/√2)).
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

// ---------------------------------------------------------------------------
// Per-variant metrics
// ---------------------------------------------------------------------------

/// Normal-approximation interval for `conversions / participants`, in percent,
/// clamped to `[0, 100]`. Empty variants get `[0, 0]`.
pub fn confidence_interval(conversions: u64, participants: u64, confidence_level: u8) -> ConfidenceInterval {
    if participants == 0 {
        return ConfidenceInterval::default();
    }
    let n = participants as f64;
    let p = conversions as f64 / n;
    let margin = z_score(confidence_level) * (p * (1.0 - p) / n).sqrt();
    ConfidenceInterval {
        lower: ((p - margin) * 100.0).max(0.0),
        upper: ((p + margin) * 100.0).min(100.0),
    }
}

/// Count participants and conversions per variant, in the test's variant
/// order. Participations naming an unknown variant are ignored.
pub fn summarize_variants(test: &Test, participations: &[Participation]) -> Vec<VariantResult> {
    let index: HashMap<&str, usize> = test
        .variants
        .iter()
        .enumerate()
        .map(|(i, v)| (v.id.as_str(), i))
        .collect();

    let mut tallies = vec![(0u64, 0u64); test.variants.len()];
    for p in participations {
        if let Some(&i) = index.get(p.variant_id.as_str()) {
            tallies[i].0 += 1;
            if p.converted {
                tallies[i].1 += 1;
            }
        }
    }

    test.variants
        .iter()
        .zip(tallies)
        .map(|(v, (participants, conversions))| VariantResult {
            id: v.id.clone(),
            name: v.name.clone(),
            participants,
            conversions,
            conversion_rate: if participants > 0 {
                conversions as f64 / participants as f64 * 100.0
            } else {
                0.0
            },
            confidence_interval: confidence_interval(conversions, participants, test.confidence_level),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Two-proportion z-test
// ---------------------------------------------------------------------------

/// Result of comparing the two best variants.
#[derive(Debug, Clone, PartialEq)]
pub struct SignificanceTest {
    pub z: f64,
    pub p_value: f64,
    /// Absolute percentage-point difference.
    pub effect_size: f64,
    /// (1 - p) × 100.
    pub confidence: f64,
    pub significant: bool,
    /// Treatment id when significant.
    pub winner: Option<String>,
}

impl SignificanceTest {
    fn neutral() -> Self {
        Self {
            z: 0.0,
            p_value: 1.0,
            effect_size: 0.0,
            confidence: 0.0,
            significant: false,
            winner: None,
        }
    }
}

/// Pooled two-proportion z-test of `treatment` against `control`.
pub fn two_proportion_test(
    treatment: &VariantResult,
    control: &VariantResult,
    confidence_level: u8,
) -> SignificanceTest {
    if treatment.participants == 0 || control.participants == 0 {
        return SignificanceTest::neutral();
    }
    let n1 = treatment.participants as f64;
    let n2 = control.participants as f64;
    let p1 = treatment.conversions as f64 / n1;
    let p2 = control.conversions as f64 / n2;

    let pooled = (treatment.conversions + control.conversions) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    let z = if se > 0.0 { (p1 - p2) / se } else { 0.0 };
    let p_value = 2.0 * (1.0 - normal_cdf(z.abs()));

    let significant = p_value < 1.0 - f64::from(confidence_level) / 100.0;
    SignificanceTest {
        z,
        p_value,
        effect_size: (p1 - p2).abs() * 100.0,
        confidence: (1.0 - p_value) * 100.0,
        significant,
        winner: significant.then(|| treatment.id.clone()),
    }
}

/// Rank variants by conversion rate (stable, descending) and test rank 0
/// against rank 1. The remaining variants are not compared.
pub fn compare_top_two(variants: &[VariantResult], confidence_level: u8) -> SignificanceTest {
    if variants.len() < 2 {
        return SignificanceTest::neutral();
    }
    let mut ranked: Vec<&VariantResult> = variants.iter().collect();
    ranked.sort_by(|a, b| b.conversion_rate.total_cmp(&a.conversion_rate));
    two_proportion_test(ranked[0], ranked[1], confidence_level)
}

// ---------------------------------------------------------------------------
// Recommendations
// ---------------------------------------------------------------------------

pub fn recommendations(
    variants: &[VariantResult],
    winner: Option<&str>,
    small_sample_threshold: u64,
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(winner_id) = winner {
        let name = variants
            .iter()
            .find(|v| v.id == winner_id)
            .map(|v| v.name.as_str())
            .unwrap_or(winner_id);
        out.push(format!(
            "Implement {name} as the default - it shows statistically significant improvement."
        ));
        return out;
    }

    out.push("Continue running the test - no statistically significant winner yet.".to_string());

    if variants.iter().any(|v| v.participants < small_sample_threshold) {
        out.push(format!(
            "Increase sample size to at least {small_sample_threshold} participants per variant for reliable results."
        ));
    }

    // First variant with the highest rate.
    let leader = variants.iter().fold(None::<&VariantResult>, |best, v| match best {
        Some(b) if v.conversion_rate <= b.conversion_rate => Some(b),
        _ => Some(v),
    });
    if let Some(best) = leader.filter(|b| b.conversion_rate > 0.0) {
        out.push(format!(
            "{} is currently leading with {:.1}% conversion rate.",
            best.name, best.conversion_rate
        ));
    }

    out
}

// ---------------------------------------------------------------------------
// Full analysis
// ---------------------------------------------------------------------------

/// Analyse a snapshot of `test`'s participations.
pub fn analyze(
    test: &Test,
    participations: &[Participation],
    small_sample_threshold: u64,
    now: DateTime<Utc>,
) -> TestResults {
    let variants = summarize_variants(test, participations);
    let sig = compare_top_two(&variants, test.confidence_level);
    let recs = recommendations(&variants, sig.winner.as_deref(), small_sample_threshold);

    TestResults {
        test_id: test.id.clone(),
        winner: sig.winner,
        confidence: sig.confidence,
        statistical_significance: sig.significant,
        p_value: sig.p_value,
        effect_size: sig.effect_size,
        variants,
        recommendations: recs,
        analyzed_at: now,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
