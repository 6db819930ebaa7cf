//! # Stage: Variant Assignment
//!
//! ## Responsibility
//! Pure selection logic behind `assign`: the weighted cumulative-sum draw and
//! the target-audience eligibility check.
//!
//! ## Guarantees
//! - Reproducible: the same draw over the same variants always selects the
//!   same variant (ordered scan, first `r <= cumulative` wins)
//! - Total: a non-empty variant list always yields a variant; floating-point
//!   drift past the last bucket falls back to the last variant
//!
//! ## NOT Responsible For
//! - Idempotency across calls (the ledger's insert-if-absent handles that)
//! - Drawing the random number (see `random`)

use crate::model::{ParticipantContext, TargetAudience, Variant};

/// Pick the variant for a draw `r` in `[0, 100)`.
///
/// Variants are scanned in definition order with a running weight total `c`;
/// the first variant where `r <= c` is selected. Returns `None` only for an
/// empty slice.
pub fn select_variant(variants: &[Variant], r: f64) -> Option<&Variant> {
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.weight;
        if r <= cumulative {
            return Some(variant);
        }
    }
    variants.last()
}

/// `true` if the context passes every populated filter of `audience`.
///
/// A missing context is eligible: audience enrichment is the caller's job
/// and an unenriched call has nothing to filter on.
pub fn matches_target_audience(
    context: Option<&ParticipantContext>,
    audience: &TargetAudience,
) -> bool {
    let Some(ctx) = context else {
        return true;
    };
    passes(&audience.industries, ctx.industry.as_deref())
        && passes(&audience.locations, ctx.location.as_deref())
        && passes(&audience.job_types, ctx.job_type.as_deref())
        && passes(&audience.experience_levels, ctx.experience_level.as_deref())
}

fn passes(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(v) => allowed.iter().any(|a| a == v),
        None => false,
    }
}
