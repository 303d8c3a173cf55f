//! ALFA Identity Vault - Template Matcher
//!
//! Euclidean distance between embeddings with a caller-supplied acceptance
//! threshold. Distances are accumulated in f64 so that `distance(a, b)` and
//! `distance(b, a)` agree bit for bit.

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, IdentityResult};
use crate::template::Embedding;

/// Default acceptance threshold for face descriptors
pub const DEFAULT_TOLERANCE: f64 = 0.5;

/// Match decision with the distance that produced it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matched: bool,
    pub distance: f64,
    pub tolerance: f64,
}

/// Euclidean distance; both embeddings must have the same dimension
pub fn distance(a: &Embedding, b: &Embedding) -> IdentityResult<f64> {
    if a.len() != b.len() {
        return Err(IdentityError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let sum: f64 = a
        .values()
        .iter()
        .zip(b.values())
        .map(|(x, y)| {
            let d = *x as f64 - *y as f64;
            d * d
        })
        .sum();

    Ok(sum.sqrt())
}

fn check_tolerance(tolerance: f64) -> IdentityResult<()> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(IdentityError::Config(format!(
            "tolerance must be a non-negative number, got {}",
            tolerance
        )));
    }
    Ok(())
}

/// Match iff `distance(a, b) <= tolerance`
pub fn is_match(a: &Embedding, b: &Embedding, tolerance: f64) -> IdentityResult<MatchOutcome> {
    check_tolerance(tolerance)?;
    let distance = distance(a, b)?;

    Ok(MatchOutcome {
        matched: distance <= tolerance,
        distance,
        tolerance,
    })
}

/// Index of the closest candidate within tolerance, if any
///
/// Ties keep the earliest candidate. A candidate of the wrong dimension
/// fails the whole search.
pub fn best_match<'a, I>(
    probe: &Embedding,
    candidates: I,
    tolerance: f64,
) -> IdentityResult<Option<(usize, MatchOutcome)>>
where
    I: IntoIterator<Item = &'a Embedding>,
{
    check_tolerance(tolerance)?;

    let mut best: Option<(usize, MatchOutcome)> = None;
    for (idx, candidate) in candidates.into_iter().enumerate() {
        let outcome = is_match(probe, candidate, tolerance)?;
        if !outcome.matched {
            continue;
        }
        match best {
            Some((_, current)) if current.distance <= outcome.distance => {}
            _ => best = Some((idx, outcome)),
        }
    }

    Ok(best)
}
