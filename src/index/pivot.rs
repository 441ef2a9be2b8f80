use rand::seq::index::sample;
use rand::Rng;

use crate::fingerprint::{Fingerprint, Metric};

/// Candidate pivots scored per branch.
pub const MAX_VIEWPOINTS: usize = 256;

/// Probe fingerprints each candidate is measured against.
pub const MAX_SAMPLE: usize = 64;

#[derive(Debug, Clone, Copy)]
struct PivotScore {
    /// How evenly the median radius splits the probes, `0..=MAX_SAMPLE / 2`
    balance: u32,
    /// Standard deviation of the probe distances
    spread: f64,
}

fn score(distances: &mut [u32]) -> PivotScore {
    distances.sort_unstable();
    let median = distances[distances.len() / 2];

    let below = distances.iter().filter(|&&d| d < median).count();
    let at = distances.iter().filter(|&&d| d == median).count();
    let above = distances.len() - below - at;
    let (inside, outside) = if below <= above {
        (below + at, above)
    } else {
        (below, above + at)
    };
    let (small, large) = (inside.min(outside), inside.max(outside));
    let balance = if large == 0 {
        0
    } else {
        (small as f64 / large as f64 * (MAX_SAMPLE / 2) as f64) as u32
    };

    let n = distances.len() as f64;
    let mean = distances.iter().map(|&d| d as f64).sum::<f64>() / n;
    let variance = distances
        .iter()
        .map(|&d| (d as f64 - mean).powi(2))
        .sum::<f64>()
        / n;

    PivotScore {
        balance,
        spread: variance.sqrt(),
    }
}

/// Remove and return the candidate that makes the best vantage point.
///
/// Scores up to [`MAX_VIEWPOINTS`] random candidates against up to
/// [`MAX_SAMPLE`] random probes, preferring an even split around the median
/// distance and then a wide spread of distances.
pub fn choose_pivot<M, R>(
    candidates: &mut Vec<(i64, Fingerprint)>,
    metric: &M,
    rng: &mut R,
) -> Option<(i64, Fingerprint)>
where
    M: Metric + ?Sized,
    R: Rng + ?Sized,
{
    if candidates.len() <= 1 {
        return candidates.pop();
    }

    let n = candidates.len();
    let viewpoints = sample(rng, n, n.min(MAX_VIEWPOINTS));
    let probes = sample(rng, n, n.min(MAX_SAMPLE)).into_vec();

    let mut best: Option<(PivotScore, i64, usize)> = None;
    let mut distances = Vec::with_capacity(probes.len());
    for v in viewpoints.iter() {
        let (id, viewpoint) = &candidates[v];
        distances.clear();
        distances.extend(
            probes
                .iter()
                .filter(|&&p| p != v)
                .map(|&p| metric.distance(viewpoint, &candidates[p].1)),
        );
        if distances.is_empty() {
            continue;
        }
        let candidate_score = score(&mut distances);
        let better = match &best {
            None => true,
            Some((best_score, best_id, _)) => {
                (candidate_score.balance, candidate_score.spread, *id)
                    > (best_score.balance, best_score.spread, *best_id)
            }
        };
        if better {
            best = Some((candidate_score, *id, v));
        }
    }

    let index = best.map_or(n - 1, |(_, _, v)| v);
    Some(candidates.swap_remove(index))
}
