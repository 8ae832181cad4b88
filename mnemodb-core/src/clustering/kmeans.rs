/// k-means with k-means++ seeding.
///
/// Shared by the cluster engine (full reclustering, cluster split) and the
/// partition manager (oversized partition split).

use std::sync::atomic::{AtomicBool, Ordering};
use rand::Rng;
use rayon::prelude::*;
use crate::vector::distance::squared_l2_distance;

/// Result of one k-means run. `assignments[i]` indexes into `centroids`;
/// every centroid has at least one member.
#[derive(Debug, Clone)]
pub struct KMeansOutcome {
    pub centroids: Vec<Vec<f32>>,
    pub assignments: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
}

/// Index of the nearest centroid. Ties go to the lowest index.
pub fn nearest_centroid(point: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best_idx = 0;
    let mut best_dist = f32::MAX;
    for (idx, centroid) in centroids.iter().enumerate() {
        let dist = squared_l2_distance(point, centroid);
        if dist < best_dist {
            best_dist = dist;
            best_idx = idx;
        }
    }
    best_idx
}

/// k-means++ seeding: first centroid uniform, each next one sampled with
/// probability proportional to the squared distance to the nearest chosen
/// centroid. Stops early once every point coincides with a centroid.
pub fn kmeans_plusplus_seed<R: Rng>(points: &[&[f32]], k: usize, rng: &mut R) -> Vec<Vec<f32>> {
    if points.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())].to_vec());

    let mut nearest: Vec<f32> = points
        .iter()
        .map(|p| squared_l2_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = nearest.iter().map(|d| *d as f64).sum();
        if total <= 0.0 {
            break;
        }

        let threshold = rng.gen::<f64>() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = None;
        for (i, &dist) in nearest.iter().enumerate() {
            if dist <= 0.0 {
                continue;
            }
            cumulative += dist as f64;
            chosen = Some(i);
            if cumulative >= threshold {
                break;
            }
        }
        let Some(chosen) = chosen else { break };

        let centroid = points[chosen].to_vec();
        for (d, p) in nearest.iter_mut().zip(points.iter()) {
            *d = d.min(squared_l2_distance(p, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Lloyd iterations from k-means++ seeds until no assignment changes or
/// `max_iterations` is hit. Returns `None` if `cancel` is raised between
/// iterations. Empty clusters are dropped from the outcome.
pub fn kmeans<R: Rng>(
    points: &[&[f32]],
    k: usize,
    max_iterations: usize,
    rng: &mut R,
    cancel: &AtomicBool,
) -> Option<KMeansOutcome> {
    let mut centroids = kmeans_plusplus_seed(points, k, rng);
    if centroids.is_empty() {
        return Some(KMeansOutcome {
            centroids,
            assignments: Vec::new(),
            iterations: 0,
            converged: true,
        });
    }

    let dim = points[0].len();
    let mut assignments = vec![usize::MAX; points.len()];
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..max_iterations.max(1) {
        if cancel.load(Ordering::Acquire) {
            return None;
        }
        iterations += 1;

        let next: Vec<usize> = points
            .par_iter()
            .map(|p| nearest_centroid(p, &centroids))
            .collect();
        if next == assignments {
            converged = true;
            break;
        }
        assignments = next;

        let mut sums = vec![vec![0.0f32; dim]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (p, &c) in points.iter().zip(assignments.iter()) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(p.iter()) {
                *s += x;
            }
        }
        for (idx, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            // An empty cluster keeps its centroid and is dropped at the end
            if count > 0 {
                centroids[idx] = sum.into_iter().map(|s| s / count as f32).collect();
            }
        }
    }

    // Compact away empty clusters
    let mut counts = vec![0usize; centroids.len()];
    for &c in &assignments {
        counts[c] += 1;
    }
    let mut remap = vec![usize::MAX; centroids.len()];
    let mut kept = Vec::new();
    for (idx, centroid) in centroids.into_iter().enumerate() {
        if counts[idx] > 0 {
            remap[idx] = kept.len();
            kept.push(centroid);
        }
    }
    let assignments = assignments.into_iter().map(|c| remap[c]).collect();

    Some(KMeansOutcome {
        centroids: kept,
        assignments,
        iterations,
        converged,
    })
}

/// Split `points` into two non-empty groups of indices with a local
/// 2-means pass. Falls back to halving by position when 2-means cannot
/// separate the points (all identical). Requires at least two points.
pub fn two_means_split<R: Rng>(
    points: &[&[f32]],
    max_iterations: usize,
    rng: &mut R,
    cancel: &AtomicBool,
) -> Option<(Vec<usize>, Vec<usize>)> {
    debug_assert!(points.len() >= 2, "two_means_split needs at least two points");
    let outcome = kmeans(points, 2, max_iterations, rng, cancel)?;

    if outcome.centroids.len() == 2 {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for (i, &c) in outcome.assignments.iter().enumerate() {
            if c == 0 {
                left.push(i);
            } else {
                right.push(i);
            }
        }
        if !left.is_empty() && !right.is_empty() {
            return Some((left, right));
        }
    }

    let mid = points.len() / 2;
    Some(((0..mid).collect(), (mid..points.len()).collect()))
}
