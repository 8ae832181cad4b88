/// Squared Euclidean distance. Cheaper than `l2_distance` when only the
/// ordering matters (k-means assignment, k-means++ weights).
pub fn squared_l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(
        a.len(),
        b.len(),
        "Vectors must have the same dimension"
    );
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum()
}

/// Compute L2 (Euclidean) distance between two vectors.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    squared_l2_distance(a, b).sqrt()
}

/// Cosine similarity in [-1, 1]. Zero vectors have similarity 0 with
/// everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(
        a.len(),
        b.len(),
        "Vectors must have the same dimension"
    );
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Cosine distance (1 - cosine_similarity), in [0, 2].
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Component-wise mean. Returns `None` for an empty input.
pub fn centroid_of<'a, I>(vectors: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut iter = vectors.into_iter();
    let first = iter.next()?;
    let mut sum = first.to_vec();
    let mut count = 1usize;
    for v in iter {
        for (s, x) in sum.iter_mut().zip(v.iter()) {
            *s += x;
        }
        count += 1;
    }
    for s in &mut sum {
        *s /= count as f32;
    }
    Some(sum)
}

/// Size-weighted average of two centroids.
pub fn weighted_mean(a: &[f32], weight_a: usize, b: &[f32], weight_b: usize) -> Vec<f32> {
    let total = (weight_a + weight_b).max(1) as f32;
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x * weight_a as f32 + y * weight_b as f32) / total)
        .collect()
}
