//! Vector similarity helpers.

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

/// Cosine similarity in [-1, 1].
///
/// Returns 0.0 when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let a_norm = l2_norm(a);
    let b_norm = l2_norm(b);
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    (dot / (a_norm * b_norm)).clamp(-1.0, 1.0)
}

/// Cosine similarity mapped into a support score in [0, 1].
///
/// Anti-correlated vectors carry no support, so negatives clamp to zero.
pub fn support_score(a: &[f32], b: &[f32]) -> f64 {
    cosine_similarity(a, b).max(0.0)
}
