//! Vector math and the on-disk embedding encoding.
//!
//! Embeddings are stored as raw little-endian IEEE-754 f32s
//! concatenated without header or length prefix; the dimension is
//! `blob.len() / 4`. The byte layout is contract-bearing: other tools
//! reading the same workspace depend on it.

/// Cosine similarity with f64 accumulation.
///
/// Returns 0.0 for zero-norm, empty, or dimension-mismatched inputs so
/// degenerate vectors rank last instead of poisoning the sort.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn vector_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        let bytes: [u8; 4] = chunk.try_into().unwrap_or([0, 0, 0, 0]);
        out.push(f32::from_le_bytes(bytes));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip_is_byte_exact() {
        let v = vec![0.0f32, 1.5, -2.25, f32::MIN_POSITIVE, 1e30, -0.0];
        let blob = vector_to_blob(&v);
        assert_eq!(blob.len(), v.len() * 4);
        let back = blob_to_vector(&blob);
        assert_eq!(back.len(), v.len());
        for (a, b) in v.iter().zip(back.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn blob_ignores_trailing_partial_word() {
        let mut blob = vector_to_blob(&[1.0, 2.0]);
        blob.push(0xFF);
        assert_eq!(blob_to_vector(&blob), vec![1.0, 2.0]);
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = [0.5f32, 0.5, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_zero_norm_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
    }
}
