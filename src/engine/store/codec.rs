//! Vector blob encoding and similarity.
//!
//! Embeddings are stored as little-endian `f32` blobs with the dimension in a
//! separate column, so a decode can check the byte length.

use crate::engine::error::EngineError;

pub(crate) fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for &value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_embedding(blob: &[u8], dimension: usize) -> Result<Vec<f32>, EngineError> {
    let expected_len = dimension * std::mem::size_of::<f32>();
    if blob.len() != expected_len {
        return Err(EngineError::Storage(format!(
            "codec: invalid embedding byte length: expected {expected_len}, got {}",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Cosine similarity; zero when either side has no magnitude or the lengths
/// differ.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (dot / denom) as f32
}

/// Why `vector` cannot be indexed at `dimension`, if it cannot.
pub(crate) fn embedding_defect(vector: Option<&[f32]>, dimension: usize) -> Option<String> {
    let Some(v) = vector else {
        return Some("embedding is null".to_string());
    };
    if v.len() != dimension {
        return Some(format!("dimension {} does not match configured {dimension}", v.len()));
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Some("embedding contains non-finite values".to_string());
    }
    None
}
