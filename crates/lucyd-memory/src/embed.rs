use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::MemoryError;

/// Client for an OpenAI-compatible embeddings endpoint.
///
/// Callers are expected to consult the store's embedding cache before
/// hitting the network; `hash_text` is the shared cache key.
pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    pub model: String,
    pub provider: String,
    api_key: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingEntry>,
}

#[derive(Deserialize)]
struct EmbeddingEntry {
    embedding: Vec<f64>,
}

impl EmbeddingClient {
    pub fn new(
        base_url: &str,
        model: &str,
        provider: &str,
        api_key: &str,
        timeout_secs: u64,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            provider: provider.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Embed one text. Network or parse failures return an error the
    /// caller downgrades to an empty result (vector search is a fallback,
    /// never a hard dependency).
    pub async fn embed(&self, text: &str) -> Result<Vec<f64>, MemoryError> {
        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({ "model": self.model, "input": text }))
            .send()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            warn!(status, "embedding endpoint returned error");
            return Err(MemoryError::Embedding(format!("HTTP {status}")));
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| MemoryError::Embedding("empty embedding response".to_string()))
    }
}

/// Cache key: sha256 hex of the text.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cosine similarity between two vectors; 0.0 when either is degenerate.
pub fn cosine_sim(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if na > 0.0 && nb > 0.0 {
        dot / (na * nb)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -0.2, 0.8];
        assert!((cosine_sim(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_sim(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine_sim(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
