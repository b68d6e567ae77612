//! Embedding provider contract and the HTTP implementation.
//!
//! The HTTP provider talks to an OpenAI-compatible `/embeddings` endpoint.
//! Some local servers return per-token embeddings (2D arrays); those are
//! mean-pooled into one vector per input.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::errors::SmartError;
use crate::config::SmartSettings;

/// Turns texts into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch. Returns one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SmartError>;
}

// ─── Response Types ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawEmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: serde_json::Value, // number[] or number[][] (per-token)
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<RawEmbeddingItem>,
}

// ─── HTTP Provider ───────────────────────────────────────────────────────────

/// Embedding provider backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpEmbeddingProvider {
    http: HttpClient,
    url: String,
    model: String,
}

impl HttpEmbeddingProvider {
    pub fn new(settings: &SmartSettings) -> Result<Self, SmartError> {
        let http = HttpClient::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| SmartError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            url: format!("{}/embeddings", settings.endpoint.trim_end_matches('/')),
            model: settings.model.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, SmartError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({ "model": self.model, "input": texts });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SmartError::RequestFailed {
                reason: format!("embedding request to {}: {e}", self.url),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(SmartError::HttpError { status, body });
        }

        let result: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| SmartError::RequestFailed {
                    reason: format!("failed to parse embedding response: {e}"),
                })?;

        if result.data.is_empty() {
            return Err(SmartError::EmptyResponse { count: texts.len() });
        }

        let mut items = result.data;
        items.sort_by_key(|item| item.index);

        items
            .into_iter()
            .map(|item| mean_pool_embedding(&item.embedding))
            .collect()
    }
}

// ─── Vector Helpers ──────────────────────────────────────────────────────────

/// Mean-pool per-token embeddings into a single vector. 1D input passes through.
fn mean_pool_embedding(embedding: &serde_json::Value) -> Result<Vec<f32>, SmartError> {
    match embedding {
        serde_json::Value::Array(arr) if arr.is_empty() => Ok(Vec::new()),

        serde_json::Value::Array(arr) if arr[0].is_number() => {
            Ok(arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
        }

        serde_json::Value::Array(arr) if arr[0].is_array() => {
            let tokens: Vec<Vec<f32>> = arr
                .iter()
                .filter_map(|row| {
                    row.as_array().map(|r| {
                        r.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect()
                    })
                })
                .collect();

            let Some(n_dim) = tokens.first().map(Vec::len) else {
                return Ok(Vec::new());
            };
            let mut result = vec![0.0_f32; n_dim];
            for token in &tokens {
                for (d, val) in token.iter().enumerate().take(n_dim) {
                    result[d] += val;
                }
            }
            let n_tokens = tokens.len() as f32;
            for val in &mut result {
                *val /= n_tokens;
            }
            Ok(result)
        }

        _ => Err(SmartError::RequestFailed {
            reason: "unexpected embedding format (expected number[] or number[][])".to_string(),
        }),
    }
}

/// L2-normalize a vector. Zero vectors are returned unchanged.
pub fn l2_normalize(vec: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.into_iter().map(|v| v / norm).collect()
    } else {
        vec
    }
}

/// Cosine similarity between two L2-normalized vectors (= dot product).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors() {
        let v = l2_normalize(vec![1.0, 2.0, 3.0]);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let a = l2_normalize(vec![1.0, 0.0, 0.0]);
        let b = l2_normalize(vec![0.0, 1.0, 0.0]);
        assert!(cosine_similarity(&a, &b).abs() < 1e-5);
    }

    #[test]
    fn l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn mean_pool_1d_passthrough() {
        let result = mean_pool_embedding(&serde_json::json!([1.0, 2.0, 3.0])).unwrap();
        assert_eq!(result, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn mean_pool_integer_values() {
        let result = mean_pool_embedding(&serde_json::json!([1, 0])).unwrap();
        assert_eq!(result, vec![1.0, 0.0]);
    }

    #[test]
    fn mean_pool_2d_averaging() {
        let result = mean_pool_embedding(&serde_json::json!([[1.0, 2.0], [3.0, 4.0]])).unwrap();
        assert_eq!(result, vec![2.0, 3.0]);
    }

    #[test]
    fn mean_pool_rejects_objects() {
        assert!(mean_pool_embedding(&serde_json::json!({"a": 1})).is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_failure() {
        let provider = HttpEmbeddingProvider::new(&SmartSettings {
            endpoint: "http://127.0.0.1:1/v1".into(),
            request_timeout_ms: 500,
            ..Default::default()
        })
        .unwrap();
        let err = provider.embed(&["hello".to_string()]).await.unwrap_err();
        assert!(matches!(err, SmartError::RequestFailed { .. }));
    }
}
