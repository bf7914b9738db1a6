//! HTTP embedding provider for an OpenAI-shaped embeddings API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::EmbeddingProvider;
use crate::types::{EmbeddingModelSpec, ProviderCredentials};

/// Embedding provider calling a hosted API over HTTP.
///
/// The API shape is the OpenAI `/embeddings` endpoint, which the hosted
/// providers we integrate with all speak. The base URL comes from the
/// provider credentials, so Azure-style deployments work unchanged.
pub struct HttpEmbeddingProvider {
    model: EmbeddingModelSpec,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(model: EmbeddingModelSpec, credentials: ProviderCredentials) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();

        Self {
            model,
            api_base: credentials.api_base.trim_end_matches('/').to_string(),
            api_key: credentials.api_key,
            client,
        }
    }

    async fn request_embeddings(&self, input: &[String]) -> Result<EmbeddingResponse> {
        let url = format!("{}/embeddings", self.api_base);

        let request = EmbeddingRequest {
            input,
            model: &self.model.name,
            encoding_format: Some("float"),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to embedding API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error {}: {}", status, error_text);
        }

        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding API response")?;

        Ok(embedding_response)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let start_time = Instant::now();
        let response = self.request_embeddings(texts).await?;

        if response.data.len() != texts.len() {
            anyhow::bail!(
                "Embedding API returned {} embeddings for {} texts",
                response.data.len(),
                texts.len()
            );
        }

        // Sort by index to ensure correct order
        let mut data = response.data;
        data.sort_by_key(|item| item.index);

        for item in &data {
            if item.embedding.len() != self.model.dimensions {
                anyhow::bail!(
                    "Embedding dimension mismatch: got {}, expected {}",
                    item.embedding.len(),
                    self.model.dimensions
                );
            }
        }

        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();

        tracing::debug!(
            count = embeddings.len(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            model = %self.model.name,
            "generated embeddings"
        );

        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.model.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model.name
    }
}

// Embedding API request/response structures

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    encoding_format: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn spec() -> EmbeddingModelSpec {
        EmbeddingModelSpec {
            id: Uuid::new_v4(),
            name: "text-embedding-3-small".to_string(),
            provider_id: Some(Uuid::new_v4()),
            dimensions: 1536,
        }
    }

    #[test]
    fn trailing_slash_in_api_base_is_normalized() {
        let provider = HttpEmbeddingProvider::new(
            spec(),
            ProviderCredentials {
                api_base: "https://api.example.com/v1/".to_string(),
                api_key: "sk-test".to_string(),
            },
        );
        assert_eq!(provider.api_base, "https://api.example.com/v1");
    }

    #[test]
    fn provider_reports_model_metadata() {
        let provider = HttpEmbeddingProvider::new(
            spec(),
            ProviderCredentials {
                api_base: "https://api.example.com/v1".to_string(),
                api_key: "sk-test".to_string(),
            },
        );
        assert_eq!(provider.model_name(), "text-embedding-3-small");
        assert_eq!(provider.dimensions(), 1536);
    }

    #[tokio::test]
    async fn empty_batch_short_circuits_without_network() {
        let provider = HttpEmbeddingProvider::new(
            spec(),
            ProviderCredentials {
                api_base: "http://127.0.0.1:1".to_string(),
                api_key: "sk-test".to_string(),
            },
        );
        let embeddings = provider.embed_batch(&[]).await.unwrap();
        assert!(embeddings.is_empty());
    }
}
