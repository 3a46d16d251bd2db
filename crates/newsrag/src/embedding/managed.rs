use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::EmbeddingModel;
use crate::error::EmbedError;

/// Remote calls per batch; the provider rejects larger payloads.
const MANAGED_BATCH_LIMIT: usize = 5;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 200;

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Remote text-embedding service client. Calls are idempotent, so transport
/// failures retry with a short backoff before surfacing as
/// `ProviderUnavailable`.
pub struct ManagedEmbeddings {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model_id: String,
    dimension: usize,
}

impl ManagedEmbeddings {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model_id: String,
        dimension: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint,
            api_key,
            model_id,
            dimension,
        }
    }

    async fn call_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let payload = json!({
            "model": self.model_id,
            "input": texts,
        });

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = RETRY_BASE_MS * (1 << (attempt - 1)) as u64;
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }

            let mut request = self.client.post(&self.endpoint).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    let parsed: EmbeddingResponse = response
                        .json()
                        .await
                        .map_err(|e| EmbedError::ProviderUnavailable(e.to_string()))?;
                    if parsed.data.len() != texts.len() {
                        return Err(EmbedError::ProviderUnavailable(format!(
                            "provider returned {} vectors for {} inputs",
                            parsed.data.len(),
                            texts.len()
                        )));
                    }
                    let mut vectors = Vec::with_capacity(parsed.data.len());
                    for row in parsed.data {
                        if row.embedding.len() != self.dimension {
                            return Err(EmbedError::DimensionMismatch {
                                expected: self.dimension,
                                got: row.embedding.len(),
                            });
                        }
                        vectors.push(row.embedding);
                    }
                    return Ok(vectors);
                }
                Ok(response) => {
                    let status = response.status();
                    last_error = format!("HTTP {}", status);
                    // Client errors are not retriable.
                    if status.is_client_error() {
                        break;
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            tracing::warn!(
                attempt = attempt + 1,
                error = %last_error,
                "embedding provider call failed"
            );
        }
        Err(EmbedError::ProviderUnavailable(last_error))
    }
}

#[async_trait]
impl EmbeddingModel for ManagedEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let input = [text.to_string()];
        let vectors = self.call_batch(&input).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::ProviderUnavailable("empty response".to_string()))
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_query(text).await
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MANAGED_BATCH_LIMIT) {
            vectors.extend(self.call_batch(batch).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn batch_limit(&self) -> usize {
        MANAGED_BATCH_LIMIT
    }
}
