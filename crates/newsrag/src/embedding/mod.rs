pub mod fallback;
pub mod local;
pub mod managed;
pub mod preprocess;
pub mod service;

use async_trait::async_trait;

use crate::config::{EmbeddingBackendKind, EmbeddingConfig};
use crate::error::EmbedError;

pub use fallback::HashEmbeddings;
pub use local::LocalEmbeddings;
pub use managed::ManagedEmbeddings;
pub use service::EmbeddingService;

/// Capability set every embedding backend provides.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Batch embedding; implementations split internally at `batch_limit`.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn dimension(&self) -> usize;

    /// Persisted into `embedding_model`; fallback vectors must be
    /// recognizable from this label alone.
    fn model_id(&self) -> &str;

    fn batch_limit(&self) -> usize;
}

/// Tagged union over the configured backends. The hash fallback keeps the
/// pipeline functional (and reproducible) when no real model is reachable.
pub enum EmbeddingBackend {
    Managed(ManagedEmbeddings),
    Local(LocalEmbeddings),
    Fallback(HashEmbeddings),
}

impl EmbeddingBackend {
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        match config.backend {
            EmbeddingBackendKind::Managed => match &config.endpoint {
                Some(endpoint) => EmbeddingBackend::Managed(ManagedEmbeddings::new(
                    endpoint.clone(),
                    std::env::var(&config.api_key_env).ok(),
                    config.model_id.clone(),
                    config.dimension,
                )),
                None => {
                    tracing::warn!(
                        "managed embedding backend selected without an endpoint; \
                         using the deterministic hash fallback"
                    );
                    EmbeddingBackend::Fallback(HashEmbeddings::new(config.dimension))
                }
            },
            EmbeddingBackendKind::Local => match LocalEmbeddings::load(&config.model_dir) {
                Ok(local) => EmbeddingBackend::Local(local),
                Err(err) => {
                    tracing::warn!(%err, "local embedding model unavailable; using hash fallback");
                    EmbeddingBackend::Fallback(HashEmbeddings::new(config.dimension))
                }
            },
            EmbeddingBackendKind::HashFallback => {
                EmbeddingBackend::Fallback(HashEmbeddings::new(config.dimension))
            }
        }
    }

    fn inner(&self) -> &dyn EmbeddingModel {
        match self {
            EmbeddingBackend::Managed(m) => m,
            EmbeddingBackend::Local(l) => l,
            EmbeddingBackend::Fallback(f) => f,
        }
    }
}

#[async_trait]
impl EmbeddingModel for EmbeddingBackend {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.inner().embed_query(text).await
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.inner().embed_document(text).await
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.inner().embed_documents(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner().dimension()
    }

    fn model_id(&self) -> &str {
        self.inner().model_id()
    }

    fn batch_limit(&self) -> usize {
        self.inner().batch_limit()
    }
}

/// L2-normalize in place; zero vectors are left untouched.
pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Write a batch of article embeddings as a JSON sidecar file. Escape hatch
/// for moving vectors between environments without a provider round trip.
pub fn save_embeddings_to_file(
    path: &std::path::Path,
    embeddings: &[crate::types::ArticleEmbedding],
) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(embeddings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

pub fn load_embeddings_from_file(
    path: &std::path::Path,
) -> std::io::Result<Vec<crate::types::ArticleEmbedding>> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArticleEmbedding;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    async fn sidecar_round_trips() {
        let model = HashEmbeddings::new(16);
        let vector = model.embed_document("사이드카 테스트").await.unwrap();
        let embedding = ArticleEmbedding {
            article_id: Uuid::new_v4(),
            vector,
            text_hash: "abc".to_string(),
            metadata_hash: "def".to_string(),
            model_id: model.model_id().to_string(),
            created_at: Utc::now(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        save_embeddings_to_file(&path, std::slice::from_ref(&embedding)).unwrap();

        let loaded = load_embeddings_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].article_id, embedding.article_id);
        assert_eq!(loaded[0].vector, embedding.vector);
    }

    #[test]
    fn fallback_selected_when_local_model_missing() {
        let config = crate::config::EmbeddingConfig {
            backend: crate::config::EmbeddingBackendKind::Local,
            dimension: 768,
            model_dir: std::path::PathBuf::from("/definitely/not/here"),
            endpoint: None,
            api_key_env: "EMBEDDING_API_KEY".to_string(),
            model_id: "m".to_string(),
            cache_size: 10,
            indexing_text_budget: 2048,
        };
        let backend = EmbeddingBackend::from_config(&config);
        assert!(matches!(backend, EmbeddingBackend::Fallback(_)));
        assert!(backend.model_id().starts_with("hash-fallback"));
    }
}
