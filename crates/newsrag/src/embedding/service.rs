use std::num::NonZeroUsize;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;

use super::preprocess::{clean_text, embedding_text, truncate_chars, MAX_EMBED_CHARS};
use super::{EmbeddingBackend, EmbeddingModel};
use crate::config::EmbeddingConfig;
use crate::error::EmbedError;
use crate::types::{ArticleEmbedding, ArticleRecord, MetadataRecord};

/// Embedding front door: preprocessing, the text-hash LRU cache, and the
/// article-level `embed_article` surface. Does not persist anything.
pub struct EmbeddingService {
    backend: EmbeddingBackend,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    dimension: usize,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let backend = EmbeddingBackend::from_config(config);
        if backend.dimension() != config.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: config.dimension,
                got: backend.dimension(),
            });
        }
        let capacity = NonZeroUsize::new(config.cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            backend,
            cache: Mutex::new(LruCache::new(capacity)),
            dimension: config.dimension,
        })
    }

    pub fn with_backend(backend: EmbeddingBackend, cache_size: usize) -> Self {
        let dimension = backend.dimension();
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            backend,
            cache: Mutex::new(LruCache::new(capacity)),
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn batch_limit(&self) -> usize {
        self.backend.batch_limit()
    }

    /// Embed query text (cleaned and truncated like document text).
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let prepared = truncate_chars(&clean_text(text), MAX_EMBED_CHARS);
        let key = self.cache_key(&prepared);
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(cached.clone());
        }
        let vector = self.backend.embed_query(&prepared).await?;
        self.check_dimension(&vector)?;
        self.cache.lock().put(key, vector.clone());
        Ok(vector)
    }

    /// Embed one article using its indexing text (or the preprocessed
    /// title/summary/body when the extractor produced none).
    pub async fn embed_article(
        &self,
        article: &ArticleRecord,
        metadata: &MetadataRecord,
    ) -> Result<ArticleEmbedding, EmbedError> {
        let text = article_text(article, metadata);
        let key = self.cache_key(&text);

        let cached = self.cache.lock().get(&key).cloned();
        let vector = match cached {
            Some(vector) => vector,
            None => {
                let vector = self.backend.embed_document(&text).await?;
                self.check_dimension(&vector)?;
                self.cache.lock().put(key, vector.clone());
                vector
            }
        };

        Ok(ArticleEmbedding {
            article_id: article.id,
            vector,
            text_hash: format!("{:x}", md5::compute(text.as_bytes())),
            metadata_hash: metadata.metadata_hash.clone(),
            model_id: self.backend.model_id().to_string(),
            created_at: Utc::now(),
        })
    }

    /// Embed arbitrary chunk texts (already extracted by the chunker),
    /// batching at the backend's limit. Cached texts skip the backend call.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        let mut miss_texts = Vec::new();

        {
            let mut cache = self.cache.lock();
            for (i, text) in texts.iter().enumerate() {
                let key = self.cache_key(text);
                if let Some(cached) = cache.get(&key) {
                    results[i] = Some(cached.clone());
                } else {
                    miss_indices.push(i);
                    miss_texts.push(text.clone());
                }
            }
        }

        if !miss_texts.is_empty() {
            let vectors = self.backend.embed_documents(&miss_texts).await?;
            if vectors.len() != miss_texts.len() {
                return Err(EmbedError::ProviderUnavailable(format!(
                    "backend returned {} vectors for {} texts",
                    vectors.len(),
                    miss_texts.len()
                )));
            }
            let mut cache = self.cache.lock();
            for (slot, (text, vector)) in miss_indices
                .iter()
                .zip(miss_texts.iter().zip(vectors.into_iter()))
            {
                self.check_dimension(&vector)?;
                cache.put(self.cache_key(text), vector.clone());
                results[*slot] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn cache_key(&self, text: &str) -> String {
        format!(
            "{}:{:x}",
            self.backend.model_id(),
            md5::compute(text.as_bytes())
        )
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), EmbedError> {
        if vector.len() != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        Ok(())
    }
}

/// Text selected for article-level embedding: prefer the extractor's
/// weighted indexing text, fall back to preprocessed raw fields.
pub fn article_text(article: &ArticleRecord, metadata: &MetadataRecord) -> String {
    if metadata.indexing_text.is_empty() {
        embedding_text(
            &article.title,
            &article.body,
            article.summary.as_deref().unwrap_or(""),
        )
    } else {
        truncate_chars(&clean_text(&metadata.indexing_text), MAX_EMBED_CHARS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbeddings;
    use crate::ingest::extractor::MetadataExtractor;
    use crate::ingest::hasher::ContentHasher;
    use chrono::Utc;
    use uuid::Uuid;

    fn service() -> EmbeddingService {
        EmbeddingService::with_backend(
            EmbeddingBackend::Fallback(HashEmbeddings::new(768)),
            100,
        )
    }

    fn article() -> (ArticleRecord, MetadataRecord) {
        let hasher = ContentHasher::default();
        let record = ArticleRecord {
            id: Uuid::new_v4(),
            external_id: "A-100".to_string(),
            title: "삼성전자 주가 급등".to_string(),
            subtitle: None,
            body: "삼성전자 주가가 급등했다.".to_string(),
            summary: None,
            writers: None,
            publish_time: None,
            registered_time: None,
            modified_time: None,
            source_url: None,
            media_code: None,
            edition: None,
            section: None,
            page: None,
            article_year: None,
            categories: vec![],
            keywords: vec![],
            stock_codes: vec![],
            images: vec![],
            content_hash: hasher.article_content_hash("삼성전자 주가 급등", "삼성전자 주가가 급등했다.", ""),
            ingested_at: Utc::now(),
            is_embedded: false,
            embedding_model: None,
            embedded_at: None,
            processing_error: None,
            similar_to: None,
        };
        let metadata = MetadataExtractor::default().extract(&record);
        (record, metadata)
    }

    #[tokio::test]
    async fn embed_article_is_deterministic_on_fallback() {
        let service = service();
        let (record, metadata) = article();
        let a = service.embed_article(&record, &metadata).await.unwrap();
        let b = service.embed_article(&record, &metadata).await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert_eq!(a.text_hash, b.text_hash);
        assert_eq!(a.model_id, "hash-fallback-768d");
        assert_eq!(a.vector.len(), 768);
    }

    #[tokio::test]
    async fn embed_texts_preserves_order_with_cache_hits() {
        let service = service();
        let texts = vec![
            "금리 인상".to_string(),
            "환율 변동".to_string(),
            "금리 인상".to_string(),
        ];
        // Warm one entry.
        service.embed_query("금리 인상").await.ok();
        let vectors = service.embed_texts(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let service = EmbeddingService::with_backend(
            EmbeddingBackend::Fallback(HashEmbeddings::new(4)),
            10,
        );
        // Service itself accepts the backend's own dimension.
        let v = service.embed_query("테스트").await.unwrap();
        assert_eq!(v.len(), 4);

        let config = crate::config::EmbeddingConfig {
            backend: crate::config::EmbeddingBackendKind::HashFallback,
            dimension: 768,
            model_dir: std::path::PathBuf::from("/nonexistent"),
            endpoint: None,
            api_key_env: "EMBEDDING_API_KEY".to_string(),
            model_id: "m".to_string(),
            cache_size: 10,
            indexing_text_budget: 2048,
        };
        // Backend matches config dimension here, so construction succeeds.
        assert!(EmbeddingService::new(&config).is_ok());
    }

    #[test]
    fn article_text_prefers_indexing_text() {
        let (record, mut metadata) = article();
        assert!(article_text(&record, &metadata).contains("삼성전자"));
        metadata.indexing_text = String::new();
        let fallback = article_text(&record, &metadata);
        // Title weighting from the raw-field path.
        assert_eq!(fallback.matches("삼성전자 주가 급등").count(), 2);
    }
}
