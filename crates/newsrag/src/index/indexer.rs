use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::client::{AnnIndexClient, MetadataPredicate, ProviderIndexStatus, VectorKey, VectorUpsert};
use crate::config::IndexingConfig;
use crate::error::{EmbedError, IndexError, PlatformError};
use crate::store::ArticleStore;
use crate::types::{
    ArticleType, EmbeddingRecord, IndexState, LogStatus, Phase, ProcessingLogEntry,
};

/// One article's vectors headed for the index, with the metadata persisted
/// beside them for filtering.
#[derive(Debug, Clone)]
pub struct ArticleVectors {
    pub article_id: Uuid,
    pub records: Vec<EmbeddingRecord>,
    pub publish_ts: Option<i64>,
    pub article_type: ArticleType,
    pub model_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub upserted_articles: usize,
    pub upserted_vectors: usize,
    pub failed_articles: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub scanned_articles: usize,
    pub missing_vectors: usize,
    pub reupserted: usize,
}

/// Owns the ANN index lifecycle and reconciles embeddings into it with
/// at-least-once semantics. Provider failures retry with exponential
/// backoff; exhausted retries mark the affected articles and surface as
/// permanent.
pub struct VectorIndexer {
    client: Arc<dyn AnnIndexClient>,
    store: Arc<ArticleStore>,
    config: IndexingConfig,
}

impl VectorIndexer {
    pub fn new(
        client: Arc<dyn AnnIndexClient>,
        store: Arc<ArticleStore>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            client,
            store,
            config,
        }
    }

    /// Idempotent: verifies the active index state or creates a fresh one.
    /// A conflicting dimension on the active state is fatal.
    pub async fn ensure_index(&self) -> Result<IndexState, PlatformError> {
        if let Some(active) = self.store.active_index_state()? {
            if active.dimensions != self.config.dimensions {
                return Err(IndexError::DimensionConflict {
                    name: active.name.clone(),
                    active: active.dimensions,
                    requested: self.config.dimensions,
                }
                .into());
            }
            self.client
                .create_index(&active.name, active.dimensions, active.distance)
                .await?;
            return Ok(active);
        }

        let provider_index_id = self
            .client
            .create_index(
                &self.config.index_name,
                self.config.dimensions,
                self.config.distance,
            )
            .await?;

        let mut state = IndexState::new(
            self.config.index_name.clone(),
            self.config.dimensions,
            self.config.distance,
        );
        state.provider_index_id = Some(provider_index_id);
        state.active = true;
        state.last_updated = Some(Utc::now());
        self.store.save_index_state(&state)?;

        tracing::info!(index = %state.name, dimensions = state.dimensions, "vector index ready");
        Ok(state)
    }

    /// Tie the active index to a query endpoint.
    pub async fn deploy(
        &self,
        endpoint_name: &str,
        deployed_id: &str,
    ) -> Result<IndexState, PlatformError> {
        let mut state = self
            .store
            .active_index_state()?
            .ok_or(IndexError::NotCreated)?;
        let index_id = state
            .provider_index_id
            .clone()
            .ok_or(IndexError::NotCreated)?;

        let endpoint_id = self.client.create_endpoint(endpoint_name).await?;
        let deployed = self
            .client
            .deploy(&index_id, &endpoint_id, deployed_id)
            .await?;

        state.endpoint_id = Some(endpoint_id);
        state.deployed_id = Some(deployed);
        state.last_updated = Some(Utc::now());
        self.store.save_index_state(&state)?;
        Ok(state)
    }

    /// Upsert one store-side batch. The provider call covers the whole batch
    /// and retries as a unit; on success every article's embeddings and its
    /// `is_embedded` flag commit in one store transaction per article.
    pub async fn upsert_batch(&self, batch: &[ArticleVectors]) -> Result<UpsertReport, PlatformError> {
        if batch.is_empty() {
            return Ok(UpsertReport::default());
        }
        let state = self
            .store
            .active_index_state()?
            .ok_or(IndexError::NotCreated)?;
        let index_id = state
            .provider_index_id
            .clone()
            .ok_or(IndexError::NotCreated)?;

        // Every vector must match the active index width before anything
        // leaves the process.
        for article in batch {
            for record in &article.records {
                if record.vector.len() != state.dimensions {
                    return Err(EmbedError::DimensionMismatch {
                        expected: state.dimensions,
                        got: record.vector.len(),
                    }
                    .into());
                }
            }
        }

        let upserts: Vec<VectorUpsert> = batch
            .iter()
            .flat_map(|article| {
                article.records.iter().map(|record| {
                    let mut fields = HashMap::new();
                    fields.insert(
                        "publish_ts".to_string(),
                        json!(article.publish_ts.unwrap_or(0)),
                    );
                    fields.insert(
                        "article_type".to_string(),
                        json!(article.article_type.as_str()),
                    );
                    VectorUpsert {
                        key: VectorKey::new(record.article_id, record.chunk_index),
                        vector: record.vector.clone(),
                        fields,
                    }
                })
            })
            .collect();

        let started = Instant::now();
        if let Err(final_error) = self.upsert_with_retry(&index_id, &upserts).await {
            for article in batch {
                self.store
                    .set_error(article.article_id, &format!("index upsert failed: {}", final_error))
                    .ok();
                self.store
                    .append_log(
                        &ProcessingLogEntry::for_article(
                            article.article_id,
                            Phase::IndexUpsert,
                            LogStatus::Error,
                        )
                        .with_message(final_error.to_string())
                        .with_duration_ms(started.elapsed().as_millis() as u64),
                    )
                    .ok();
            }
            return Err(final_error.into());
        }

        let mut report = UpsertReport::default();
        for article in batch {
            match self.store.commit_embeddings(
                article.article_id,
                &article.records,
                &article.model_id,
            ) {
                Ok(()) => {
                    report.upserted_articles += 1;
                    report.upserted_vectors += article.records.len();
                    self.store
                        .append_log(
                            &ProcessingLogEntry::for_article(
                                article.article_id,
                                Phase::IndexUpsert,
                                LogStatus::Success,
                            )
                            .with_duration_ms(started.elapsed().as_millis() as u64),
                        )
                        .ok();
                }
                Err(err) => {
                    report.failed_articles += 1;
                    tracing::warn!(article_id = %article.article_id, %err, "embedding commit failed");
                    self.store
                        .append_log(
                            &ProcessingLogEntry::for_article(
                                article.article_id,
                                Phase::IndexUpsert,
                                LogStatus::Error,
                            )
                            .with_message(err.to_string()),
                        )
                        .ok();
                }
            }
        }

        self.store
            .bump_index_vectors(&state.name, report.upserted_vectors as u64)?;
        Ok(report)
    }

    async fn upsert_with_retry(
        &self,
        index_id: &str,
        upserts: &[VectorUpsert],
    ) -> Result<(), IndexError> {
        let mut attempt: u32 = 0;
        loop {
            match self.client.upsert(index_id, upserts).await {
                Ok(()) => return Ok(()),
                Err(IndexError::ProviderTransient(msg)) if attempt + 1 < self.config.max_attempts => {
                    let backoff = self.config.retry_base_ms * (1u64 << attempt.min(16));
                    tracing::warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff,
                        error = %msg,
                        "provider upsert failed; retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(IndexError::ProviderTransient(msg)) => {
                    return Err(IndexError::ProviderPermanent(format!(
                        "retries exhausted after {} attempts: {}",
                        self.config.max_attempts, msg
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Ranked nearest-neighbor lookup against the active index.
    pub async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataPredicate>,
    ) -> Result<Vec<(VectorKey, f32)>, PlatformError> {
        let state = self
            .store
            .active_index_state()?
            .ok_or(IndexError::NotCreated)?;
        let index_id = state
            .provider_index_id
            .clone()
            .ok_or(IndexError::NotCreated)?;
        if vector.len() != state.dimensions {
            return Err(EmbedError::DimensionMismatch {
                expected: state.dimensions,
                got: vector.len(),
            }
            .into());
        }
        Ok(self.client.query(&index_id, vector, top_k, filter).await?)
    }

    /// Tombstone every vector of a retired article. Returns the number of
    /// chunk keys marked.
    pub async fn tombstone_article(&self, article_id: Uuid) -> Result<usize, PlatformError> {
        let state = self
            .store
            .active_index_state()?
            .ok_or(IndexError::NotCreated)?;
        let index_id = state
            .provider_index_id
            .clone()
            .ok_or(IndexError::NotCreated)?;

        let keys: Vec<VectorKey> = self
            .store
            .embeddings_for(article_id)?
            .iter()
            .map(|r| VectorKey::new(r.article_id, r.chunk_index))
            .collect();
        if !keys.is_empty() {
            self.client.tombstone(&index_id, &keys).await?;
        }
        Ok(keys.len())
    }

    /// Walk embedded articles with a bounded cursor and re-upsert any
    /// `(article_id, chunk_index)` the provider no longer reports.
    pub async fn reconcile(&self, page_size: usize) -> Result<ReconcileReport, PlatformError> {
        let state = self
            .store
            .active_index_state()?
            .ok_or(IndexError::NotCreated)?;
        let index_id = state
            .provider_index_id
            .clone()
            .ok_or(IndexError::NotCreated)?;

        let mut report = ReconcileReport::default();
        let mut offset = 0usize;
        loop {
            let page = self.store.list_embedded(page_size, offset)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            let mut missing: Vec<VectorUpsert> = Vec::new();
            for article in &page {
                report.scanned_articles += 1;
                let metadata = self.store.metadata_for(article.id)?;
                let article_type = metadata
                    .map(|m| m.article_type)
                    .unwrap_or(ArticleType::General);

                for record in self.store.embeddings_for(article.id)? {
                    let key = VectorKey::new(record.article_id, record.chunk_index);
                    if self.client.contains(&index_id, &key).await? {
                        continue;
                    }
                    report.missing_vectors += 1;
                    let mut fields = HashMap::new();
                    fields.insert(
                        "publish_ts".to_string(),
                        json!(article.publish_time.map(|t| t.timestamp()).unwrap_or(0)),
                    );
                    fields.insert("article_type".to_string(), json!(article_type.as_str()));
                    missing.push(VectorUpsert {
                        key,
                        vector: record.vector,
                        fields,
                    });
                }
            }

            for chunk in missing.chunks(self.config.batch_size.max(1)) {
                self.upsert_with_retry(&index_id, chunk).await?;
                report.reupserted += chunk.len();
            }
        }

        if report.reupserted > 0 {
            tracing::info!(
                scanned = report.scanned_articles,
                reupserted = report.reupserted,
                "reconciliation repaired missing vectors"
            );
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<(IndexState, ProviderIndexStatus), PlatformError> {
        let state = self
            .store
            .active_index_state()?
            .ok_or(IndexError::NotCreated)?;
        let index_id = state
            .provider_index_id
            .clone()
            .ok_or(IndexError::NotCreated)?;
        let provider = self.client.get_index_status(&index_id).await?;
        Ok((state, provider))
    }

    /// Administrative teardown: provider index, endpoint, and stored state.
    pub async fn delete_index(&self) -> Result<(), PlatformError> {
        let Some(state) = self.store.active_index_state()? else {
            return Ok(());
        };
        if let Some(index_id) = &state.provider_index_id {
            self.client.delete_index(index_id).await?;
        }
        if let Some(endpoint_id) = &state.endpoint_id {
            self.client.delete_endpoint(endpoint_id).await?;
        }
        self.store.delete_index_state(&state.name)?;
        Ok(())
    }
}
