use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PlatformConfig;
use crate::context::AppContext;
use crate::error::{IndexError, PlatformError};
use crate::index::ProviderIndexStatus;
use crate::ingest::ContentHasher;
use crate::llm::{compose_response, GeneratedResponse, GenerativeClient, RemoteChatClient};
use crate::pipeline::{
    cleanup_duplicates, CleanupReport, IncrementalPipeline, IngestSource, RunReport,
};
use crate::query::QueryAnalyzer;
use crate::retrieval::{ContextBuilder, HybridRetrievalEngine, QueryOptions, RetrievedDoc, SearchWeights};
use crate::store::StoreStats;
use crate::types::{
    ArticleType, IndexState, KeywordKind, LogStatus, Phase, ProcessingLogEntry, SearchFilters,
};

/// Answer to one query, with the evidence that produced it.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub response: GeneratedResponse,
    pub retrieved_docs: Vec<RetrievedDoc>,
    pub context_length: usize,
    pub processing_time_ms: u64,
    /// True when one retrieval backend failed and the other carried the query.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestCounts {
    pub downloaded: usize,
    pub ingested: usize,
    pub embedded: usize,
}

#[derive(Debug, Clone)]
pub struct IncrementalReport {
    pub counts: IngestCounts,
    pub watermark_advanced_to: Option<DateTime<Utc>>,
    pub run: RunReport,
}

#[derive(Debug, Clone)]
pub struct SystemStats {
    pub store: StoreStats,
    pub type_counts: Vec<(ArticleType, u64)>,
    pub index: Option<(IndexState, ProviderIndexStatus)>,
}

/// The platform's front door: ingestion runs, hybrid queries, and the
/// administrative index lifecycle, all over one explicit context.
pub struct NewsRagEngine {
    context: AppContext,
    pipeline: IncrementalPipeline,
    retrieval: HybridRetrievalEngine,
    analyzer: QueryAnalyzer,
    llm: Option<Arc<dyn GenerativeClient>>,
}

impl NewsRagEngine {
    pub async fn new(config: PlatformConfig) -> Result<Self, PlatformError> {
        let llm = RemoteChatClient::from_config(&config.llm)
            .map(|client| Arc::new(client) as Arc<dyn GenerativeClient>);
        let context = AppContext::initialize(config).await?;
        Ok(Self::with_context(context, llm))
    }

    pub fn with_context(context: AppContext, llm: Option<Arc<dyn GenerativeClient>>) -> Self {
        let pipeline = IncrementalPipeline::new(&context);
        let retrieval = HybridRetrievalEngine::new(&context);
        let analyzer = QueryAnalyzer::new(context.config.search.max_query_keywords);
        Self {
            context,
            pipeline,
            retrieval,
            analyzer,
            llm,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Query options seeded from the configured search defaults.
    pub fn default_options(&self) -> QueryOptions {
        let search = &self.context.config.search;
        QueryOptions {
            top_k: search.top_k,
            similarity_threshold: search.similarity_threshold,
            weights: SearchWeights {
                vector: search.vector_weight,
                keyword: search.keyword_weight,
                rerank: search.rerank_weight,
            },
            filters: SearchFilters::default(),
            max_context_length: search.max_context_length,
        }
    }

    /// Answer a natural-language query: analyze, retrieve, build a bounded
    /// context, generate (or fall back), and audit the round trip.
    pub async fn query(
        &self,
        query: &str,
        options: Option<QueryOptions>,
    ) -> Result<QueryResponse, PlatformError> {
        let started = Instant::now();
        let mut options = options.unwrap_or_else(|| self.default_options());
        let analyzed = self.analyzer.analyze(query);

        // Explicit filters win; analyzer-derived hints fill the gaps.
        merge_filters(&mut options.filters, &analyzed.filters);

        let outcome = self.retrieval.retrieve(&analyzed, &options).await?;
        let built = ContextBuilder::new(options.max_context_length).build(&outcome.docs);
        let response = compose_response(
            self.llm.as_deref(),
            query,
            &built.text,
            built.references,
        )
        .await;

        let processing_time_ms = started.elapsed().as_millis() as u64;
        self.context
            .store
            .append_log(
                &ProcessingLogEntry::new(
                    Phase::Query,
                    if outcome.degraded {
                        LogStatus::Error
                    } else {
                        LogStatus::Success
                    },
                )
                .with_message(format!(
                    "query returned {} docs (degraded: {})",
                    outcome.docs.len(),
                    outcome.degraded
                ))
                .with_duration_ms(processing_time_ms),
            )
            .ok();

        Ok(QueryResponse {
            response,
            context_length: built.text.len(),
            retrieved_docs: outcome.docs,
            processing_time_ms,
            degraded: outcome.degraded,
        })
    }

    /// `query` with an overall deadline. Partial progress past the deadline
    /// is discarded and the caller sees a timeout.
    pub async fn query_with_deadline(
        &self,
        query: &str,
        options: Option<QueryOptions>,
        deadline: std::time::Duration,
    ) -> Result<QueryResponse, PlatformError> {
        match tokio::time::timeout(deadline, self.query(query, options)).await {
            Ok(result) => result,
            Err(_) => Err(crate::error::RetrievalError::Timeout.into()),
        }
    }

    /// Full ingest over a source (no watermark).
    pub async fn ingest(&self, source: &IngestSource) -> Result<RunReport, PlatformError> {
        self.context.indexer.ensure_index().await?;
        self.pipeline.run(source, None).await
    }

    /// Incremental ingest from a watermark; returns download/ingest/embed
    /// counts and the advanced watermark.
    pub async fn incremental_ingest(
        &self,
        source: &IngestSource,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<IncrementalReport, PlatformError> {
        self.context.indexer.ensure_index().await?;
        let run = self.pipeline.run(source, watermark).await?;
        Ok(IncrementalReport {
            counts: IngestCounts {
                downloaded: run.discovered,
                ingested: run.ingested,
                embedded: run.embedded_articles,
            },
            watermark_advanced_to: run.watermark,
            run,
        })
    }

    /// Drain the persisted-but-unembedded backlog.
    pub async fn embed_pending(&self) -> Result<(usize, usize), PlatformError> {
        self.pipeline.embed_pending().await
    }

    // ── Administrative index lifecycle ─────────────────────────────────────

    pub async fn ensure_index(&self) -> Result<IndexState, PlatformError> {
        self.context.indexer.ensure_index().await
    }

    pub async fn deploy_index(
        &self,
        endpoint_name: &str,
        deployed_id: &str,
    ) -> Result<IndexState, PlatformError> {
        self.context.indexer.deploy(endpoint_name, deployed_id).await
    }

    pub async fn delete_index(&self) -> Result<(), PlatformError> {
        self.context.indexer.delete_index().await
    }

    pub async fn reconcile_index(
        &self,
        page_size: usize,
    ) -> Result<crate::index::ReconcileReport, PlatformError> {
        self.context.indexer.reconcile(page_size).await
    }

    pub async fn cleanup_duplicates(&self, page_size: usize) -> Result<CleanupReport, PlatformError> {
        let hasher = ContentHasher::new(self.context.config.hashing.strength);
        cleanup_duplicates(
            &self.context.store,
            &self.context.indexer,
            &hasher,
            page_size,
        )
        .await
    }

    // ── Introspection surfaces ─────────────────────────────────────────────

    pub async fn system_stats(&self) -> Result<SystemStats, PlatformError> {
        let store = self.context.store.stats()?;
        let type_counts = self.context.store.type_counts()?;
        let index = match self.context.indexer.status().await {
            Ok(status) => Some(status),
            Err(PlatformError::Index(IndexError::NotCreated)) => None,
            Err(err) => return Err(err),
        };
        Ok(SystemStats {
            store,
            type_counts,
            index,
        })
    }

    pub fn search_suggestions(
        &self,
        fragment: &str,
        limit: usize,
    ) -> Result<Vec<String>, PlatformError> {
        Ok(self.context.store.search_suggestions(fragment, limit)?)
    }

    pub fn popular_keywords(
        &self,
        days: i64,
        limit: usize,
    ) -> Result<Vec<(String, KeywordKind, u64)>, PlatformError> {
        Ok(self.context.store.popular_keywords(days, limit)?)
    }

    pub fn recent_logs(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessingLogEntry>, PlatformError> {
        Ok(self.context.store.recent_logs(limit)?)
    }
}

/// Fill unset explicit filter fields from analyzer hints.
fn merge_filters(explicit: &mut SearchFilters, derived: &SearchFilters) {
    if explicit.start_date.is_none() {
        explicit.start_date = derived.start_date;
    }
    if explicit.end_date.is_none() {
        explicit.end_date = derived.end_date;
    }
    if explicit.categories.is_empty() {
        explicit.categories = derived.categories.clone();
    }
    if explicit.writers.is_empty() {
        explicit.writers = derived.writers.clone();
    }
    if explicit.required_keywords.is_empty() {
        explicit.required_keywords = derived.required_keywords.clone();
    }
    if explicit.stock_codes.is_empty() {
        explicit.stock_codes = derived.stock_codes.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnnProviderKind, EmbeddingBackendKind};
    use crate::embedding::{EmbeddingBackend, EmbeddingService, HashEmbeddings};
    use crate::index::{JsonFileIndex, VectorIndexer};
    use crate::llm::ResponseSource;
    use crate::store::ArticleStore;
    use chrono::TimeZone;

    const DIM: usize = 8;

    fn xml(id: &str, title: &str, body: &str, date: &str, category: &str) -> String {
        format!(
            "<doc><article><wms_article><art_id>{}</art_id>\
             <title><![CDATA[{}]]></title>\
             <service_daytime>{}</service_daytime></wms_article>\
             <wms_article_body><body><![CDATA[{}]]></body></wms_article_body>\
             <wms_code_classes><wms_code_class>\
             <large_code_nm><![CDATA[{}]]></large_code_nm>\
             </wms_code_class></wms_code_classes>\
             </article></doc>",
            id, title, date, body, category
        )
    }

    async fn engine_with_index(dir: &std::path::Path, create_index: bool) -> NewsRagEngine {
        let mut config = PlatformConfig::default();
        config.data_dir = dir.to_path_buf();
        config.embedding.backend = EmbeddingBackendKind::HashFallback;
        config.embedding.dimension = DIM;
        config.indexing.provider = AnnProviderKind::LocalJson;
        config.indexing.dimensions = DIM;
        config.indexing.retry_base_ms = 1;

        let store = Arc::new(ArticleStore::in_memory().unwrap());
        let embedder = Arc::new(EmbeddingService::with_backend(
            EmbeddingBackend::Fallback(HashEmbeddings::new(DIM)),
            100,
        ));
        let client = Arc::new(JsonFileIndex::new(&dir.join("json_index")).unwrap());
        let indexer = Arc::new(VectorIndexer::new(
            client,
            store.clone(),
            config.indexing.clone(),
        ));
        let context = AppContext::from_parts(config, store, embedder, indexer);
        if create_index {
            context.indexer.ensure_index().await.unwrap();
        }
        NewsRagEngine::with_context(context, None)
    }

    async fn seed(engine: &NewsRagEngine, docs: &[(String, &str)]) {
        for (body, name) in docs {
            let source = IngestSource::Upload {
                name: name.to_string(),
                bytes: body.clone().into_bytes(),
            };
            engine.pipeline.run(&source, None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn query_returns_ranked_docs_and_fallback_answer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_index(dir.path(), true).await;
        seed(
            &engine,
            &[
                (
                    xml("Q-1", "삼성전자 주가 급등", "삼성전자 주가가 올랐다.", "2024-03-10 09:00:00", "증권"),
                    "a.xml",
                ),
                (
                    xml("Q-2", "유가 하락", "국제 유가가 내렸다.", "2024-03-11 09:00:00", "국제"),
                    "b.xml",
                ),
            ],
        )
        .await;

        let response = engine.query("삼성전자 주가", None).await.unwrap();
        assert!(!response.retrieved_docs.is_empty());
        assert_eq!(response.retrieved_docs[0].article.external_id, "Q-1");
        assert_eq!(response.response.source, ResponseSource::Fallback);
        assert!(response.context_length <= 4000);
        assert!(!response.degraded);

        // The query round-trip is audited.
        let logs = engine.recent_logs(5).unwrap();
        assert!(logs.iter().any(|l| l.phase == Phase::Query));
    }

    #[tokio::test]
    async fn date_and_category_filters_restrict_results() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_index(dir.path(), true).await;
        seed(
            &engine,
            &[
                (
                    xml("F-23", "증권 시장 결산", "2023년 증시 결산.", "2023-06-01 09:00:00", "증권"),
                    "f23.xml",
                ),
                (
                    xml("F-24", "증권 시장 전망", "2024년 증시 전망.", "2024-06-01 09:00:00", "증권"),
                    "f24.xml",
                ),
                (
                    xml("F-25", "증권 시장 예측", "2025년 증시 예측.", "2025-06-01 09:00:00", "증권"),
                    "f25.xml",
                ),
                (
                    xml("F-NC", "증권 아닌 기사", "2024년 다른 뉴스.", "2024-06-02 09:00:00", "정치"),
                    "fnc.xml",
                ),
            ],
        )
        .await;

        let mut options = engine.default_options();
        options.filters.start_date = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        options.filters.end_date = Some(Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap());
        options.filters.categories = vec!["증권".to_string()];

        let response = engine.query("증권 시장", Some(options)).await.unwrap();
        assert_eq!(response.retrieved_docs.len(), 1);
        assert_eq!(response.retrieved_docs[0].article.external_id, "F-24");
    }

    #[tokio::test]
    async fn vector_backend_failure_degrades_to_keyword_only() {
        let dir = tempfile::tempdir().unwrap();
        // No index created: the vector side fails, the store carries the query.
        let engine = engine_with_index(dir.path(), false).await;
        seed(
            &engine,
            &[(
                xml("D-1", "금리 인상 결정", "기준금리가 인상됐다.", "2024-03-12 09:00:00", "경제"),
                "d.xml",
            )],
        )
        .await;

        let response = engine.query("금리 인상", None).await.unwrap();
        assert!(response.degraded);
        assert!(!response.retrieved_docs.is_empty());
        assert!(response.retrieved_docs.iter().all(|d| d.from_keyword));
        assert!(response.processing_time_ms < 60_000);
    }

    #[tokio::test]
    async fn incremental_ingest_reports_counts_and_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_index(dir.path(), true).await;

        let source = IngestSource::Upload {
            name: "inc.xml".to_string(),
            bytes: xml("I-1", "수출 증가", "수출이 늘었다.", "2024-03-14 09:00:00", "경제").into_bytes(),
        };
        let report = engine.incremental_ingest(&source, None).await.unwrap();
        assert_eq!(report.counts.downloaded, 1);
        assert_eq!(report.counts.ingested, 1);
        assert_eq!(report.counts.embedded, 1);
        assert!(report.watermark_advanced_to.is_some());

        let stats = engine.system_stats().await.unwrap();
        assert_eq!(stats.store.total_articles, 1);
        assert!(stats.index.is_some());
        assert!(stats
            .type_counts
            .iter()
            .any(|(ty, count)| *ty != ArticleType::General || *count > 0));
    }

    #[tokio::test]
    async fn suggestions_and_popular_keywords_flow_through() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_index(dir.path(), true).await;
        seed(
            &engine,
            &[(
                xml(
                    "S-1",
                    "반도체 수출 호조",
                    "삼성전자의 반도체 수출이 증가했다.",
                    "2024-03-14 09:00:00",
                    "경제",
                ),
                "s.xml",
            )],
        )
        .await;

        let suggestions = engine.search_suggestions("반도체", 5).unwrap();
        assert_eq!(suggestions, vec!["반도체 수출 호조"]);
        let keywords = engine.popular_keywords(365 * 10, 10).unwrap();
        assert!(!keywords.is_empty());
    }
}
