use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::{NearDuplicatePolicy, PlatformConfig};
use crate::context::AppContext;
use crate::embedding::preprocess::{clean_text, MAX_EMBED_CHARS};
use crate::embedding::EmbeddingService;
use crate::error::{EmbedError, PlatformError, StoreError};
use crate::index::{ArticleVectors, VectorIndexer};
use crate::ingest::{
    ArticleParser, ContentHasher, DuplicateDetector, MetadataExtractor, TextChunker,
};
use crate::pipeline::source::{IngestInput, IngestSource};
use crate::store::ArticleStore;
use crate::types::{
    ArticleRecord, DedupDecision, EmbeddingRecord, LogStatus, MetadataRecord, Phase,
    ProcessingLogEntry,
};

/// How many recent articles form the near-duplicate comparison window.
const DEDUP_WINDOW: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub discovered: usize,
    pub duplicate_files: usize,
    pub ingested: usize,
    pub duplicate_articles: usize,
    pub failed: usize,
    pub embedded_articles: usize,
    pub indexed_vectors: usize,
    pub watermark: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

enum WorkerOutcome {
    Ingested {
        publish_time: Option<DateTime<Utc>>,
        ingested_at: DateTime<Utc>,
    },
    DuplicateFile,
    DuplicateArticle,
    Failed,
}

/// Per-run state shared by the parse workers.
struct WorkerCtx {
    store: Arc<ArticleStore>,
    parser: ArticleParser,
    extractor: MetadataExtractor,
    detector: DuplicateDetector,
    hasher: ContentHasher,
    policy: NearDuplicatePolicy,
    seen_file_hashes: DashMap<String, ()>,
}

/// Drives periodic ingestion: discover → file dedup → parallel parse →
/// dedup check → persist → batch embed → vector upsert → watermark advance.
/// Per-article failures are recovered locally and logged; only invariant
/// breaches abort the run.
pub struct IncrementalPipeline {
    store: Arc<ArticleStore>,
    embedder: Arc<EmbeddingService>,
    indexer: Arc<VectorIndexer>,
    config: Arc<PlatformConfig>,
    extractor: MetadataExtractor,
    chunker: TextChunker,
}

impl IncrementalPipeline {
    pub fn new(context: &AppContext) -> Self {
        Self {
            store: context.store.clone(),
            embedder: context.embedder.clone(),
            indexer: context.indexer.clone(),
            config: context.config.clone(),
            extractor: MetadataExtractor::new(context.config.embedding.indexing_text_budget),
            chunker: TextChunker::new(
                context.config.chunking.chunk_size,
                context.config.chunking.chunk_overlap,
                context.config.chunking.strategy,
            ),
        }
    }

    /// One incremental run over a source.
    pub async fn run(
        &self,
        source: &IngestSource,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<RunReport, PlatformError> {
        let started = Instant::now();
        let inputs = source.discover(watermark);
        let mut report = RunReport {
            discovered: inputs.len(),
            watermark,
            ..RunReport::default()
        };
        tracing::info!(discovered = inputs.len(), "incremental run starting");

        let ctx = Arc::new(WorkerCtx {
            store: self.store.clone(),
            parser: ArticleParser::new(ContentHasher::new(self.config.hashing.strength)),
            extractor: MetadataExtractor::new(self.config.embedding.indexing_text_budget),
            detector: DuplicateDetector::new(
                self.config.dedup.similarity_threshold,
                ContentHasher::new(self.config.hashing.strength),
            ),
            hasher: ContentHasher::new(self.config.hashing.strength),
            policy: self.config.dedup.policy,
            seen_file_hashes: DashMap::new(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.pipeline.max_workers.max(1)));
        let mut handles = Vec::with_capacity(inputs.len());
        for input in inputs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PlatformError::Config("worker pool closed".to_string()))?;
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_input(&ctx, input).await
            }));
        }

        let mut max_seen: Option<DateTime<Utc>> = None;
        for handle in handles {
            match handle.await {
                Ok(WorkerOutcome::Ingested {
                    publish_time,
                    ingested_at,
                }) => {
                    report.ingested += 1;
                    for ts in publish_time.into_iter().chain(Some(ingested_at)) {
                        max_seen = Some(max_seen.map_or(ts, |m| m.max(ts)));
                    }
                }
                Ok(WorkerOutcome::DuplicateFile) => report.duplicate_files += 1,
                Ok(WorkerOutcome::DuplicateArticle) => report.duplicate_articles += 1,
                Ok(WorkerOutcome::Failed) => report.failed += 1,
                Err(join_error) => {
                    tracing::error!(%join_error, "ingest worker panicked");
                    report.failed += 1;
                }
            }
        }

        let (embedded, vectors) = self.embed_pending().await?;
        report.embedded_articles = embedded;
        report.indexed_vectors = vectors;

        if let Some(seen) = max_seen {
            report.watermark = Some(report.watermark.map_or(seen, |w| w.max(seen)));
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            ingested = report.ingested,
            duplicates = report.duplicate_articles,
            failed = report.failed,
            embedded = report.embedded_articles,
            vectors = report.indexed_vectors,
            elapsed_ms = report.elapsed_ms,
            "incremental run finished"
        );
        Ok(report)
    }

    /// Embed persisted-but-unembedded articles and upsert their vectors,
    /// in store-side batches. Also callable on its own to drain a backlog.
    pub async fn embed_pending(&self) -> Result<(usize, usize), PlatformError> {
        let pending = self
            .store
            .list_unembedded(self.config.pipeline.max_per_run)?;
        if pending.is_empty() {
            return Ok((0, 0));
        }

        let mut embedded_articles = 0usize;
        let mut indexed_vectors = 0usize;

        for batch in pending.chunks(self.config.pipeline.batch_size.max(1)) {
            let mut batch_vectors = Vec::with_capacity(batch.len());
            for article in batch {
                let started = Instant::now();
                let metadata = match self.store.metadata_for(article.id)? {
                    Some(metadata) => metadata,
                    None => self.extractor.extract(article),
                };
                match self.vectors_for(article, &metadata).await {
                    Ok(records) => {
                        batch_vectors.push(ArticleVectors {
                            article_id: article.id,
                            records,
                            publish_ts: article.publish_time.map(|t| t.timestamp()),
                            article_type: metadata.article_type,
                            model_id: self.embedder.model_id().to_string(),
                        });
                        self.store
                            .append_log(
                                &ProcessingLogEntry::for_article(
                                    article.id,
                                    Phase::Embed,
                                    LogStatus::Success,
                                )
                                .with_duration_ms(started.elapsed().as_millis() as u64),
                            )
                            .ok();
                    }
                    Err(EmbedError::DimensionMismatch { expected, got }) => {
                        // Invariant breach: stop the run instead of looping
                        // over articles that can never index.
                        return Err(EmbedError::DimensionMismatch { expected, got }.into());
                    }
                    Err(err) => {
                        tracing::warn!(article_id = %article.id, %err, "embedding failed");
                        self.store.set_error(article.id, &err.to_string()).ok();
                        self.store
                            .append_log(
                                &ProcessingLogEntry::for_article(
                                    article.id,
                                    Phase::Embed,
                                    LogStatus::Error,
                                )
                                .with_message(err.to_string()),
                            )
                            .ok();
                    }
                }
            }

            match self.indexer.upsert_batch(&batch_vectors).await {
                Ok(upsert) => {
                    embedded_articles += upsert.upserted_articles;
                    indexed_vectors += upsert.upserted_vectors;
                }
                Err(PlatformError::Embed(err)) => return Err(err.into()),
                Err(PlatformError::Index(crate::error::IndexError::DimensionConflict {
                    name,
                    active,
                    requested,
                })) => {
                    return Err(crate::error::IndexError::DimensionConflict {
                        name,
                        active,
                        requested,
                    }
                    .into())
                }
                Err(err) => {
                    // Articles in the batch are already marked errored; the
                    // next run retries the rest.
                    tracing::error!(%err, "vector upsert batch failed");
                }
            }
        }

        Ok((embedded_articles, indexed_vectors))
    }

    /// Embedding records for one article. Short compositions embed as a
    /// single article-level vector (chunk 0); longer ones go through the
    /// chunker and embed chunk by chunk.
    async fn vectors_for(
        &self,
        article: &ArticleRecord,
        metadata: &MetadataRecord,
    ) -> Result<Vec<EmbeddingRecord>, EmbedError> {
        let composition = clean_text(&format!(
            "{} {} {} {}",
            article.title,
            article.title,
            article.summary.as_deref().unwrap_or(""),
            article.body
        ));

        if composition.chars().count() <= MAX_EMBED_CHARS {
            let embedding = self.embedder.embed_article(article, metadata).await?;
            return Ok(vec![EmbeddingRecord {
                article_id: article.id,
                chunk_index: 0,
                vector: embedding.vector,
                text_hash: embedding.text_hash,
                model_id: embedding.model_id,
                created_at: embedding.created_at,
            }]);
        }

        let chunks = self.chunker.chunk_all(&composition);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_texts(&texts).await?;
        let now = Utc::now();

        Ok(chunks
            .iter()
            .zip(vectors.into_iter())
            .map(|(chunk, vector)| EmbeddingRecord {
                article_id: article.id,
                chunk_index: chunk.index as u32,
                vector,
                text_hash: format!("{:x}", md5::compute(chunk.text.as_bytes())),
                model_id: self.embedder.model_id().to_string(),
                created_at: now,
            })
            .collect())
    }
}

async fn process_input(ctx: &WorkerCtx, input: IngestInput) -> WorkerOutcome {
    let started = Instant::now();
    let name = input.name();

    let bytes = match input {
        IngestInput::Bytes { bytes, .. } => bytes,
        IngestInput::File(path) => match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(file = %path.display(), %err, "failed to read input");
                log_outcome(ctx, None, Phase::Parse, LogStatus::Error, &err.to_string(), started);
                return WorkerOutcome::Failed;
            }
        },
    };

    // File-level dedup before parsing: identical bytes, one parse.
    let file_hash = ctx.hasher.raw_hash(&bytes);
    if ctx.seen_file_hashes.insert(file_hash, ()).is_some() {
        tracing::debug!(input = %name, "duplicate input file skipped");
        return WorkerOutcome::DuplicateFile;
    }

    let mut article = match ctx.parser.parse(&bytes) {
        Ok(article) => article,
        Err(err) => {
            tracing::warn!(input = %name, %err, "parse failed");
            log_outcome(ctx, None, Phase::Parse, LogStatus::Error, &err.to_string(), started);
            return WorkerOutcome::Failed;
        }
    };
    let metadata = ctx.extractor.extract(&article);

    // Exact-duplicate probe by hash, then similarity pass over a recent window.
    let mut comparison = match ctx.store.find_by_hash(&article.content_hash) {
        Ok(existing) => existing.into_iter().collect::<Vec<_>>(),
        Err(err) => {
            log_outcome(ctx, Some(article.id), Phase::Dedup, LogStatus::Error, &err.to_string(), started);
            return WorkerOutcome::Failed;
        }
    };
    match ctx.store.list_recent(DEDUP_WINDOW) {
        Ok(recent) => comparison.extend(recent),
        Err(err) => {
            tracing::warn!(%err, "recent-window load failed; exact dedup only");
        }
    }

    match ctx.detector.decide(&article, &comparison) {
        DedupDecision::ExactDuplicate { existing_id } => {
            tracing::info!(article = %article.external_id, existing = %existing_id, "exact duplicate rejected");
            log_outcome(
                ctx,
                Some(existing_id),
                Phase::Dedup,
                LogStatus::Duplicate,
                &format!("exact duplicate of {}", existing_id),
                started,
            );
            return WorkerOutcome::DuplicateArticle;
        }
        DedupDecision::NearDuplicate { existing_id, score } => match ctx.policy {
            NearDuplicatePolicy::Reject => {
                tracing::info!(
                    article = %article.external_id,
                    existing = %existing_id,
                    score,
                    "near duplicate rejected (strict policy)"
                );
                log_outcome(
                    ctx,
                    Some(existing_id),
                    Phase::Dedup,
                    LogStatus::Duplicate,
                    &format!("near duplicate of {} (score {:.3})", existing_id, score),
                    started,
                );
                return WorkerOutcome::DuplicateArticle;
            }
            NearDuplicatePolicy::Annotate => {
                article.similar_to = Some(existing_id);
                log_outcome(
                    ctx,
                    Some(article.id),
                    Phase::Dedup,
                    LogStatus::Success,
                    &format!("annotated as similar to {} (score {:.3})", existing_id, score),
                    started,
                );
            }
        },
        DedupDecision::TitleDuplicate { existing_id } => {
            // Information-loss guard: annotate, never reject.
            article.similar_to = Some(existing_id);
        }
        DedupDecision::Unique => {}
    }

    match ctx.store.insert_article(&article, &metadata) {
        Ok(id) => {
            log_outcome(ctx, Some(id), Phase::Parse, LogStatus::Success, "ingested", started);
            WorkerOutcome::Ingested {
                publish_time: article.publish_time,
                ingested_at: article.ingested_at,
            }
        }
        Err(StoreError::Conflict(msg)) => {
            // Raced with another worker inserting the same article.
            tracing::debug!(article = %article.external_id, %msg, "insert conflict");
            log_outcome(ctx, Some(article.id), Phase::Dedup, LogStatus::Duplicate, &msg, started);
            WorkerOutcome::DuplicateArticle
        }
        Err(err) => {
            tracing::warn!(article = %article.external_id, %err, "persist failed");
            log_outcome(ctx, Some(article.id), Phase::Parse, LogStatus::Error, &err.to_string(), started);
            WorkerOutcome::Failed
        }
    }
}

fn log_outcome(
    ctx: &WorkerCtx,
    article_id: Option<Uuid>,
    phase: Phase,
    status: LogStatus,
    message: &str,
    started: Instant,
) {
    let mut entry = ProcessingLogEntry::new(phase, status)
        .with_message(message)
        .with_duration_ms(started.elapsed().as_millis() as u64);
    entry.article_id = article_id;
    if let Err(err) = ctx.store.append_log(&entry) {
        tracing::warn!(%err, "processing log append failed");
    }
}
