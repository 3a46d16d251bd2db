use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::context::AppContext;
use crate::embedding::EmbeddingService;
use crate::error::{PlatformError, RetrievalError};
use crate::index::{FilterClause, FilterOp, MetadataPredicate, VectorIndexer};
use crate::query::AnalyzedQuery;
use crate::store::ArticleStore;
use crate::types::{ArticleRecord, SearchFilters};

/// Fusion weights; must be non-negative and sum to at most 1.0.
#[derive(Debug, Clone, Copy)]
pub struct SearchWeights {
    pub vector: f64,
    pub keyword: f64,
    pub rerank: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            keyword: 0.3,
            rerank: 0.1,
        }
    }
}

/// Per-query knobs, defaulted from the search config.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub similarity_threshold: f64,
    pub weights: SearchWeights,
    pub filters: SearchFilters,
    pub max_context_length: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_threshold: 0.7,
            weights: SearchWeights::default(),
            filters: SearchFilters::default(),
            max_context_length: 4000,
        }
    }
}

/// One ranked result with its per-component scores.
#[derive(Debug, Clone)]
pub struct RetrievedDoc {
    pub article: ArticleRecord,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub rerank_bonus: f64,
    pub final_score: f64,
    pub from_vector: bool,
    pub from_keyword: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub docs: Vec<RetrievedDoc>,
    /// True when one backend failed and the other carried the query.
    pub degraded: bool,
}

/// Fuses dense, lexical, and metadata signals into one ranked list.
/// Vector and keyword search run concurrently; a failure on either side
/// degrades to the surviving backend instead of failing the query.
pub struct HybridRetrievalEngine {
    store: Arc<ArticleStore>,
    embedder: Arc<EmbeddingService>,
    indexer: Arc<VectorIndexer>,
    candidate_multiplier: usize,
}

impl HybridRetrievalEngine {
    pub fn new(context: &AppContext) -> Self {
        Self {
            store: context.store.clone(),
            embedder: context.embedder.clone(),
            indexer: context.indexer.clone(),
            candidate_multiplier: context.config.search.candidate_multiplier,
        }
    }

    pub async fn retrieve(
        &self,
        analyzed: &AnalyzedQuery,
        options: &QueryOptions,
    ) -> Result<RetrievalOutcome, PlatformError> {
        let fetch_k = options.top_k * self.candidate_multiplier.max(1);
        let query_text = if analyzed.normalized_text.is_empty() {
            analyzed.original.as_str()
        } else {
            analyzed.normalized_text.as_str()
        };

        let (vector_result, keyword_result) = tokio::join!(
            self.vector_candidates(query_text, fetch_k, options),
            self.keyword_candidates(analyzed, fetch_k),
        );

        let mut degraded = false;
        let vector_hits = match vector_result {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(%err, "vector search failed; degrading to keyword-only");
                degraded = true;
                Vec::new()
            }
        };
        let keyword_hits = match keyword_result {
            Ok(hits) => hits,
            Err(err) => {
                if degraded {
                    tracing::error!(%err, "keyword search failed with vector side already down");
                    return Err(RetrievalError::NoBackend.into());
                }
                tracing::warn!(%err, "keyword search failed; degrading to vector-only");
                degraded = true;
                Vec::new()
            }
        };

        // Metadata filter pass over both streams; failures drop the candidate.
        let passes = |pair: &(ArticleRecord, f64)| options.filters.matches(&pair.0);
        let vector_hits: Vec<_> = vector_hits.into_iter().filter(|p| passes(p)).collect();
        let keyword_hits: Vec<_> = keyword_hits.into_iter().filter(|p| passes(p)).collect();

        let query_tokens = if analyzed.keywords.is_empty() {
            analyzed
                .normalized_text
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            analyzed.keywords.clone()
        };

        let docs = fuse_and_rank(
            vector_hits,
            keyword_hits,
            &query_tokens,
            &options.weights,
            Utc::now(),
            options.top_k,
        );

        Ok(RetrievalOutcome { docs, degraded })
    }

    /// Dense side: embed the query, search the ANN index with a pushed-down
    /// date predicate, fold chunk hits to per-article maxima, drop weak hits,
    /// hydrate in one bulk read.
    async fn vector_candidates(
        &self,
        query_text: &str,
        fetch_k: usize,
        options: &QueryOptions,
    ) -> Result<Vec<(ArticleRecord, f64)>, PlatformError> {
        let vector = self.embedder.embed_query(query_text).await?;
        let predicate = date_predicate(&options.filters);
        let hits = self
            .indexer
            .query(&vector, fetch_k, predicate.as_ref())
            .await?;

        let mut best: HashMap<Uuid, f64> = HashMap::new();
        for (key, score) in hits {
            let score = score as f64;
            if score < options.similarity_threshold {
                continue;
            }
            let entry = best.entry(key.article_id).or_insert(f64::MIN);
            if score > *entry {
                *entry = score;
            }
        }

        let mut ranked: Vec<(Uuid, f64)> = best.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(fetch_k);

        let ids: Vec<Uuid> = ranked.iter().map(|(id, _)| *id).collect();
        let articles = self.store.bulk_load(&ids)?;
        let by_id: HashMap<Uuid, ArticleRecord> =
            articles.into_iter().map(|a| (a.id, a)).collect();

        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| by_id.get(&id).cloned().map(|a| (a, score)))
            .collect())
    }

    /// Lexical side: candidates from the store adapter, scored by query-token
    /// overlap (title weighted over summary).
    async fn keyword_candidates(
        &self,
        analyzed: &AnalyzedQuery,
        fetch_k: usize,
    ) -> Result<Vec<(ArticleRecord, f64)>, PlatformError> {
        let tokens: Vec<String> = if analyzed.keywords.is_empty() {
            analyzed
                .normalized_text
                .split_whitespace()
                .map(str::to_string)
                .collect()
        } else {
            analyzed.keywords.clone()
        };
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.store.keyword_candidates(&tokens, fetch_k)?;
        let mut scored: Vec<(ArticleRecord, f64)> = candidates
            .into_iter()
            .map(|article| {
                let score = keyword_score(&tokens, &article);
                (article, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(fetch_k);
        Ok(scored)
    }
}

/// 0.7·title-overlap + 0.3·summary-overlap, each `|q ∩ field| / |q|`.
pub fn keyword_score(query_tokens: &[String], article: &ArticleRecord) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let query: HashSet<String> = query_tokens.iter().map(|t| t.to_lowercase()).collect();
    let title: HashSet<String> = article
        .title
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let summary: HashSet<String> = article
        .summary
        .as_deref()
        .unwrap_or("")
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let overlap = |field: &HashSet<String>| {
        query.intersection(field).count() as f64 / query.len() as f64
    };
    0.7 * overlap(&title) + 0.3 * overlap(&summary)
}

/// Push the date-range filter down to the ANN provider; everything else is
/// cheaper to apply after hydration.
fn date_predicate(filters: &SearchFilters) -> Option<MetadataPredicate> {
    let mut clauses = Vec::new();
    if let Some(start) = filters.start_date {
        clauses.push(FilterClause::new(
            "publish_ts",
            FilterOp::Ge,
            json!(start.timestamp()),
        ));
    }
    if let Some(end) = filters.end_date {
        clauses.push(FilterClause::new(
            "publish_ts",
            FilterOp::Le,
            json!(end.timestamp()),
        ));
    }
    if clauses.is_empty() {
        None
    } else {
        Some(MetadataPredicate::single_group(clauses))
    }
}

/// Merge both candidate streams keyed by article id, apply rerank bonuses,
/// and order by final score with deterministic tie-breaking.
pub fn fuse_and_rank(
    vector_hits: Vec<(ArticleRecord, f64)>,
    keyword_hits: Vec<(ArticleRecord, f64)>,
    query_tokens: &[String],
    weights: &SearchWeights,
    now: DateTime<Utc>,
    top_k: usize,
) -> Vec<RetrievedDoc> {
    struct Fused {
        article: ArticleRecord,
        vector_score: f64,
        keyword_score: f64,
        from_vector: bool,
        from_keyword: bool,
    }

    let mut fused: HashMap<Uuid, Fused> = HashMap::new();
    for (article, score) in vector_hits {
        fused.insert(
            article.id,
            Fused {
                article,
                vector_score: score,
                keyword_score: 0.0,
                from_vector: true,
                from_keyword: false,
            },
        );
    }
    for (article, score) in keyword_hits {
        fused
            .entry(article.id)
            .and_modify(|entry| {
                entry.keyword_score = score;
                entry.from_keyword = true;
            })
            .or_insert(Fused {
                article,
                vector_score: 0.0,
                keyword_score: score,
                from_vector: false,
                from_keyword: true,
            });
    }

    let lowered_tokens: Vec<String> = query_tokens.iter().map(|t| t.to_lowercase()).collect();
    let mut docs: Vec<RetrievedDoc> = fused
        .into_values()
        .map(|entry| {
            let recency = recency_bonus(entry.article.publish_time, now);
            let multi_source = if entry.from_vector && entry.from_keyword {
                1.0
            } else {
                0.0
            };
            let title = entry.article.title.to_lowercase();
            let title_hit = if lowered_tokens.iter().any(|t| title.contains(t)) {
                1.0
            } else {
                0.0
            };
            let rerank_bonus = 0.1 * recency + 0.05 * multi_source + 0.1 * title_hit;
            let final_score = weights.vector * entry.vector_score
                + weights.keyword * entry.keyword_score
                + weights.rerank * rerank_bonus;
            RetrievedDoc {
                article: entry.article,
                vector_score: entry.vector_score,
                keyword_score: entry.keyword_score,
                rerank_bonus,
                final_score,
                from_vector: entry.from_vector,
                from_keyword: entry.from_keyword,
            }
        })
        .collect();

    docs.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.article.publish_time.cmp(&a.article.publish_time))
            .then_with(|| b.article.body_length().cmp(&a.article.body_length()))
            .then_with(|| a.article.id.cmp(&b.article.id))
    });
    docs.truncate(top_k);
    docs
}

/// 1.0 inside 30 days, 0.5 inside 365, 0 beyond (or unknown).
fn recency_bonus(publish_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    match publish_time {
        Some(published) if published > now - Duration::days(30) => 1.0,
        Some(published) if published > now - Duration::days(365) => 0.5,
        Some(_) => 0.0,
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn article(external_id: &str, title: &str, body: &str, age_days: i64) -> ArticleRecord {
        let hasher = crate::ingest::ContentHasher::default();
        ArticleRecord {
            id: uuid::Uuid::new_v4(),
            external_id: external_id.to_string(),
            title: title.to_string(),
            subtitle: None,
            body: body.to_string(),
            summary: Some(format!("{} 요약", title)),
            writers: None,
            publish_time: Some(Utc::now() - Duration::days(age_days)),
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
            content_hash: hasher.article_content_hash(title, body, ""),
            ingested_at: Utc::now(),
            is_embedded: true,
            embedding_model: None,
            embedded_at: None,
            processing_error: None,
            similar_to: None,
        }
    }

    #[test]
    fn keyword_score_weights_title_over_summary() {
        let tokens = vec!["삼성전자".to_string(), "주가".to_string()];
        let full_match = article("K-1", "삼성전자 주가", "본문", 1);
        let score = keyword_score(&tokens, &full_match);
        assert!((score - 1.0).abs() < 1e-9, "score {}", score);

        let summary_only = article("K-2", "무관한 제목", "본문", 1);
        let score = keyword_score(&tokens, &summary_only);
        assert!(score < 0.31);
    }

    #[test]
    fn fusion_prefers_title_match_with_default_weights() {
        // A: exact title token match via keyword search, modest vector score.
        // B: highest vector similarity, fresh.
        // C: near-copy of B but 400 days old (stale recency bonus).
        let a = article("A", "삼성전자 주가 급등", "A 본문", 5);
        let b = article("B", "반도체 시장 분석", "B 본문", 5);
        let c = article("C", "반도체 시장 분석", "C 본문", 400);

        let tokens = vec!["삼성전자".to_string(), "주가".to_string()];
        let weights = SearchWeights::default();
        let docs = fuse_and_rank(
            vec![(a.clone(), 0.80), (b.clone(), 0.95), (c.clone(), 0.94)],
            vec![(a.clone(), 1.0)],
            &tokens,
            &weights,
            Utc::now(),
            3,
        );

        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].article.external_id, "A");
        // C ranks below B: nearly equal vector score, stale recency bonus.
        let pos_b = docs.iter().position(|d| d.article.external_id == "B").unwrap();
        let pos_c = docs.iter().position(|d| d.article.external_id == "C").unwrap();
        assert!(pos_b < pos_c);
    }

    #[test]
    fn missing_scores_default_to_zero() {
        let a = article("A", "금리 뉴스", "본문", 10);
        let docs = fuse_and_rank(
            vec![],
            vec![(a, 0.5)],
            &["금리".to_string()],
            &SearchWeights::default(),
            Utc::now(),
            5,
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].vector_score, 0.0);
        assert!(docs[0].from_keyword);
        assert!(!docs[0].from_vector);
    }

    #[test]
    fn output_is_sorted_and_bounded() {
        let articles: Vec<(ArticleRecord, f64)> = (0..10)
            .map(|i| {
                (
                    article(&format!("N-{}", i), "기사", "본문", 10),
                    0.1 * i as f64,
                )
            })
            .collect();
        let docs = fuse_and_rank(
            articles,
            vec![],
            &[],
            &SearchWeights::default(),
            Utc::now(),
            4,
        );
        assert_eq!(docs.len(), 4);
        for pair in docs.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
    }

    #[test]
    fn ties_break_by_recency_then_length_then_id() {
        let newer = article("T-1", "동일 점수", "짧은 본문", 1);
        let older = article("T-2", "동일 점수", "짧은 본문", 100);
        // Zero weights force identical final scores.
        let weights = SearchWeights {
            vector: 0.0,
            keyword: 0.0,
            rerank: 0.0,
        };
        let docs = fuse_and_rank(
            vec![(older.clone(), 0.9), (newer.clone(), 0.1)],
            vec![],
            &[],
            &weights,
            Utc::now(),
            2,
        );
        assert_eq!(docs[0].article.external_id, "T-1");
    }
}
