use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{IndexError, PlatformError};
use crate::index::VectorIndexer;
use crate::ingest::ContentHasher;
use crate::store::ArticleStore;
use crate::types::{LogStatus, Phase, ProcessingLogEntry};

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub scanned: usize,
    pub duplicate_groups: usize,
    pub removed_articles: usize,
    pub tombstoned_vectors: usize,
}

/// Admin operation: group the corpus by content hash recomputed at the
/// active strength, keep the oldest article per group, and retire the rest
/// (tombstone upsert in the ANN index, then store delete). Useful after a
/// hash-strength change, when stored hashes no longer witness equality.
pub async fn cleanup_duplicates(
    store: &ArticleStore,
    indexer: &VectorIndexer,
    hasher: &ContentHasher,
    page_size: usize,
) -> Result<CleanupReport, PlatformError> {
    let mut report = CleanupReport::default();
    let mut groups: HashMap<String, Vec<(Uuid, DateTime<Utc>)>> = HashMap::new();

    let mut offset = 0usize;
    loop {
        let page = store.list_page(page_size.max(1), offset)?;
        if page.is_empty() {
            break;
        }
        offset += page.len();
        for article in &page {
            report.scanned += 1;
            let hash = hasher.article_content_hash(
                &article.title,
                &article.body,
                article.summary.as_deref().unwrap_or(""),
            );
            groups
                .entry(hash)
                .or_default()
                .push((article.id, article.ingested_at));
        }
    }

    for (hash, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        report.duplicate_groups += 1;
        // Oldest survivor; ties break on id for determinism.
        members.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        let survivor = members[0].0;

        for (loser, _) in members.into_iter().skip(1) {
            match indexer.tombstone_article(loser).await {
                Ok(marked) => report.tombstoned_vectors += marked,
                Err(PlatformError::Index(IndexError::NotCreated)) => {
                    // No index deployed; the store delete is still correct.
                }
                Err(err) => return Err(err),
            }
            if store.delete_article(loser)? {
                report.removed_articles += 1;
            }
            store
                .append_log(
                    &ProcessingLogEntry::for_article(loser, Phase::Dedup, LogStatus::Duplicate)
                        .with_message(format!(
                            "removed in favor of {} (hash group {})",
                            survivor, hash
                        )),
                )
                .ok();
        }
    }

    tracing::info!(
        scanned = report.scanned,
        groups = report.duplicate_groups,
        removed = report.removed_articles,
        "duplicate cleanup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::index::JsonFileIndex;
    use crate::ingest::{ArticleParser, MetadataExtractor};
    use std::sync::Arc;

    fn xml(id: &str, title: &str, body: &str) -> String {
        format!(
            "<doc><article><wms_article><art_id>{}</art_id><title>{}</title></wms_article>\
             <wms_article_body><body>{}</body></wms_article_body></article></doc>",
            id, title, body
        )
    }

    #[tokio::test]
    async fn keeps_oldest_per_hash_group() {
        let store = Arc::new(ArticleStore::in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(JsonFileIndex::new(dir.path()).unwrap());
        let mut config = PlatformConfig::default().indexing;
        config.dimensions = 4;
        let indexer = VectorIndexer::new(client, store.clone(), config);

        // Two articles with the same content under different external ids
        // (inserted with distinct stored hashes, as after a strength change).
        let parser = ArticleParser::new(ContentHasher::default());
        let extractor = MetadataExtractor::default();

        let mut first = parser
            .parse(xml("X-1", "같은 기사", "같은 내용이다.").as_bytes())
            .unwrap();
        first.ingested_at = Utc::now() - chrono::Duration::hours(1);
        let meta = extractor.extract(&first);
        store.insert_article(&first, &meta).unwrap();

        let mut second = parser
            .parse(xml("X-2", "같은 기사", "같은 내용이다.").as_bytes())
            .unwrap();
        // Distinct stored hash so the unique constraint admits it.
        second.content_hash = format!("{}-alt", second.content_hash);
        let meta = extractor.extract(&second);
        store.insert_article(&second, &meta).unwrap();

        let hasher = ContentHasher::default();
        let report = cleanup_duplicates(&store, &indexer, &hasher, 10)
            .await
            .unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.duplicate_groups, 1);
        assert_eq!(report.removed_articles, 1);
        assert!(store.find_by_id(first.id).unwrap().is_some());
        assert!(store.find_by_id(second.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_corpus_is_untouched() {
        let store = Arc::new(ArticleStore::in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(JsonFileIndex::new(dir.path()).unwrap());
        let mut config = PlatformConfig::default().indexing;
        config.dimensions = 4;
        let indexer = VectorIndexer::new(client, store.clone(), config);

        let parser = ArticleParser::new(ContentHasher::default());
        let extractor = MetadataExtractor::default();
        for (id, title, body) in [
            ("Y-1", "기사 하나", "내용 하나."),
            ("Y-2", "기사 둘", "내용 둘."),
        ] {
            let article = parser.parse(xml(id, title, body).as_bytes()).unwrap();
            let meta = extractor.extract(&article);
            store.insert_article(&article, &meta).unwrap();
        }

        let hasher = ContentHasher::default();
        let report = cleanup_duplicates(&store, &indexer, &hasher, 1).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.removed_articles, 0);
        assert_eq!(store.stats().unwrap().total_articles, 2);
    }
}
