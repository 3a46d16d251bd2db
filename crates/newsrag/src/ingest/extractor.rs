use chrono::{Duration, Utc};
use regex::Regex;

use crate::types::{ArticleRecord, ArticleType, EntityBuckets, MetadataRecord};

/// Derives a [`MetadataRecord`] from a parsed article: regex entity buckets,
/// a keyword-cue article type, an importance score, the weighted indexing
/// text, and the metadata fingerprint.
///
/// The pattern sets are deliberately replaceable: anything honoring the same
/// bucket contract (deduplicated, ordered by first occurrence) can stand in
/// for them, including a proper NER stage.
pub struct MetadataExtractor {
    company_patterns: Vec<Regex>,
    person_patterns: Vec<Regex>,
    location_patterns: Vec<Regex>,
    date_patterns: Vec<Regex>,
    number_patterns: Vec<Regex>,
    type_cues: Vec<(ArticleType, Vec<&'static str>)>,
    indexing_text_budget: usize,
}

impl MetadataExtractor {
    pub fn new(indexing_text_budget: usize) -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
        };

        Self {
            company_patterns: compile(&[
                r"([가-힣]+(?:전자|그룹|기업|컨소시엄|홀딩스|증권|은행|보험|생명|카드))",
                r"([가-힣A-Za-z0-9]+(?:주식회사|㈜))",
            ]),
            person_patterns: compile(&[
                r"([가-힣]{2,4})\s*(?:회장|사장|대표|이사|임원|부장|팀장|총재)",
                r"([가-힣]{2,4})\s*(?:씨|님|기자)",
            ]),
            location_patterns: compile(&[
                r"([가-힣]{2,}(?:특별시|광역시))",
                r"([가-힣]+(?:시|도|구|군|동|읍|면))",
            ]),
            date_patterns: compile(&[
                r"(\d{4}년\s*\d{1,2}월\s*\d{1,2}일)",
                r"(\d{4}-\d{2}-\d{2})",
                r"(\d{4}\.\d{2}\.\d{2})",
            ]),
            number_patterns: compile(&[
                r"(\d{1,3}(?:,\d{3})*(?:조원|억원|만원|원|달러|배))",
                r"(\d+(?:\.\d+)?%)",
            ]),
            type_cues: vec![
                (ArticleType::Financial, vec!["배당", "주가", "증시", "상장", "코스피"]),
                (ArticleType::Mna, vec!["인수", "합병", "m&a", "투자"]),
                (ArticleType::People, vec!["연봉", "채용", "인사", "승진"]),
                (ArticleType::Policy, vec!["정책", "법안", "규제"]),
                (ArticleType::Technology, vec!["기술", "ai", "디지털", "스마트"]),
            ],
            indexing_text_budget,
        }
    }

    pub fn extract(&self, article: &ArticleRecord) -> MetadataRecord {
        let scan_text = format!("{} {}", article.title, article.body);
        let entities = self.extract_entities(&scan_text);
        let article_type = self.infer_article_type(article);
        let importance_score = self.importance_score(article, &entities);
        let indexing_text = self.indexing_text(article, &entities);
        let metadata_hash = self.metadata_hash(article);

        MetadataRecord {
            article_id: article.id,
            entities,
            article_type,
            importance_score,
            indexing_text,
            metadata_hash,
            content_length: article.body.chars().count(),
            word_count: article.body.split_whitespace().count(),
            has_images: article.has_images(),
            has_stock_codes: article.has_stock_codes(),
        }
    }

    /// Entity pass alone; the query analyzer shares this pattern library.
    pub fn extract_entities(&self, text: &str) -> EntityBuckets {
        EntityBuckets {
            companies: bucket(text, &self.company_patterns),
            persons: bucket(text, &self.person_patterns),
            locations: bucket(text, &self.location_patterns),
            dates: bucket(text, &self.date_patterns),
            numbers: bucket(text, &self.number_patterns),
        }
    }

    /// First matching cue wins; the priority order is fixed.
    fn infer_article_type(&self, article: &ArticleRecord) -> ArticleType {
        let haystack = format!("{} {}", article.title, article.body).to_lowercase();
        for (article_type, cues) in &self.type_cues {
            if cues.iter().any(|cue| haystack.contains(cue)) {
                return *article_type;
            }
        }
        ArticleType::General
    }

    /// Bounded score: keyword count, stock-code presence, entity volume,
    /// plus length and recency bonuses. Truncated to two decimals.
    fn importance_score(&self, article: &ArticleRecord, entities: &EntityBuckets) -> f64 {
        let mut score = 0.5 * article.keywords.len() as f64;
        if article.has_stock_codes() {
            score += 2.0;
        }
        score += 0.3 * entities.total() as f64;

        let body_length = article.body.chars().count();
        if body_length > 1000 {
            score += 1.0;
        } else if body_length > 500 {
            score += 0.5;
        }

        if let Some(publish_time) = article.publish_time {
            if publish_time > Utc::now() - Duration::days(30) {
                score += 0.5;
            }
        }

        (score * 100.0).trunc() / 100.0
    }

    /// Weighted concatenation for the embedder: title twice, then summary,
    /// categories, keywords, and entities, capped by the byte budget.
    fn indexing_text(&self, article: &ArticleRecord, entities: &EntityBuckets) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if !article.title.is_empty() {
            parts.push(&article.title);
            parts.push(&article.title);
        }
        if let Some(summary) = article.summary.as_deref() {
            if !summary.is_empty() {
                parts.push(summary);
            }
        }
        for category in &article.categories {
            parts.extend(category.names());
        }
        for keyword in &article.keywords {
            parts.push(&keyword.keyword);
        }
        for (entity, _) in entities.iter_all() {
            parts.push(entity);
        }

        let mut text = parts.join(" ");
        if text.len() > self.indexing_text_budget {
            let mut cut = self.indexing_text_budget;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }

    /// 128-bit fingerprint over identity, title, and sorted classification.
    /// Category and keyword order in the feed does not affect the hash.
    fn metadata_hash(&self, article: &ArticleRecord) -> String {
        let mut categories: Vec<String> = article
            .categories
            .iter()
            .flat_map(|c| c.names().into_iter().map(str::to_string))
            .collect();
        categories.sort();
        let mut keywords: Vec<&str> = article
            .keywords
            .iter()
            .map(|k| k.keyword.as_str())
            .collect();
        keywords.sort();

        let payload = format!(
            "{}|{}|{}|{}",
            article.external_id,
            article.title,
            categories.join(","),
            keywords.join(",")
        );
        format!("{:x}", md5::compute(payload.as_bytes()))
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new(2048)
    }
}

/// Run every pattern over the text, then deduplicate by first occurrence.
fn bucket(text: &str, patterns: &[Regex]) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for pattern in patterns {
        for caps in pattern.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
    }
    found.sort_by_key(|(start, _)| *start);

    let mut seen = std::collections::HashSet::new();
    found
        .into_iter()
        .filter_map(|(_, value)| seen.insert(value.clone()).then_some(value))
        .collect()
}
