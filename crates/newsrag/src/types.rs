use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical news record produced by the parser. Immutable after the store
/// commits it, except for the processing-state fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// Locally minted, stable across the article's lifetime.
    pub id: Uuid,
    /// Source-assigned id (`art_id` in the feed), globally unique.
    pub external_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub body: String,
    pub summary: Option<String>,
    pub writers: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub registered_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
    pub media_code: Option<String>,
    pub edition: Option<String>,
    pub section: Option<String>,
    pub page: Option<String>,
    pub article_year: Option<i32>,
    pub categories: Vec<Category>,
    pub keywords: Vec<Keyword>,
    pub stock_codes: Vec<String>,
    pub images: Vec<ArticleImage>,
    /// Fingerprint of the normalized content, hex-encoded.
    pub content_hash: String,
    pub ingested_at: DateTime<Utc>,

    // Processing state. Transitions are monotonic: is_embedded false → true,
    // processing_error null → set.
    pub is_embedded: bool,
    pub embedding_model: Option<String>,
    pub embedded_at: Option<DateTime<Utc>>,
    pub processing_error: Option<String>,
    /// Set when the near-duplicate policy is `annotate`: id of the article
    /// this one was judged similar to.
    pub similar_to: Option<Uuid>,
}

impl ArticleRecord {
    pub fn body_length(&self) -> usize {
        self.body.chars().count()
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    pub fn has_stock_codes(&self) -> bool {
        !self.stock_codes.is_empty()
    }
}

/// Large/middle/small category hierarchy row from the feed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Category {
    pub code_id: Option<String>,
    pub code_nm: Option<String>,
    pub large_code_id: Option<String>,
    pub large_code_nm: Option<String>,
    pub middle_code_id: Option<String>,
    pub middle_code_nm: Option<String>,
    pub small_code_id: Option<String>,
    pub small_code_nm: Option<String>,
}

impl Category {
    /// All non-empty category names, large to small.
    pub fn names(&self) -> Vec<&str> {
        [
            self.large_code_nm.as_deref(),
            self.middle_code_nm.as_deref(),
            self.small_code_nm.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordKind {
    General,
    Person,
    Company,
    Location,
    Date,
    Number,
}

impl KeywordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Person => "person",
            Self::Company => "company",
            Self::Location => "location",
            Self::Date => "date",
            Self::Number => "number",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "person" => Self::Person,
            "company" => Self::Company,
            "location" => Self::Location,
            "date" => Self::Date,
            "number" => Self::Number,
            _ => Self::General,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyword {
    pub keyword: String,
    pub kind: KeywordKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleImage {
    pub image_url: Option<String>,
    pub image_caption: Option<String>,
}

/// Entity buckets extracted by the pattern library. Each bucket is
/// deduplicated and ordered by first occurrence in the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityBuckets {
    pub companies: Vec<String>,
    pub persons: Vec<String>,
    pub locations: Vec<String>,
    pub dates: Vec<String>,
    pub numbers: Vec<String>,
}

impl EntityBuckets {
    pub fn total(&self) -> usize {
        self.companies.len()
            + self.persons.len()
            + self.locations.len()
            + self.dates.len()
            + self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Every entity with its keyword kind, bucket by bucket.
    pub fn iter_all(&self) -> impl Iterator<Item = (&str, KeywordKind)> {
        self.companies
            .iter()
            .map(|s| (s.as_str(), KeywordKind::Company))
            .chain(self.persons.iter().map(|s| (s.as_str(), KeywordKind::Person)))
            .chain(
                self.locations
                    .iter()
                    .map(|s| (s.as_str(), KeywordKind::Location)),
            )
            .chain(self.dates.iter().map(|s| (s.as_str(), KeywordKind::Date)))
            .chain(self.numbers.iter().map(|s| (s.as_str(), KeywordKind::Number)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleType {
    Financial,
    Mna,
    People,
    Policy,
    Technology,
    General,
}

impl ArticleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::Mna => "mna",
            Self::People => "people",
            Self::Policy => "policy",
            Self::Technology => "technology",
            Self::General => "general",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "financial" => Self::Financial,
            "mna" => Self::Mna,
            "people" => Self::People,
            "policy" => Self::Policy,
            "technology" => Self::Technology,
            _ => Self::General,
        }
    }
}

/// Derived metadata for one article, produced by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub article_id: Uuid,
    pub entities: EntityBuckets,
    pub article_type: ArticleType,
    /// Bounded real, truncated to two decimals.
    pub importance_score: f64,
    /// Weighted concatenation fed to the embedder, capped by byte budget.
    pub indexing_text: String,
    /// Fingerprint over (external_id, title, sorted categories, sorted keywords).
    pub metadata_hash: String,
    pub content_length: usize,
    pub word_count: usize,
    pub has_images: bool,
    pub has_stock_codes: bool,
}

/// Dense vector for one chunk of an article (chunk_index 0 when unchunked).
/// `(article_id, chunk_index)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub article_id: Uuid,
    pub chunk_index: u32,
    pub vector: Vec<f32>,
    pub text_hash: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

/// Output of `embed_article`: the article-level vector plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleEmbedding {
    pub article_id: Uuid,
    pub vector: Vec<f32>,
    pub text_hash: String,
    pub metadata_hash: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distance {
    DotProduct,
    Cosine,
    Euclidean,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DotProduct => "dot_product",
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cosine" => Self::Cosine,
            "euclidean" => Self::Euclidean,
            _ => Self::DotProduct,
        }
    }
}

/// Metadata about the deployed ANN index. Exactly one state may be active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexState {
    pub name: String,
    pub provider_index_id: Option<String>,
    pub endpoint_id: Option<String>,
    pub deployed_id: Option<String>,
    pub dimensions: usize,
    pub distance: Distance,
    pub total_vectors: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub active: bool,
}

impl IndexState {
    pub fn new(name: impl Into<String>, dimensions: usize, distance: Distance) -> Self {
        Self {
            name: name.into(),
            provider_index_id: None,
            endpoint_id: None,
            deployed_id: None,
            dimensions,
            distance,
            total_vectors: 0,
            last_updated: None,
            active: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Parse,
    Dedup,
    Embed,
    IndexUpsert,
    Query,
    Analysis,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Dedup => "dedup",
            Self::Embed => "embed",
            Self::IndexUpsert => "index_upsert",
            Self::Query => "query",
            Self::Analysis => "analysis",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Duplicate,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Duplicate => "duplicate",
            Self::Error => "error",
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub article_id: Option<Uuid>,
    pub phase: Phase,
    pub status: LogStatus,
    pub message: Option<String>,
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn new(phase: Phase, status: LogStatus) -> Self {
        Self {
            article_id: None,
            phase,
            status,
            message: None,
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn for_article(article_id: Uuid, phase: Phase, status: LogStatus) -> Self {
        Self {
            article_id: Some(article_id),
            ..Self::new(phase, status)
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Metadata constraints applied to both retrieval streams. A candidate that
/// fails any populated constraint is dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub writers: Vec<String>,
    pub min_length: Option<usize>,
    pub has_images: Option<bool>,
    pub required_keywords: Vec<String>,
    pub stock_codes: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.start_date.is_none()
            && self.end_date.is_none()
            && self.categories.is_empty()
            && self.writers.is_empty()
            && self.min_length.is_none()
            && self.has_images.is_none()
            && self.required_keywords.is_empty()
            && self.stock_codes.is_empty()
    }

    /// Whether an article passes every populated constraint. A date-range
    /// constraint drops articles without a publish time.
    pub fn matches(&self, article: &ArticleRecord) -> bool {
        if self.start_date.is_some() || self.end_date.is_some() {
            let Some(publish_time) = article.publish_time else {
                return false;
            };
            if let Some(start) = self.start_date {
                if publish_time < start {
                    return false;
                }
            }
            if let Some(end) = self.end_date {
                if publish_time > end {
                    return false;
                }
            }
        }

        if !self.categories.is_empty() {
            let names: Vec<&str> = article
                .categories
                .iter()
                .flat_map(|c| c.names())
                .collect();
            if !self.categories.iter().any(|c| names.contains(&c.as_str())) {
                return false;
            }
        }

        if !self.writers.is_empty() {
            let writers = article
                .writers
                .as_deref()
                .unwrap_or("")
                .to_lowercase();
            if !self
                .writers
                .iter()
                .any(|w| writers.contains(&w.to_lowercase()))
            {
                return false;
            }
        }

        if let Some(min_length) = self.min_length {
            if article.body_length() < min_length {
                return false;
            }
        }

        if let Some(has_images) = self.has_images {
            if article.has_images() != has_images {
                return false;
            }
        }

        if !self.required_keywords.is_empty() {
            let title = article.title.to_lowercase();
            let summary = article.summary.as_deref().unwrap_or("").to_lowercase();
            for keyword in &self.required_keywords {
                let keyword = keyword.to_lowercase();
                if !title.contains(&keyword) && !summary.contains(&keyword) {
                    return false;
                }
            }
        }

        if !self.stock_codes.is_empty()
            && !self
                .stock_codes
                .iter()
                .any(|code| article.stock_codes.contains(code))
        {
            return false;
        }

        true
    }
}

/// Outcome of checking one candidate article against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupDecision {
    Unique,
    ExactDuplicate { existing_id: Uuid },
    NearDuplicate { existing_id: Uuid, score: f64 },
    /// Identical normalized title only. Annotation, never a rejection.
    TitleDuplicate { existing_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_names_skip_empty_levels() {
        let cat = Category {
            large_code_nm: Some("증권".to_string()),
            middle_code_nm: Some(String::new()),
            small_code_nm: None,
            ..Category::default()
        };
        assert_eq!(cat.names(), vec!["증권"]);
    }

    #[test]
    fn entity_buckets_tag_kinds() {
        let buckets = EntityBuckets {
            companies: vec!["삼성전자".to_string()],
            persons: vec!["김철수".to_string()],
            ..EntityBuckets::default()
        };
        let all: Vec<_> = buckets.iter_all().collect();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&("삼성전자", KeywordKind::Company)));
        assert_eq!(buckets.total(), 2);
    }

    #[test]
    fn filters_drop_dateless_articles_when_range_set() {
        let article = ArticleRecord {
            id: Uuid::new_v4(),
            external_id: "F-1".to_string(),
            title: "증권 시장 동향".to_string(),
            subtitle: None,
            body: "본문".to_string(),
            summary: None,
            writers: Some("김철수".to_string()),
            publish_time: None,
            registered_time: None,
            modified_time: None,
            source_url: None,
            media_code: None,
            edition: None,
            section: None,
            page: None,
            article_year: None,
            categories: vec![Category {
                large_code_nm: Some("증권".to_string()),
                ..Category::default()
            }],
            keywords: vec![],
            stock_codes: vec!["005930".to_string()],
            images: vec![],
            content_hash: "h".to_string(),
            ingested_at: Utc::now(),
            is_embedded: false,
            embedding_model: None,
            embedded_at: None,
            processing_error: None,
            similar_to: None,
        };

        let empty = SearchFilters::default();
        assert!(empty.is_empty());
        assert!(empty.matches(&article));

        let mut dated = SearchFilters::default();
        dated.start_date = Some(Utc::now());
        assert!(!dated.matches(&article));

        let mut categorized = SearchFilters {
            categories: vec!["증권".to_string()],
            stock_codes: vec!["005930".to_string()],
            writers: vec!["김철수".to_string()],
            ..SearchFilters::default()
        };
        assert!(categorized.matches(&article));
        categorized.stock_codes = vec!["000660".to_string()];
        assert!(!categorized.matches(&article));
    }

    #[test]
    fn article_type_round_trips() {
        for ty in [
            ArticleType::Financial,
            ArticleType::Mna,
            ArticleType::People,
            ArticleType::Policy,
            ArticleType::Technology,
            ArticleType::General,
        ] {
            assert_eq!(ArticleType::parse(ty.as_str()), ty);
        }
    }
}
