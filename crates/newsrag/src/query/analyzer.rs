use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

use crate::ingest::MetadataExtractor;
use crate::types::{EntityBuckets, SearchFilters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Question,
    Search,
    Comparison,
    Analysis,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    Simple,
    Medium,
    Complex,
}

/// Everything retrieval needs to know about a raw query string.
#[derive(Debug, Clone)]
pub struct AnalyzedQuery {
    pub original: String,
    pub normalized_text: String,
    pub keywords: Vec<String>,
    pub entities: EntityBuckets,
    pub intent: QueryIntent,
    pub filters: SearchFilters,
    pub complexity: QueryComplexity,
}

/// Turns a query string into normalized text, weighted keywords, entity
/// buckets, an intent, metadata filters (including date phrases resolved
/// against the clock), and a complexity grade.
pub struct QueryAnalyzer {
    extractor: MetadataExtractor,
    stopwords: HashSet<&'static str>,
    max_keywords: usize,
    writer_pattern: Regex,
    absolute_date: Regex,
    korean_date: Regex,
}

impl QueryAnalyzer {
    pub fn new(max_keywords: usize) -> Self {
        let stopwords: HashSet<&'static str> = [
            "이", "가", "을", "를", "에", "의", "로", "으로", "와", "과", "는", "은", "도", "만",
            "부터", "까지", "에서", "에게", "보다", "처럼", "같이", "만큼", "정도", "뿐",
            "그리고", "또한", "또", "그런데", "하지만", "그러나", "따라서", "그래서",
            "때문에", "위해", "대해", "관해", "대한", "관한", "위한",
            "것", "거", "있다", "없다", "되다", "하다", "이다", "아니다",
            "이것", "그것", "저것", "이런", "그런", "저런", "이렇게", "그렇게",
            "여기", "거기", "저기", "어디", "언제", "왜", "어떻게", "무엇", "누구", "어느",
        ]
        .into_iter()
        .collect();

        Self {
            extractor: MetadataExtractor::default(),
            stopwords,
            max_keywords,
            writer_pattern: Regex::new(r"([가-힣]{2,4})\s*기자").unwrap(),
            absolute_date: Regex::new(r"(\d{4})-(\d{2})-(\d{2})").unwrap(),
            korean_date: Regex::new(r"(\d{4})년\s*(\d{1,2})월\s*(\d{1,2})일").unwrap(),
        }
    }

    pub fn analyze(&self, query: &str) -> AnalyzedQuery {
        self.analyze_at(query, Utc::now())
    }

    /// Clock-injected analysis so relative date phrases are testable.
    pub fn analyze_at(&self, query: &str, now: DateTime<Utc>) -> AnalyzedQuery {
        let normalized_text = normalize(query);
        let keywords = self.keywords(&normalized_text);
        let entities = self.extractor.extract_entities(query);
        let intent = self.intent(query);
        let filters = self.filters(query, now);
        let complexity = complexity(&normalized_text, &keywords, &entities);

        AnalyzedQuery {
            original: query.to_string(),
            normalized_text,
            keywords,
            entities,
            intent,
            filters,
            complexity,
        }
    }

    /// Top-N non-stopword tokens of length >= 2, by frequency then first
    /// occurrence.
    fn keywords(&self, normalized: &str) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for token in normalized.split_whitespace() {
            if token.chars().count() < 2 || self.stopwords.contains(token) {
                continue;
            }
            let entry = counts.entry(token).or_insert(0);
            if *entry == 0 {
                order.push(token);
            }
            *entry += 1;
        }
        let mut ranked: Vec<(usize, usize, &str)> = order
            .iter()
            .enumerate()
            .map(|(position, token)| (counts[token], position, *token))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(self.max_keywords)
            .map(|(_, _, token)| token.to_string())
            .collect()
    }

    /// First matching intent wins: question > search > comparison > analysis.
    fn intent(&self, query: &str) -> QueryIntent {
        const QUESTION: &[&str] = &[
            "무엇", "뭐", "어떤", "어느", "언제", "몇", "어디", "왜", "어떻게", "누구", "누가",
            "얼마",
        ];
        const SEARCH: &[&str] = &["찾아", "검색", "조회", "확인", "알려", "정보"];
        const COMPARISON: &[&str] = &["비교", "차이", "vs", "대비", "대조"];
        const ANALYSIS: &[&str] = &["분석", "평가", "판단", "의견", "견해", "전망"];

        let lowered = query.to_lowercase();
        let has_any = |cues: &[&str]| cues.iter().any(|cue| lowered.contains(cue));
        if has_any(QUESTION) || query.contains('?') {
            QueryIntent::Question
        } else if has_any(SEARCH) {
            QueryIntent::Search
        } else if has_any(COMPARISON) {
            QueryIntent::Comparison
        } else if has_any(ANALYSIS) {
            QueryIntent::Analysis
        } else {
            QueryIntent::General
        }
    }

    fn filters(&self, query: &str, now: DateTime<Utc>) -> SearchFilters {
        let mut filters = SearchFilters::default();

        if let Some((start, end)) = self.date_range(query, now) {
            filters.start_date = Some(start);
            filters.end_date = Some(end);
        }

        filters.categories = category_hints(query);

        for caps in self.writer_pattern.captures_iter(query) {
            if let Some(writer) = caps.get(1) {
                filters.writers.push(writer.as_str().to_string());
            }
        }

        filters
    }

    fn date_range(
        &self,
        query: &str,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let today = now.date_naive();

        // Absolute dates win over relative phrases. A date-shaped match that
        // is not a valid calendar date is skipped, not fatal.
        for caps in self
            .korean_date
            .captures_iter(query)
            .chain(self.absolute_date.captures_iter(query))
        {
            let (Some(year), Some(month), Some(day)) = (caps.get(1), caps.get(2), caps.get(3))
            else {
                continue;
            };
            let (Ok(year), Ok(month), Ok(day)) = (
                year.as_str().parse::<i32>(),
                month.as_str().parse::<u32>(),
                day.as_str().parse::<u32>(),
            ) else {
                continue;
            };
            let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
                continue;
            };
            return Some(day_span(date, date));
        }

        if query.contains("오늘") {
            return Some(day_span(today, today));
        }
        if query.contains("어제") {
            let yesterday = today - Duration::days(1);
            return Some(day_span(yesterday, yesterday));
        }
        if query.contains("이번주") || query.contains("이번 주") {
            let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
            return Some(day_span(start, today));
        }
        if query.contains("이번달") || query.contains("이번 달") {
            let start = today.with_day(1)?;
            return Some(day_span(start, today));
        }
        if query.contains("올해") {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
            return Some(day_span(start, today));
        }
        if query.contains("작년") {
            let start = NaiveDate::from_ymd_opt(today.year() - 1, 1, 1)?;
            let end = NaiveDate::from_ymd_opt(today.year() - 1, 12, 31)?;
            return Some(day_span(start, end));
        }

        None
    }
}

impl Default for QueryAnalyzer {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Lowercase, strip non-word chars, collapse whitespace.
fn normalize(query: &str) -> String {
    let filtered: String = query
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn day_span(start: NaiveDate, end: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).unwrap_or_default());
    let end = Utc.from_utc_datetime(&end.and_hms_opt(23, 59, 59).unwrap_or_default());
    (start, end)
}

fn category_hints(query: &str) -> Vec<String> {
    const CATEGORY_CUES: &[(&str, &[&str])] = &[
        ("정치", &["정치", "정부", "국회", "선거", "정당"]),
        ("경제", &["경제", "금융", "주식", "부동산", "기업", "증권", "증시"]),
        ("사회", &["사회", "사건", "사고", "범죄"]),
        ("국제", &["국제", "외교", "해외"]),
        ("문화", &["문화", "연예", "스포츠", "영화"]),
        ("기술", &["기술", "IT", "과학", "디지털", "인공지능"]),
    ];

    CATEGORY_CUES
        .iter()
        .filter(|(_, cues)| cues.iter().any(|cue| query.contains(cue)))
        .map(|(category, _)| category.to_string())
        .collect()
}

fn complexity(normalized: &str, keywords: &[String], entities: &EntityBuckets) -> QueryComplexity {
    let mut score = 0;
    let length = normalized.chars().count();
    if length > 50 {
        score += 1;
    }
    if length > 100 {
        score += 1;
    }
    if keywords.len() > 3 {
        score += 1;
    }
    if keywords.len() > 6 {
        score += 1;
    }
    let total_entities = entities.total();
    if total_entities > 2 {
        score += 1;
    }
    if total_entities > 5 {
        score += 1;
    }

    match score {
        0 | 1 => QueryComplexity::Simple,
        2 | 3 => QueryComplexity::Medium,
        _ => QueryComplexity::Complex,
    }
}
