use rayon::prelude::*;
use serde::Serialize;

use crate::ingest::hasher::ContentHasher;
use crate::types::{ArticleRecord, DedupDecision};

/// Sliding-window size for long-body comparison.
const BODY_CHUNK_CHARS: usize = 500;
/// Bodies longer than this are compared chunk-wise.
const BODY_CHUNK_THRESHOLD: usize = 1000;

/// Batch-level duplicate summary.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateStats {
    pub total_articles: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
    pub title_duplicates: usize,
    pub duplicate_rate: f64,
}

/// Detects exact and near duplicates before an article enters the store.
///
/// Exact match is by content hash. Near match is a weighted mix of
/// title/summary/body similarity (0.4 / 0.3 / 0.3), each a
/// longest-common-subsequence ratio over normalized text; long bodies are
/// compared in sliding chunks taking the maximum pairwise score. Identical
/// normalized titles alone only annotate, never reject.
pub struct DuplicateDetector {
    similarity_threshold: f64,
    hasher: ContentHasher,
}

impl DuplicateDetector {
    pub fn new(similarity_threshold: f64, hasher: ContentHasher) -> Self {
        Self {
            similarity_threshold,
            hasher,
        }
    }

    /// Decide the candidate's fate against a set of existing articles
    /// (typically the hash lookup result plus a recent window from the store).
    pub fn decide(&self, candidate: &ArticleRecord, existing: &[ArticleRecord]) -> DedupDecision {
        if let Some(exact) = existing
            .iter()
            .find(|e| e.id != candidate.id && e.content_hash == candidate.content_hash)
        {
            return DedupDecision::ExactDuplicate {
                existing_id: exact.id,
            };
        }

        let best_near = existing
            .iter()
            .filter(|e| e.id != candidate.id)
            .map(|e| (e.id, self.similarity(candidate, e)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((existing_id, score)) = best_near {
            if score >= self.similarity_threshold {
                return DedupDecision::NearDuplicate { existing_id, score };
            }
        }

        let candidate_title = self.hasher.normalize(&candidate.title);
        if !candidate_title.is_empty() {
            if let Some(same_title) = existing.iter().find(|e| {
                e.id != candidate.id && self.hasher.normalize(&e.title) == candidate_title
            }) {
                return DedupDecision::TitleDuplicate {
                    existing_id: same_title.id,
                };
            }
        }

        DedupDecision::Unique
    }

    /// Weighted article similarity in [0, 1].
    pub fn similarity(&self, a: &ArticleRecord, b: &ArticleRecord) -> f64 {
        let title = self.text_similarity(&a.title, &b.title);
        let summary = self.text_similarity(
            a.summary.as_deref().unwrap_or(""),
            b.summary.as_deref().unwrap_or(""),
        );
        let body = self.body_similarity(&a.body, &b.body);
        0.4 * title + 0.3 * summary + 0.3 * body
    }

    fn text_similarity(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        lcs_ratio(&self.hasher.normalize(a), &self.hasher.normalize(b))
    }

    fn body_similarity(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let a = self.hasher.normalize(a);
        let b = self.hasher.normalize(b);
        if a.chars().count() > BODY_CHUNK_THRESHOLD || b.chars().count() > BODY_CHUNK_THRESHOLD {
            chunked_similarity(&a, &b)
        } else {
            lcs_ratio(&a, &b)
        }
    }

    /// Pairwise duplicate summary over a batch. The quadratic sweep runs on
    /// the rayon pool; intended for admin-sized batches, not the full corpus.
    pub fn duplicate_stats(&self, articles: &[ArticleRecord]) -> DuplicateStats {
        let n = articles.len();
        let (exact, near, title) = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut exact = 0usize;
                let mut near = 0usize;
                let mut title = 0usize;
                for j in (i + 1)..n {
                    let (a, b) = (&articles[i], &articles[j]);
                    if a.content_hash == b.content_hash {
                        exact += 1;
                        continue;
                    }
                    if self.similarity(a, b) >= self.similarity_threshold {
                        near += 1;
                        continue;
                    }
                    let ta = self.hasher.normalize(&a.title);
                    if !ta.is_empty() && ta == self.hasher.normalize(&b.title) {
                        title += 1;
                    }
                }
                (exact, near, title)
            })
            .reduce(
                || (0, 0, 0),
                |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2),
            );

        DuplicateStats {
            total_articles: n,
            exact_duplicates: exact,
            near_duplicates: near,
            title_duplicates: title,
            duplicate_rate: if n == 0 { 0.0 } else { exact as f64 / n as f64 },
        }
    }
}

/// Longest-common-subsequence ratio: 2·LCS / (|a| + |b|), over chars.
fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() && b_chars.is_empty() {
        return 1.0;
    }
    if a_chars.is_empty() || b_chars.is_empty() {
        return 0.0;
    }

    let mut prev = vec![0usize; b_chars.len() + 1];
    let mut cur = vec![0usize; b_chars.len() + 1];
    for &ca in &a_chars {
        for (j, &cb) in b_chars.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let lcs = prev[b_chars.len()];
    2.0 * lcs as f64 / (a_chars.len() + b_chars.len()) as f64
}

/// Long-body comparison: split both sides into fixed char windows and take
/// the maximum pairwise LCS ratio.
fn chunked_similarity(a: &str, b: &str) -> f64 {
    let chunks_a = char_chunks(a, BODY_CHUNK_CHARS);
    let chunks_b = char_chunks(b, BODY_CHUNK_CHARS);
    let mut max = 0.0f64;
    for ca in &chunks_a {
        for cb in &chunks_b {
            max = max.max(lcs_ratio(ca, cb));
        }
    }
    max
}

fn char_chunks(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn article(title: &str, body: &str, summary: &str) -> ArticleRecord {
        let hasher = ContentHasher::default();
        ArticleRecord {
            id: Uuid::new_v4(),
            external_id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            subtitle: None,
            body: body.to_string(),
            summary: (!summary.is_empty()).then(|| summary.to_string()),
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
            content_hash: hasher.article_content_hash(title, body, summary),
            ingested_at: Utc::now(),
            is_embedded: false,
            embedding_model: None,
            embedded_at: None,
            processing_error: None,
            similar_to: None,
        }
    }

    fn detector() -> DuplicateDetector {
        DuplicateDetector::new(0.8, ContentHasher::default())
    }

    #[test]
    fn exact_duplicate_detected_by_hash() {
        let a = article("삼성전자 주가 급등", "삼성전자 주가가 급등했다.", "요약");
        let b = article("삼성전자 주가 급등", "삼성전자 주가가 급등했다!", "요약");
        let decision = detector().decide(&b, std::slice::from_ref(&a));
        assert_eq!(
            decision,
            DedupDecision::ExactDuplicate { existing_id: a.id }
        );
    }

    #[test]
    fn near_duplicate_scores_above_threshold() {
        let a = article(
            "코스피 지수 사상 최고치 경신",
            "코스피 지수가 오늘 장중 사상 최고치를 경신했다. 외국인 매수세가 이어졌다.",
            "코스피 사상 최고치",
        );
        let b = article(
            "코스피 지수 사상 최고치 경신",
            "코스피 지수가 오늘 오전 사상 최고치를 경신했다. 외국인 매수세가 이어지고 있다.",
            "코스피 사상 최고치",
        );
        match detector().decide(&b, std::slice::from_ref(&a)) {
            DedupDecision::NearDuplicate { existing_id, score } => {
                assert_eq!(existing_id, a.id);
                assert!(score >= 0.8, "score {}", score);
            }
            other => panic!("expected NearDuplicate, got {:?}", other),
        }
    }

    #[test]
    fn title_match_alone_only_annotates() {
        let a = article("금리 동결", "한국은행이 기준금리를 동결했다.", "");
        let b = article("금리 동결", "완전히 다른 내용의 기사 본문이다. 부동산 시장 이야기다.", "");
        let decision = detector().decide(&b, std::slice::from_ref(&a));
        assert_eq!(
            decision,
            DedupDecision::TitleDuplicate { existing_id: a.id }
        );
    }

    #[test]
    fn unrelated_articles_are_unique() {
        let a = article("금리 동결", "한국은행이 기준금리를 동결했다.", "");
        let b = article("유가 하락", "국제 유가가 큰 폭으로 하락했다.", "");
        assert_eq!(detector().decide(&b, std::slice::from_ref(&a)), DedupDecision::Unique);
    }

    #[test]
    fn long_bodies_use_chunked_comparison() {
        let paragraph = "반도체 수출이 증가세를 보이고 있다. 업계는 회복 국면에 들어섰다고 본다. ";
        let long_a = paragraph.repeat(30);
        let long_b = format!("{}{}", paragraph.repeat(30), "추가 문장이 붙었다.");
        let a = article("수출 회복", &long_a, "반도체 수출 회복 요약");
        let b = article("수출 회복", &long_b, "반도체 수출 회복 요약");
        let detector = detector();
        let score = detector.similarity(&a, &b);
        assert!(score >= 0.8, "chunked similarity {}", score);
    }

    #[test]
    fn stats_count_duplicate_kinds() {
        let a = article("기사 하나", "본문 에이 내용이다.", "");
        let b = article("기사 하나", "본문 에이 내용이다?", ""); // same hash after normalize
        let c = article("기사 하나", "전혀 다른 본문. 주제도 다르다.", ""); // title dup only
        let d = article("다른 기사", "또 다른 본문 내용.", "");
        let stats = detector().duplicate_stats(&[a, b, c, d]);
        assert_eq!(stats.total_articles, 4);
        assert_eq!(stats.exact_duplicates, 1);
        assert_eq!(stats.title_duplicates, 2);
        assert!(stats.duplicate_rate > 0.0);
    }
}
