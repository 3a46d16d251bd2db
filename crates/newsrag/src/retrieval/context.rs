use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::engine::RetrievedDoc;

/// Summaries longer than this are ellipsized in the context.
const SUMMARY_LIMIT_CHARS: usize = 500;
/// How many references accompany a generated answer.
const MAX_REFERENCES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub article_id: Uuid,
    pub title: String,
    pub url: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct BuiltContext {
    pub text: String,
    pub references: Vec<Reference>,
    /// Articles that made it into the context before the budget ran out.
    pub included: usize,
}

/// Assembles the generation context from ranked results under a byte budget.
/// Appends whole article snippets in rank order and stops at the first one
/// that would overflow; a record is never split mid-way.
pub struct ContextBuilder {
    max_bytes: usize,
}

impl ContextBuilder {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn build(&self, docs: &[RetrievedDoc]) -> BuiltContext {
        let mut text = String::new();
        let mut included = 0usize;

        for (i, doc) in docs.iter().enumerate() {
            let snippet = self.snippet(i + 1, doc);
            if text.len() + snippet.len() > self.max_bytes {
                break;
            }
            text.push_str(&snippet);
            included += 1;
        }

        let references = docs
            .iter()
            .take(MAX_REFERENCES)
            .map(|doc| Reference {
                article_id: doc.article.id,
                title: doc.article.title.clone(),
                url: doc.article.source_url.clone(),
                publish_time: doc.article.publish_time,
                score: doc.final_score,
            })
            .collect();

        BuiltContext {
            text,
            references,
            included,
        }
    }

    fn snippet(&self, position: usize, doc: &RetrievedDoc) -> String {
        let summary = doc.article.summary.as_deref().unwrap_or("");
        let summary = if summary.chars().count() > SUMMARY_LIMIT_CHARS {
            let cut: String = summary.chars().take(SUMMARY_LIMIT_CHARS).collect();
            format!("{}...", cut)
        } else {
            summary.to_string()
        };
        let publish = doc
            .article
            .publish_time
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_default();

        format!(
            "기사 {}\n제목: {}\n요약: {}\n발행일: {}\nURL: {}\n\n",
            position,
            doc.article.title,
            summary,
            publish,
            doc.article.source_url.as_deref().unwrap_or("")
        )
    }
}
