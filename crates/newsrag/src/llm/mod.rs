pub mod remote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::retrieval::Reference;

pub use remote::RemoteChatClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Generated,
    Fallback,
}

/// Final answer handed back to the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedResponse {
    pub text: String,
    pub references: Vec<Reference>,
    pub confidence: f64,
    pub model_id: String,
    pub source: ResponseSource,
    pub timestamp: DateTime<Utc>,
}

/// Generative collaborator: takes the query and the bounded context, returns
/// raw answer text. Everything else (references, confidence, fallback) is
/// composed here.
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    fn model_id(&self) -> &str;

    async fn generate(&self, query: &str, context: &str) -> anyhow::Result<String>;
}

/// Ask the client for an answer; on absence or failure, fall back to a
/// deterministic template clearly labeled as such.
pub async fn compose_response(
    client: Option<&dyn GenerativeClient>,
    query: &str,
    context: &str,
    references: Vec<Reference>,
) -> GeneratedResponse {
    let top_score = references.first().map(|r| r.score).unwrap_or(0.0);

    match client {
        Some(client) => match client.generate(query, context).await {
            Ok(text) => GeneratedResponse {
                confidence: confidence_score(top_score, references.len()),
                text,
                references,
                model_id: client.model_id().to_string(),
                source: ResponseSource::Generated,
                timestamp: Utc::now(),
            },
            Err(err) => {
                tracing::warn!(%err, "generation failed; returning fallback response");
                fallback_response(query, references)
            }
        },
        None => fallback_response(query, references),
    }
}

/// Templated answer over the retrieved references, used whenever the
/// generative client is unavailable.
pub fn fallback_response(query: &str, references: Vec<Reference>) -> GeneratedResponse {
    let mut text = format!("'{}' 관련 검색 결과입니다.\n", query);
    if references.is_empty() {
        text.push_str("관련 기사를 찾지 못했습니다.");
    } else {
        for (i, reference) in references.iter().enumerate() {
            let date = reference
                .publish_time
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            text.push_str(&format!("{}. {} ({})\n", i + 1, reference.title, date));
        }
        text.push_str("자세한 내용은 각 기사를 참고해 주세요.");
    }

    GeneratedResponse {
        text,
        confidence: if references.is_empty() { 0.1 } else { 0.3 },
        references,
        model_id: "template".to_string(),
        source: ResponseSource::Fallback,
        timestamp: Utc::now(),
    }
}

/// Bounded confidence from retrieval strength and reference coverage.
fn confidence_score(top_score: f64, reference_count: usize) -> f64 {
    let coverage = (reference_count.min(5) as f64) * 0.06;
    (0.3 + 0.4 * top_score.clamp(0.0, 1.0) + coverage).min(0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn reference(title: &str, score: f64) -> Reference {
        Reference {
            article_id: Uuid::new_v4(),
            title: title.to_string(),
            url: None,
            publish_time: Some(Utc::now()),
            score,
        }
    }

    struct FailingClient;

    #[async_trait]
    impl GenerativeClient for FailingClient {
        fn model_id(&self) -> &str {
            "failing"
        }
        async fn generate(&self, _query: &str, _context: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("provider down"))
        }
    }

    struct EchoClient;

    #[async_trait]
    impl GenerativeClient for EchoClient {
        fn model_id(&self) -> &str {
            "echo"
        }
        async fn generate(&self, query: &str, _context: &str) -> anyhow::Result<String> {
            Ok(format!("답변: {}", query))
        }
    }

    #[tokio::test]
    async fn missing_client_yields_labeled_fallback() {
        let response =
            compose_response(None, "삼성전자 주가", "", vec![reference("기사", 0.8)]).await;
        assert_eq!(response.source, ResponseSource::Fallback);
        assert_eq!(response.model_id, "template");
        assert!(response.text.contains("삼성전자 주가"));
        assert!(response.text.contains("기사"));
    }

    #[tokio::test]
    async fn failing_client_degrades_to_fallback() {
        let response = compose_response(
            Some(&FailingClient),
            "금리",
            "컨텍스트",
            vec![reference("금리 기사", 0.9)],
        )
        .await;
        assert_eq!(response.source, ResponseSource::Fallback);
    }

    #[tokio::test]
    async fn working_client_is_labeled_generated() {
        let response = compose_response(
            Some(&EchoClient),
            "환율",
            "컨텍스트",
            vec![reference("환율 기사", 0.9), reference("환율 분석", 0.7)],
        )
        .await;
        assert_eq!(response.source, ResponseSource::Generated);
        assert_eq!(response.model_id, "echo");
        assert!(response.confidence > 0.3);
        assert!(response.confidence <= 0.95);
    }

    #[test]
    fn confidence_is_bounded() {
        assert!(confidence_score(10.0, 100) <= 0.95);
        assert!(confidence_score(0.0, 0) >= 0.3);
    }
}
