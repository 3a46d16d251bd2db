use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::GenerativeClient;
use crate::config::LlmConfig;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// Chat-completions client for the generative collaborator. The wire shape
/// is the common `messages`/`choices` JSON; any compatible endpoint works.
pub struct RemoteChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_output_tokens: u32,
}

impl RemoteChatClient {
    /// Returns `None` when no endpoint is configured; callers then use the
    /// templated fallback.
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .ok()?;
        Some(Self {
            client,
            endpoint,
            api_key: std::env::var(&config.api_key_env).ok(),
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn build_prompt(query: &str, context: &str) -> String {
        format!(
            "당신은 경제 신문사의 AI 어시스턴트입니다. 제공된 기사 정보를 바탕으로 \
             사용자의 질문에 정확하고 간결하게 답변해 주세요.\n\n\
             사용자 질문: {}\n\n\
             관련 기사 정보:\n{}\n\n\
             답변 가이드라인:\n\
             1. 제공된 기사 정보만을 근거로 답변하세요.\n\
             2. 출처가 되는 기사를 명시하세요.\n\
             3. 정보가 부족하면 그 한계를 밝히세요.\n\
             4. 답변은 한국어로 작성하세요.\n\n답변:",
            query, context
        )
    }

    /// Parse a response body as JSON, with a clear error when the server
    /// returned an HTML error page instead.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| anyhow!("failed to read response body from {}: {}", endpoint, e))?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(anyhow!(
                "endpoint {} returned HTML instead of JSON (HTTP {}): {}",
                endpoint,
                status,
                preview
            ));
        }
        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            anyhow!(
                "failed to parse JSON from {} (HTTP {}): {}. Body: {}",
                endpoint,
                status,
                e,
                preview
            )
        })
    }
}

#[async_trait]
impl GenerativeClient for RemoteChatClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, query: &str, context: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": Self::build_prompt(query, context)}
            ],
            "max_tokens": self.max_output_tokens,
            "temperature": 0.7,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("generation request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(anyhow!("generation endpoint returned HTTP {}", response.status()));
        }

        let parsed: ChatResponse = Self::parse_json_response(response, &self.endpoint).await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| anyhow!("generation response contained no choices"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_disables_client() {
        let config = LlmConfig {
            endpoint: None,
            model: "news-assistant".to_string(),
            api_key_env: "LLM_API_KEY".to_string(),
            max_output_tokens: 512,
        };
        assert!(RemoteChatClient::from_config(&config).is_none());
    }

    #[test]
    fn prompt_carries_query_and_context() {
        let prompt = RemoteChatClient::build_prompt("삼성전자 주가는?", "기사 1\n제목: ...");
        assert!(prompt.contains("삼성전자 주가는?"));
        assert!(prompt.contains("기사 1"));
    }
}
