//! Chat-completion client used by contextual compression and image OCR.
//!
//! Single-shot `POST /v1/chat/completions` calls with the same
//! transport-level retry strategy as the embedding client: 429/5xx and
//! network errors back off exponentially, other 4xx fail immediately.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::LlmConfig;

/// Send a chat completion request and return the assistant message text.
///
/// `messages` is the raw `messages` array of the OpenAI chat API, which
/// lets callers pass multimodal content (text + image parts) as well as
/// plain text.
pub async fn chat_completion(config: &LlmConfig, messages: serde_json::Value) -> Result<String> {
    if !config.is_enabled() {
        bail!("LLM provider is disabled");
    }
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("llm.model required"))?;
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "temperature": 0.0,
        "messages": messages,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_chat_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!(
                        "OpenAI API error {}: {}",
                        status,
                        body_text
                    ));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("OpenAI API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Chat completion failed after retries")))
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "refunds within 30 days" } }
            ]
        });
        assert_eq!(
            parse_chat_response(&json).unwrap(),
            "refunds within 30 days"
        );
    }

    #[test]
    fn test_parse_rejects_empty_choices() {
        let json = serde_json::json!({ "choices": [] });
        assert!(parse_chat_response(&json).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let config = LlmConfig::default();
        let result = chat_completion(&config, serde_json::json!([])).await;
        assert!(result.is_err());
    }
}
