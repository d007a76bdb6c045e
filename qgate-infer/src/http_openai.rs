use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use qgate_types::SamplingParams;

use crate::{GenerateError, QueryGenerator};

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: Option<u32>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// HTTP generator against an OpenAI-compatible endpoint (vLLM, llama.cpp
/// server, hosted APIs). Non-streaming: one completion per attempt.
pub struct HttpOpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl HttpOpenAiGenerator {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            max_tokens: 1024,
        }
    }
}

#[async_trait]
impl QueryGenerator for HttpOpenAiGenerator {
    async fn generate(
        &self,
        system_context: &str,
        prompt: &str,
        sampling: SamplingParams,
    ) -> Result<String, GenerateError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system_context.to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: Some(self.max_tokens),
            temperature: sampling.temperature,
            seed: sampling.seed,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError {
                message: format!("HTTP error: {e}"),
            })?;

        if !resp.status().is_success() {
            return Err(GenerateError {
                message: format!("HTTP status: {}", resp.status()),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| GenerateError {
            message: format!("response decode error: {e}"),
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(content)
    }
}
