//! Groq inference client (OpenAI-compatible Chat Completions API).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{GatewayError, InferenceClient};

pub struct GroqClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for GroqClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroqClient")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("api_key_len", &self.api_key.len())
            .finish()
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Req<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
}

#[derive(Deserialize)]
struct Resp {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    #[serde(default)]
    content: Option<String>,
}

impl GroqClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .user_agent("strategy-worker/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Option<String>, GatewayError> {
        let req = Req {
            model: &self.model,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
            temperature: 0.7,
            max_tokens,
            top_p: 1.0,
        };

        let resp = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Resp = resp.json().await?;
        Ok(body.choices.into_iter().next().and_then(|c| c.message.content))
    }
}

// Only a missing or zero-length content is a fault.
fn classification(content: Option<String>) -> Result<String, GatewayError> {
    match content {
        Some(content) if !content.is_empty() => Ok(content),
        _ => Err(GatewayError::EmptyResponse),
    }
}

#[async_trait]
impl InferenceClient for GroqClient {
    async fn classify(&self, prompt: &str) -> Result<String, GatewayError> {
        classification(self.complete(prompt, 512).await?)
    }

    async fn ping(&self) -> Result<(), GatewayError> {
        // a one-token answer is enough; its content is irrelevant
        self.complete("Hello", 1).await.map(|_| ())
    }

    fn provider_name(&self) -> &'static str {
        "groq"
    }
}
