use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::{BroadcastClient, GatewayError};

/// Centrifugo server HTTP API client.
#[derive(Clone)]
pub struct CentrifugoClient {
    api_url: String,
    api_key: String,
    client: Client,
    publish_timeout: Duration,
    check_timeout: Duration,
}

impl std::fmt::Debug for CentrifugoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentrifugoClient")
            .field("api_url", &self.api_url)
            .field("api_key_len", &self.api_key.len())
            .finish()
    }
}

#[derive(Serialize)]
struct ApiCommand<'a> {
    method: &'a str,
    params: Value,
}

impl CentrifugoClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            client: Client::new(),
            publish_timeout: Duration::from_secs(5),
            check_timeout: Duration::from_secs(3),
        }
    }

    async fn call(&self, cmd: &ApiCommand<'_>, timeout: Duration) -> Result<Value, GatewayError> {
        let rsp = self
            .client
            .post(&self.api_url)
            .header("X-API-Key", &self.api_key)
            .timeout(timeout)
            .json(cmd)
            .send()
            .await?;

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = rsp.json().await?;
        api_result(body)
    }
}

// Centrifugo answers 200 with an `error` object for command-level failures.
fn api_result(body: Value) -> Result<Value, GatewayError> {
    match body.get("error") {
        Some(err) if !err.is_null() => Err(GatewayError::Remote(err.to_string())),
        _ => Ok(body),
    }
}

#[async_trait]
impl BroadcastClient for CentrifugoClient {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<(), GatewayError> {
        let cmd = ApiCommand {
            method: "publish",
            params: serde_json::json!({ "channel": channel, "data": payload }),
        };
        self.call(&cmd, self.publish_timeout).await.map(|_| ())
    }

    async fn check(&self) -> Result<(), GatewayError> {
        let cmd = ApiCommand {
            method: "info",
            params: serde_json::json!({}),
        };
        let body = self.call(&cmd, self.check_timeout).await?;
        if body.get("result").is_some() {
            Ok(())
        } else {
            Err(GatewayError::Remote("info response without result".to_string()))
        }
    }
}
