//! HTTP client for the dashboard REST API.
//!
//! Responses arrive as envelopes keyed by the (pluralized) entity type
//! name; unwrapping happens in the cache layer so this client stays a
//! plain GET/POST executor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use serde_json::{Map, Value};
use tracing::debug;

use super::ApiError;

/// Simple GET/POST executor the engine fetches through.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// GET `<base>/<path>[?params]`, returning the parsed JSON body.
    async fn get(&self, path: &str, params: &Map<String, Value>) -> Result<Value, ApiError>;

    /// POST a JSON body to `<base>/<path>`, returning the parsed reply.
    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError>;
}

/// REST client for the dashboard API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    base: String,
}

impl HttpClient {
    pub fn new(base: &str, timeout_secs: u64) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    async fn check_response(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }

    /// Flatten a JSON query map into key/value pairs; array values
    /// repeat the key once per element.
    fn flatten_params(params: &Map<String, Value>) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, value) in params {
            match value {
                Value::Array(items) => {
                    for item in items {
                        pairs.push((key.clone(), param_string(item)));
                    }
                }
                other => pairs.push((key.clone(), param_string(other))),
            }
        }
        pairs
    }
}

fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RestClient for HttpClient {
    async fn get(&self, path: &str, params: &Map<String, Value>) -> Result<Value, ApiError> {
        let url = self.url(path);
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/json")
            .query(&Self::flatten_params(params))
            .send()
            .await?;
        let response = Self::check_response(response).await?;

        let data = response.json().await?;
        Ok(data)
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let url = self.url(path);
        debug!(%url, "POST");

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;

        let data = response.json().await?;
        Ok(data)
    }
}
