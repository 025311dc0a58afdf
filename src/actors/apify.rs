use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{ActorApi, GatewayError, RemoteRun, RunState};

pub const DEFAULT_BASE_URL: &str = "https://api.apify.com/v2";

/// Path segment characters left as-is (RFC 3986 unreserved).
const PATH_SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Apify REST client authenticated with a bearer token.
pub struct ApifyClient {
    token: String,
    http_client: Client,
    base_url: String,
}

impl ApifyClient {
    pub fn new(token: String, base_url: &str) -> Result<Self, GatewayError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Transport {
                message: format!("Failed to build HTTP client: {e}"),
                timeout: false,
            })?;
        Ok(Self {
            token,
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, GatewayError> {
        let resp = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(GatewayError::from_request)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        resp.json().await.map_err(GatewayError::from_request)
    }
}

#[async_trait]
impl ActorApi for ApifyClient {
    async fn start_run(&self, actor_id: &str, input: &Value) -> Result<RemoteRun, GatewayError> {
        let url = format!("{}/acts/{}/runs", self.base_url, actor_path(actor_id));
        let body = self.send(self.http_client.post(&url).json(input)).await?;
        parse_run(body)
    }

    async fn run_status(&self, run_id: &str) -> Result<RemoteRun, GatewayError> {
        let url = format!("{}/actor-runs/{}", self.base_url, encode_segment(run_id));
        let body = self.send(self.http_client.get(&url)).await?;
        parse_run(body)
    }

    async fn dataset_items(
        &self,
        dataset_id: &str,
        limit: usize,
    ) -> Result<Vec<Value>, GatewayError> {
        let url = format!(
            "{}/datasets/{}/items",
            self.base_url,
            encode_segment(dataset_id)
        );
        let limit = limit.to_string();
        let request = self
            .http_client
            .get(&url)
            .query(&[("clean", "true"), ("limit", limit.as_str())]);
        let body = self.send(request).await?;
        parse_items(body)
    }

    async fn abort_run(&self, run_id: &str) -> Result<(), GatewayError> {
        let url = format!(
            "{}/actor-runs/{}/abort",
            self.base_url,
            encode_segment(run_id)
        );
        self.send(self.http_client.post(&url)).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    data: RunData,
}

#[derive(Debug, Deserialize)]
struct RunData {
    id: String,
    status: String,
    #[serde(rename = "defaultDatasetId")]
    default_dataset_id: Option<String>,
}

fn parse_run(body: Value) -> Result<RemoteRun, GatewayError> {
    let envelope: RunEnvelope = serde_json::from_value(body)
        .map_err(|e| GatewayError::Decode(format!("run response: {e}")))?;
    Ok(RemoteRun {
        state: parse_status(&envelope.data.status),
        id: envelope.data.id,
        dataset_id: envelope.data.default_dataset_id,
    })
}

/// Dataset items come back as a bare array; an `{data: {items}}` envelope
/// is accepted as well.
fn parse_items(body: Value) -> Result<Vec<Value>, GatewayError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => obj
            .remove("data")
            .and_then(|mut data| data.get_mut("items").map(Value::take))
            .and_then(|items| match items {
                Value::Array(items) => Some(items),
                _ => None,
            })
            .ok_or_else(|| GatewayError::Decode("dataset response has no items".to_string())),
        other => Err(GatewayError::Decode(format!(
            "dataset response is not a list: {other}"
        ))),
    }
}

/// Map a service status onto the run lifecycle. Transitional states such as
/// `ABORTING` are still running from the caller's point of view.
pub fn parse_status(status: &str) -> RunState {
    match status {
        "READY" => RunState::Created,
        "RUNNING" | "ABORTING" | "TIMING-OUT" => RunState::Running,
        "SUCCEEDED" => RunState::Succeeded,
        "TIMED-OUT" => RunState::TimedOut,
        "FAILED" | "ABORTED" => RunState::Failed,
        other => {
            tracing::warn!(status = other, "Unknown actor run status");
            RunState::Running
        }
    }
}

/// `owner/name` actor ids are addressed as `owner~name` in URLs.
fn actor_path(actor_id: &str) -> String {
    encode_segment(&actor_id.replace('/', "~"))
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT_SET).to_string()
}
