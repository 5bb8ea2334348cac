//! Reqwest-backed `NetworkPort` for the cloud sync API (§6).

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;

use fieldsync_core::{
    MutationOutcome, MutationPushResult, NetworkPort, PullRequest, PullResponse, PushRequest,
    PushResponse, Result as CoreResult,
};

use crate::error::NetError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const REACHABILITY_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: String,
    message: String,
}

/// Raw pull page shape tolerating the `items`/`data` and `cursor`/
/// `nextCursor` historical field drift (§6.1).
#[derive(Debug, Deserialize)]
struct RawPullResponse {
    #[serde(alias = "data")]
    items: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    #[serde(alias = "cursor")]
    #[serde(default)]
    next_cursor: Option<String>,
    has_more: bool,
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawMutationResult {
    #[serde(rename = "mutationId")]
    mutation_id: String,
    status: MutationOutcome,
    record: Option<serde_json::Map<String, serde_json::Value>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPushResponse {
    results: Vec<RawMutationResult>,
    #[serde(rename = "serverTime")]
    server_time: Option<String>,
}

/// Client for the field-service sync API. One instance is shared across
/// every entity's pull/push calls.
#[derive(Debug, Clone)]
pub struct ReqwestNetworkPort {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl ReqwestNetworkPort {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: auth_token.into(),
        }
    }

    fn headers(&self) -> Result<HeaderMap, NetError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.auth_token))
            .map_err(|_| NetError::api(401, "invalid auth token format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("sync API response status: {status}");
            return;
        }
        let mut preview: String = body.chars().take(MAX_LOG_BODY_CHARS).collect();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("sync API error ({status}): {preview}");
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NetError> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(NetError::api(status.as_u16(), format!("{}: {}", error.code, error.message)));
            }
            return Err(NetError::api(status.as_u16(), format!("request failed: {body}")));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!("failed to deserialize sync response. body: {body}, error: {e}");
            NetError::api(status.as_u16(), format!("failed to parse response: {e}"))
        })
    }
}

#[async_trait]
impl NetworkPort for ReqwestNetworkPort {
    async fn pull(&self, request: PullRequest) -> CoreResult<PullResponse> {
        let url = format!("{}{}", self.base_url, request.endpoint);
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(since) = &request.since {
            query.push(("since", since.clone()));
        }
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.clone()));
        }
        query.push(("limit", request.limit.to_string()));
        query.push(("technicianId", request.technician_id.clone()));

        let result: Result<RawPullResponse, NetError> = async {
            let response = self
                .client
                .get(&url)
                .headers(self.headers()?)
                .query(&query)
                .send()
                .await?;
            Self::parse_response(response).await
        }
        .await;

        let raw = result.map_err(fieldsync_core::NetworkError::from)?;
        Ok(PullResponse {
            records: raw.items.unwrap_or_default(),
            next_cursor: raw.next_cursor,
            has_more: raw.has_more,
            total: raw.total,
        })
    }

    async fn push(&self, request: PushRequest) -> CoreResult<PushResponse> {
        let url = format!("{}{}", self.base_url, request.endpoint);

        let result: Result<RawPushResponse, NetError> = async {
            let headers = self.headers()?;
            let response = self
                .client
                .post(&url)
                .headers(headers)
                .json(&serde_json::json!({ "mutations": request.mutations }))
                .send()
                .await?;
            Self::parse_response(response).await
        }
        .await;

        let raw = result.map_err(fieldsync_core::NetworkError::from)?;
        Ok(PushResponse {
            results: raw
                .results
                .into_iter()
                .map(|r| MutationPushResult {
                    mutation_id: r.mutation_id,
                    outcome: r.status,
                    record: r.record,
                    error: r.error,
                })
                .collect(),
            server_time: raw.server_time,
        })
    }

    async fn is_reachable(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        self.client
            .get(&url)
            .timeout(Duration::from_secs(REACHABILITY_TIMEOUT_SECS))
            .send()
            .await
            .map(|resp| resp.status().is_success() || resp.status().as_u16() == 404)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> (HashMap<String, String>, String) {
        let mut buffer = Vec::new();
        let header_end = loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.expect("read request");
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos;
            }
        };
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_string();
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        (headers, request_line)
    }

    async fn write_http_response(stream: &mut tokio::net::TcpStream, status: u16, body: &str) {
        let response = format!(
            "HTTP/1.1 {status} OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.expect("write response");
        stream.flush().await.expect("flush response");
    }

    /// Accepts exactly one connection, replies with `body`, and returns the
    /// request line it received (for asserting on query parameters).
    async fn start_single_shot_server(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept connection");
            let (_headers, request_line) = read_http_request(&mut stream).await;
            write_http_response(&mut stream, status, body).await;
            request_line
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn pull_threads_cursor_into_query_and_normalizes_items() {
        let body = r#"{"items":[{"id":"a"}],"nextCursor":"c1","hasMore":true,"total":5}"#;
        let (base_url, handle) = start_single_shot_server(200, body).await;
        let port = ReqwestNetworkPort::new(base_url, "token-123");

        let response = port
            .pull(PullRequest {
                entity: "clients".to_string(),
                endpoint: "/clients".to_string(),
                since: None,
                cursor: Some("c0".to_string()),
                limit: 100,
                technician_id: "tech-1".to_string(),
            })
            .await
            .expect("pull succeeds");

        assert_eq!(response.records.len(), 1);
        assert_eq!(response.next_cursor, Some("c1".to_string()));
        assert!(response.has_more);

        let request_line = handle.await.expect("server task");
        assert!(request_line.contains("cursor=c0"));
    }

    #[tokio::test]
    async fn push_normalizes_mutation_outcomes() {
        let body = r#"{"results":[{"mutationId":"client-1-create-1","status":"applied"}],"serverTime":"2026-01-01T00:00:00Z"}"#;
        let (base_url, handle) = start_single_shot_server(200, body).await;
        let port = ReqwestNetworkPort::new(base_url, "token-123");

        let response = port
            .push(PushRequest {
                endpoint: "/clients/mutations".to_string(),
                mutations: Vec::new(),
            })
            .await
            .expect("push succeeds");

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].outcome, MutationOutcome::Applied);
        assert_eq!(response.server_time, Some("2026-01-01T00:00:00Z".to_string()));
        handle.await.expect("server task");
    }

    #[tokio::test]
    async fn api_error_status_surfaces_as_http_network_error() {
        let body = r#"{"error":"error","code":"rate_limited","message":"slow down"}"#;
        let (base_url, handle) = start_single_shot_server(429, body).await;
        let port = ReqwestNetworkPort::new(base_url, "token-123");

        let err = port
            .pull(PullRequest {
                entity: "clients".to_string(),
                endpoint: "/clients".to_string(),
                since: None,
                cursor: None,
                limit: 100,
                technician_id: "tech-1".to_string(),
            })
            .await
            .expect_err("expected an error");

        match err {
            fieldsync_core::SyncError::Network(inner) => {
                assert_eq!(inner.retry_class(), fieldsync_core::RetryClass::Retryable);
            }
            other => panic!("expected a network error, got {other:?}"),
        }
        handle.await.expect("server task");
    }
}
