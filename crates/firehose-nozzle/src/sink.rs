// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of ingest documents to Humio.
//!
//! A [`SinkClient`] performs exactly one request per call. Retrying is the
//! dispatcher's job; the client only classifies failures through
//! [`SinkError::is_retryable`].

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::SinkConfig;
use crate::event::Events;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("request to Humio failed: {0}")]
    Transport(String),

    #[error("Humio answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode ingest payload: {0}")]
    Payload(String),

    #[error("invalid ingest token: {0}")]
    Credential(String),
}

impl SinkError {
    /// Connection failures, 5xx and 429 may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Transport(_) => true,
            SinkError::Status { status, .. } => *status >= 500 || *status == 429,
            SinkError::Payload(_) | SinkError::Credential(_) => false,
        }
    }
}

#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Ships one batch as a single ingest document.
    async fn push(&self, events: &Events) -> Result<(), SinkError>;

    /// Ships a single operator-facing log line.
    async fn alert(&self, message: &str) -> Result<(), SinkError>;
}

#[derive(Debug)]
pub struct HumioClient {
    client: reqwest::Client,
    ingest_url: String,
    headers: HeaderMap,
}

impl HumioClient {
    pub fn new(config: &SinkConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(HumioClient {
            client,
            ingest_url: config.ingest_url(),
            headers: ingest_headers(&config.ingest_token)?,
        })
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(&self.ingest_url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        warn!("SINK | Humio answered {}: {}", status.as_u16(), body);
        Err(SinkError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn ingest_headers(ingest_token: &str) -> Result<HeaderMap, SinkError> {
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", ingest_token.trim()))
        .map_err(|e| SinkError::Credential(e.to_string()))?;
    auth.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, auth);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

#[async_trait]
impl SinkClient for HumioClient {
    async fn push(&self, events: &Events) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&[events]).map_err(|e| SinkError::Payload(e.to_string()))?;
        debug!(
            "SINK | Posting {} events ({} bytes) to {}",
            events.len(),
            body.len(),
            self.ingest_url
        );
        self.post(body).await
    }

    async fn alert(&self, message: &str) -> Result<(), SinkError> {
        let document = json!([{
            "tags": { "source": "humio-nozzle", "job": "nozzle" },
            "events": [{
                "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                "attributes": { "log": message },
            }],
        }]);
        let body =
            serde_json::to_vec(&document).map_err(|e| SinkError::Payload(e.to_string()))?;
        self.post(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Attributes, Event};
    use mockito::{Matcher, Server};
    use std::time::Duration;

    const INGEST_PATH: &str = "/api/v1/dataspaces/sandbox/ingest";

    fn client(url: &str) -> HumioClient {
        let config = SinkConfig::new(url, "sandbox", "mock-token", Duration::from_secs(5))
            .expect("valid sink config");
        HumioClient::new(&config).expect("failed to build client")
    }

    fn batch() -> Events {
        Events::new(vec![Event {
            timestamp: "1970-01-01T00:00:01Z".to_string(),
            attributes: Attributes {
                event_type: "LogMessage".to_string(),
                ..Default::default()
            },
        }])
    }

    #[tokio::test]
    async fn push_posts_one_document_with_bearer_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", INGEST_PATH)
            .match_header("Authorization", "Bearer mock-token")
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::PartialJson(json!([{
                "events": [{
                    "timestamp": "1970-01-01T00:00:01Z",
                    "attributes": { "eventtype": "LogMessage" },
                }],
            }])))
            .with_status(200)
            .create_async()
            .await;

        client(&server.url()).push(&batch()).await.expect("push");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", INGEST_PATH)
            .with_status(503)
            .with_body("unavailable")
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url()).push(&batch()).await.unwrap_err();
        assert_eq!(
            err,
            SinkError::Status {
                status: 503,
                body: "unavailable".to_string()
            }
        );
        assert!(err.is_retryable());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn alert_posts_tagged_log_line() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", INGEST_PATH)
            .match_header("Authorization", "Bearer mock-token")
            .match_body(Matcher::PartialJson(json!([{
                "tags": { "source": "humio-nozzle", "job": "nozzle" },
                "events": [{ "attributes": { "log": "slow down" } }],
            }])))
            .with_status(204)
            .create_async()
            .await;

        client(&server.url()).alert("slow down").await.expect("alert");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_host_is_a_transport_error() {
        let err = client("http://127.0.0.1:1").push(&batch()).await.unwrap_err();
        assert!(matches!(err, SinkError::Transport(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn token_with_control_characters_is_rejected() {
        let config = SinkConfig::new("http://localhost", "sandbox", "bad\ntoken", Duration::from_secs(5))
            .expect("valid sink config");
        let err = HumioClient::new(&config).unwrap_err();
        assert!(matches!(err, SinkError::Credential(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = SinkError::Status {
            status: 400,
            body: String::new(),
        };
        assert!(!err.is_retryable());
        let err = SinkError::Status {
            status: 429,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(!SinkError::Payload("x".to_string()).is_retryable());
    }
}
