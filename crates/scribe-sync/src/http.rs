//! reqwest-based sync client

use crate::{SyncClient, SyncError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Method, RequestBuilder, Response};
use scribe_core::{DocumentId, PermissionChange, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Shared-secret header checked by the sync service
pub const INTERNAL_SECRET_HEADER: &str = "X-Internal-Secret";

/// Sync service connection settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL, e.g. `http://localhost:8787`
    pub base_url: String,
    /// Value of the internal secret header
    pub secret: String,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8787".to_string(),
            secret: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Deserialize)]
struct StateResponse {
    binary: String,
}

#[derive(Serialize)]
struct PermissionRequest<'a> {
    user_id: u64,
    role: &'a str,
}

/// HTTP client for the sync service's internal API
pub struct HttpSyncClient {
    client: reqwest::Client,
    base_url: String,
    secret: String,
}

impl HttpSyncClient {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret: config.secret,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(INTERNAL_SECRET_HEADER, &self.secret)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SyncError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn fetch_document_state(&self, doc: DocumentId) -> Result<Vec<u8>, SyncError> {
        let path = format!("/internal/documents/{doc}/state");
        let response = self
            .send(self.request(Method::GET, &path))
            .await
            .map_err(|e| {
                debug!(document_id = %doc, error = %e, "Failed to fetch document state");
                e
            })?;

        let state: StateResponse = response.json().await?;
        let bytes = STANDARD
            .decode(state.binary.as_bytes())
            .map_err(|e| SyncError::Decode(e.to_string()))?;

        debug!(document_id = %doc, bytes = bytes.len(), "Fetched document state");
        Ok(bytes)
    }

    async fn update_user_permission(
        &self,
        doc: DocumentId,
        user: UserId,
        change: PermissionChange,
    ) -> Result<(), SyncError> {
        let path = format!("/internal/documents/{doc}/permission");
        let body = PermissionRequest {
            user_id: user.0,
            role: change.as_str(),
        };

        self.send(self.request(Method::PUT, &path).json(&body))
            .await
            .map_err(|e| {
                debug!(
                    document_id = %doc,
                    user_id = %user,
                    role = change.as_str(),
                    error = %e,
                    "Failed to notify permission change"
                );
                e
            })?;
        Ok(())
    }

    async fn remove_document(&self, doc: DocumentId) -> Result<(), SyncError> {
        let path = format!("/internal/documents/{doc}");
        self.send(self.request(Method::DELETE, &path))
            .await
            .map_err(|e| {
                debug!(document_id = %doc, error = %e, "Failed to notify document removal");
                e
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::Role;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accept one connection, capture the raw request, answer with `status` and `body`
    async fn serve_once(status: &'static str, body: String) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];

            // Read headers, then as much body as Content-Length announces
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);

                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let lower = line.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });

        (format!("http://{addr}"), rx)
    }

    /// Log sink shared between the subscriber and the test body
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    fn client(base_url: String) -> HttpSyncClient {
        HttpSyncClient::new(SyncConfig {
            base_url,
            secret: "s3cret".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_state_decodes_base64() {
        let encoded = STANDARD.encode(b"crdt-state");
        let (url, request) = serve_once("200 OK", format!(r#"{{"binary":"{encoded}"}}"#)).await;

        let state = client(url).fetch_document_state(DocumentId(12)).await.unwrap();
        assert_eq!(state, b"crdt-state");

        let request = request.await.unwrap();
        assert!(request.starts_with("GET /internal/documents/12/state HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("x-internal-secret: s3cret"));
    }

    #[tokio::test]
    async fn test_permission_body() {
        let (url, request) = serve_once("204 No Content", String::new()).await;

        client(url)
            .update_user_permission(DocumentId(3), UserId(9), PermissionChange::granted(Role::Editor))
            .await
            .unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("PUT /internal/documents/3/permission HTTP/1.1"));
        assert!(request.ends_with(r#"{"user_id":9,"role":"editor"}"#));
    }

    #[tokio::test]
    async fn test_revocation_sends_none() {
        let (url, request) = serve_once("200 OK", "{}".to_string()).await;

        client(url)
            .update_user_permission(DocumentId(3), UserId(9), PermissionChange::revoked())
            .await
            .unwrap();

        assert!(request.await.unwrap().ends_with(r#"{"user_id":9,"role":"none"}"#));
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let (url, _request) = serve_once("500 Internal Server Error", "boom".to_string()).await;

        let err = client(url).remove_document(DocumentId(1)).await.unwrap_err();
        match &err {
            SyncError::Status { status, body } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            scribe_core::Error::from(err),
            scribe_core::Error::UpstreamUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_failures_are_left_to_the_caller_to_log() {
        let logs = LogBuffer::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (url, _request) = serve_once("503 Service Unavailable", "down".to_string()).await;
        assert!(client(url).remove_document(DocumentId(4)).await.is_err());

        let (url, _request) = serve_once("500 Internal Server Error", "boom".to_string()).await;
        assert!(client(url).fetch_document_state(DocumentId(4)).await.is_err());

        let (url, _request) = serve_once("502 Bad Gateway", String::new()).await;
        assert!(client(url)
            .update_user_permission(DocumentId(4), UserId(2), PermissionChange::revoked())
            .await
            .is_err());

        tracing::warn!("sentinel");
        let output = logs.contents();
        assert!(output.contains("sentinel"));
        assert!(!output.contains("Failed to"), "unexpected warnings: {output}");
    }

    #[tokio::test]
    async fn test_invalid_base64_is_decode_error() {
        let (url, _request) = serve_once("200 OK", r#"{"binary":"%%%"}"#.to_string()).await;

        let err = client(url).fetch_document_state(DocumentId(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = HttpSyncClient::new(SyncConfig {
            base_url: format!("http://{addr}/"),
            secret: String::new(),
            timeout: Duration::from_millis(100),
        })
        .unwrap();

        let err = client.fetch_document_state(DocumentId(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert!(matches!(
            scribe_core::Error::from(err),
            scribe_core::Error::Timeout(_)
        ));
    }
}
