//! Backend API client.
//!
//! Authenticated HTTP communication with the POS backend: the offline sync
//! batch, connectivity status reports, the health probe, and the online sale
//! path. The orchestrator and monitor depend on the [`SyncTransport`] trait
//! rather than on reqwest directly so tests can script server behaviour.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::error::TransportError;
use crate::protocol::{StatusReport, SyncRequest, SyncResponse};
use crate::sale::{SaleCompletePayload, SaleCompleteResult, SaleDraft};
use crate::session::Session;

pub const SYNC_PATH: &str = "/api/offline/sync";
pub const STATUS_PATH: &str = "/api/offline/status";
pub const SALE_DRAFT_PATH: &str = "/api/sales/draft";
pub const SALE_COMPLETE_PATH: &str = "/api/sales/complete";
pub const HEALTH_PATH: &str = "/api/health";

const DEVICE_ID_HEADER: &str = "x-device-id";

// ---------------------------------------------------------------------------
// Transport seams
// ---------------------------------------------------------------------------

/// Calls the sync orchestrator and connectivity monitor make.
pub trait SyncTransport: Send + Sync {
    /// Submit one batch. Any `Err` is a transport-level failure.
    fn submit(
        &self,
        session: &Session,
        request: &SyncRequest,
    ) -> impl Future<Output = Result<SyncResponse, TransportError>> + Send;

    fn report_status(
        &self,
        session: &Session,
        report: &StatusReport,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Lightweight reachability check; returns round-trip latency.
    fn probe(&self) -> impl Future<Output = Result<Duration, TransportError>> + Send;
}

/// Online sale completion, the alternative to offline enqueue.
pub trait SaleClient: Send + Sync {
    fn complete_sale(
        &self,
        session: &Session,
        sale: &SaleCompletePayload,
    ) -> impl Future<Output = Result<SaleCompleteResult, TransportError>> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation and connection strings
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Decoded pairing connection string `{url, tid, key}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub admin_url: String,
    pub terminal_id: String,
    pub api_key: String,
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    // Accept URL-safe alphabet and missing padding.
    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!("{base64}{}", "=".repeat((4 - base64.len() % 4) % 4));
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Decode a connection string (plain JSON or base64 JSON). `None` unless all
/// of url, terminal id and key are present.
pub fn decode_connection_string(raw: &str) -> Option<ConnectionInfo> {
    let payload = decode_connection_string_payload(raw)?;
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| payload.get(*n).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    Some(ConnectionInfo {
        admin_url: field(&["url"]).map(|u| normalize_admin_url(&u))?,
        terminal_id: field(&["tid", "terminalId"])?,
        api_key: field(&["key"])?,
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a transport error with a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if err.is_connect() {
        return TransportError::Connect(format!("Cannot reach server at {url}"));
    }
    if err.is_builder() {
        return TransportError::Client(format!("Invalid server URL: {url}"));
    }
    if err.is_decode() {
        return TransportError::Decode(err.to_string());
    }
    TransportError::Connect(format!("Network error communicating with {url}: {err}"))
}

/// Readable message for an HTTP status without a usable error body.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API token is invalid or expired".to_string(),
        403 => "Device not authorized".to_string(),
        404 => "Server endpoint not found".to_string(),
        409 => "Request conflicts with server state".to_string(),
        s if s >= 500 => "Server error".to_string(),
        _ => "Unexpected response from server".to_string(),
    }
}

/// Pull `error` / `message` out of a JSON error body, if there is one.
fn body_message(body: &str) -> Option<String> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    json.get("error")
        .or_else(|| json.get("message"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// reqwest transport
// ---------------------------------------------------------------------------

/// [`SyncTransport`] and [`SaleClient`] over HTTPS.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    probe_timeout: Duration,
}

impl HttpTransport {
    pub fn new(admin_url: &str, settings: &SyncSettings) -> Result<Self, TransportError> {
        let base_url = normalize_admin_url(admin_url);
        if base_url.is_empty() {
            return Err(TransportError::Client("server URL is empty".into()));
        }
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| TransportError::Client(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            probe_timeout: settings.probe_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_json<B, R>(
        &self,
        session: &Session,
        path: &str,
        body: &B,
    ) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&session.auth_token)
            .header(DEVICE_ID_HEADER, &session.device_id)
            .json(body)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            let message = body_message(&text).unwrap_or_else(|| status_error(status));
            warn!(path, status = status.as_u16(), %message, "backend request failed");
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        // Empty 2xx bodies decode as `null`.
        let body: &str = if text.trim().is_empty() {
            "null"
        } else {
            text.as_str()
        };
        serde_json::from_str(body)
            .map_err(|e| TransportError::Decode(format!("{path}: {e}")))
    }
}

impl SyncTransport for HttpTransport {
    async fn submit(
        &self,
        session: &Session,
        request: &SyncRequest,
    ) -> Result<SyncResponse, TransportError> {
        debug!(actions = request.actions.len(), "submitting offline sync batch");
        self.post_json(session, SYNC_PATH, request).await
    }

    async fn report_status(
        &self,
        session: &Session,
        report: &StatusReport,
    ) -> Result<(), TransportError> {
        let _: Value = self.post_json(session, STATUS_PATH, report).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<Duration, TransportError> {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        let start = Instant::now();
        let resp = self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: status_error(status),
            });
        }
        let latency = start.elapsed();
        debug!(latency_ms = latency.as_millis() as u64, "health probe passed");
        Ok(latency)
    }
}

impl SaleClient for HttpTransport {
    /// Draft the sale, then complete it under the same idempotency key.
    async fn complete_sale(
        &self,
        session: &Session,
        sale: &SaleCompletePayload,
    ) -> Result<SaleCompleteResult, TransportError> {
        let draft: Value = self
            .post_json(session, SALE_DRAFT_PATH, &draft_body(&sale.sale))
            .await?;
        let draft_id = draft
            .get("draftId")
            .or_else(|| draft.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Decode("sale draft response has no id".into()))?;

        let body = serde_json::json!({
            "draftId": draft_id,
            "payments": sale.sale.payments,
            "creditTerms": sale.sale.credit_terms,
            "idempotencyKey": sale.idempotency_key,
        });
        let result: SaleCompleteResult = self.post_json(session, SALE_COMPLETE_PATH, &body).await?;
        info!(
            draft_id,
            receipt_number = result.receipt_number.as_deref().unwrap_or(""),
            "sale completed online"
        );
        Ok(result)
    }
}

fn draft_body(sale: &SaleDraft) -> Value {
    serde_json::json!({
        "branchId": sale.branch_id,
        "customerId": sale.customer_id,
        "lines": sale.lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DeviceStatus, RemoteStatus};
    use crate::sale::sample_draft;
    use chrono::Utc;
    use serde_json::json;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    /// Serve the given canned responses, one per connection, and hand back
    /// the raw requests received.
    fn http_test_server(responses: Vec<(u16, String)>) -> (String, std::thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral TCP port for test");
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (stream, _addr) = listener.accept().expect("accept connection");
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = String::new();
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = v.trim().parse().unwrap();
                    }
                    let end = line == "\r\n";
                    head.push_str(&line);
                    if end {
                        break;
                    }
                }
                let mut body_buf = vec![0u8; content_length];
                reader.read_exact(&mut body_buf).unwrap();
                requests.push(format!("{head}{}", String::from_utf8_lossy(&body_buf)));

                let mut stream = stream;
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
                stream.flush().unwrap();
            }
            requests
        });
        (format!("http://127.0.0.1:{port}"), handle)
    }

    fn session() -> Session {
        Session::new("user-1", "device-1", "token-1")
    }

    #[test]
    fn test_normalize_admin_url() {
        assert_eq!(
            normalize_admin_url("pos.example.com/api/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_admin_url("localhost:3000/"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_admin_url(" https://a.example.com// "),
            "https://a.example.com"
        );
        assert_eq!(normalize_admin_url(""), "");
    }

    #[test]
    fn test_decode_connection_string() {
        let json = r#"{"url":"pos.example.com","tid":"term-1","key":"k-123"}"#;
        let expected = ConnectionInfo {
            admin_url: "https://pos.example.com".into(),
            terminal_id: "term-1".into(),
            api_key: "k-123".into(),
        };
        assert_eq!(decode_connection_string(json), Some(expected.clone()));

        let encoded = BASE64_STANDARD.encode(json);
        assert_eq!(decode_connection_string(&encoded), Some(expected.clone()));

        let url_safe = encoded.trim_end_matches('=').replace('+', "-").replace('/', "_");
        assert_eq!(decode_connection_string(&url_safe), Some(expected));

        let missing_key = BASE64_STANDARD.encode(r#"{"url":"pos.example.com","tid":"term-1"}"#);
        assert_eq!(decode_connection_string(&missing_key), None);
        assert_eq!(decode_connection_string("short"), None);
    }

    #[test]
    fn test_status_error_messages() {
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED),
            "API token is invalid or expired"
        );
        assert_eq!(status_error(StatusCode::BAD_GATEWAY), "Server error");
        assert_eq!(
            body_message(r#"{"error":"device revoked"}"#).as_deref(),
            Some("device revoked")
        );
        assert_eq!(body_message("<html>"), None);
    }

    #[tokio::test]
    async fn test_submit_sends_batch_with_auth_headers() {
        let response = json!({
            "results": [{ "checksum": "abc", "status": "APPLIED", "result": { "receiptNumber": "R-1" } }]
        });
        let (base, server) = http_test_server(vec![(200, response.to_string())]);
        let transport = HttpTransport::new(&base, &SyncSettings::for_test()).unwrap();

        let request = SyncRequest {
            user_id: "user-1".into(),
            device_id: "device-1".into(),
            actions: vec![],
        };
        let parsed = transport.submit(&session(), &request).await.unwrap();
        assert_eq!(parsed.results[0].status, RemoteStatus::Applied);

        let raw = server.join().unwrap().remove(0);
        let lower = raw.to_ascii_lowercase();
        assert!(raw.starts_with("POST /api/offline/sync "), "{raw}");
        assert!(lower.contains("authorization: bearer token-1"), "{raw}");
        assert!(lower.contains("x-device-id: device-1"), "{raw}");
        assert!(raw.contains(r#""userId":"user-1""#), "{raw}");
    }

    #[tokio::test]
    async fn test_non_success_status_is_transport_error() {
        let (base, server) =
            http_test_server(vec![(503, r#"{"error":"maintenance"}"#.to_string())]);
        let transport = HttpTransport::new(&base, &SyncSettings::for_test()).unwrap();
        let report = StatusReport {
            device_id: "device-1".into(),
            status: DeviceStatus::Online,
            since: Some(Utc::now()),
        };

        let err = transport.report_status(&session(), &report).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Status {
                status: 503,
                message: "maintenance".into()
            }
        );
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connect_error() {
        // Bind then drop so the port is (very likely) closed.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let transport =
            HttpTransport::new(&format!("http://127.0.0.1:{port}"), &SyncSettings::for_test())
                .unwrap();
        let err = transport.probe().await.unwrap_err();
        assert!(
            matches!(err, TransportError::Connect(_) | TransportError::Timeout),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_online_sale_drafts_then_completes() {
        let (base, server) = http_test_server(vec![
            (200, r#"{"id":"draft-9"}"#.to_string()),
            (200, r#"{"receiptNumber":"R-000042","saleId":"s-42"}"#.to_string()),
        ]);
        let transport = HttpTransport::new(&base, &SyncSettings::for_test()).unwrap();
        let sale = SaleCompletePayload::new(sample_draft(), Utc::now());

        let result = transport.complete_sale(&session(), &sale).await.unwrap();
        assert_eq!(result.receipt_number.as_deref(), Some("R-000042"));

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with("POST /api/sales/draft "));
        assert!(requests[1].starts_with("POST /api/sales/complete "));
        assert!(requests[1].contains(r#""draftId":"draft-9""#));
        assert!(requests[1].contains(&sale.idempotency_key));
    }
}
