//! Outbound adapter to a single worker's HTTP + WebSocket API.
//!
//! Every call carries an explicit timeout and classifies failure: transport
//! failures surface as [`gw_core::GatewayError::Transport`]; a non-200/
//! non-object worker response is the caller's job to classify as Protocol,
//! since only it knows whether that status is fatal for the calling path.

use gw_core::worker::Credentials;
use gw_core::{GatewayError, GatewayResult};
use gw_wire::{QueueSnapshot, SubmitRequest, ViewQuery};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::MaybeTlsStream;
use tracing::warn;

/// Timeout for the cheap health probe and live-queue probes. Deliberately
/// shorter and fixed rather than configurable: these are liveness checks,
/// not the uniform request timeout submission/history/proxy calls use.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Adapter bound to one worker's base URL and credentials.
#[derive(Clone)]
pub struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    /// Uniform timeout for submission/history/proxy calls, configured by
    /// the caller (the gateway's `worker_request_timeout` setting).
    timeout: Duration,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>, credentials: Option<Credentials>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: gw_core::worker::normalize_base_url(&base_url.into()),
            credentials,
            timeout,
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.credentials {
            Some(c) => req.basic_auth(&c.username, Some(&c.password)),
            None => req,
        }
    }

    /// Cheap connectivity check: a lightweight status endpoint, falling
    /// back to `/queue` on a non-success response. Returns `(ok, detail)`
    /// where `detail` distinguishes refused/timeout/status failures.
    pub async fn health_probe(&self) -> (bool, String) {
        match self.probe_get("/system_stats").await {
            Ok(status) if status.is_success() => return (true, "ok".to_string()),
            Ok(status) => warn!(worker = %self.base_url, %status, "health probe: status endpoint non-200, falling back to queue"),
            Err(e) => warn!(worker = %self.base_url, error = %e, "health probe: status endpoint unreachable, falling back to queue"),
        }
        match self.probe_get("/queue").await {
            Ok(status) if status.is_success() => (true, "ok (via queue)".to_string()),
            Ok(status) => (false, format!("status {status}")),
            Err(e) if e.is_timeout() => (false, "timeout".to_string()),
            Err(e) if e.is_connect() => (false, "refused".to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    async fn probe_get(&self, path: &str) -> Result<reqwest::StatusCode, reqwest::Error> {
        let url = format!("{}{}", self.base_url, path);
        let req = self.apply_auth(self.http.get(&url).timeout(PROBE_TIMEOUT));
        Ok(req.send().await?.status())
    }

    /// `GET /queue`, returning `None` on any transport or decode error —
    /// the selector and aggregated queue view both treat absence as
    /// "worker unavailable for this decision".
    pub async fn fetch_queue(&self) -> Option<QueueSnapshot> {
        let url = format!("{}/queue", self.base_url);
        let req = self.apply_auth(self.http.get(&url).timeout(PROBE_TIMEOUT));
        let resp = req.send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<QueueSnapshot>().await.ok()
    }

    /// `POST /prompt`. On transport failure returns an error-shaped body
    /// and status 503, so dispatcher retry logic only ever inspects the
    /// status code.
    pub async fn post_prompt(&self, prompt: Value, client_id: Option<String>) -> (Option<Value>, u16) {
        let url = format!("{}/prompt", self.base_url);
        let body = SubmitRequest { prompt, client_id };
        let req = self.apply_auth(self.http.post(&url).timeout(self.timeout).json(&body));
        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.json::<Value>().await.ok();
                (body, status)
            }
            Err(e) => (Some(serde_json::json!({"error": e.to_string()})), 503),
        }
    }

    /// `GET /history/{prompt_id}`.
    pub async fn get_history(&self, prompt_id: &str) -> (Option<Value>, u16) {
        let url = format!("{}/history/{}", self.base_url, prompt_id);
        let req = self.apply_auth(self.http.get(&url).timeout(self.timeout));
        match req.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.json::<Value>().await.ok();
                (body, status)
            }
            Err(e) => (Some(serde_json::json!({"error": e.to_string()})), 503),
        }
    }

    /// Streaming byte proxy for the `view` collaborator endpoint; caller
    /// forwards `status`/`content-type`/`content-disposition` and streams
    /// the body through.
    pub async fn proxy_view(&self, query: &ViewQuery) -> GatewayResult<reqwest::Response> {
        let url = format!("{}/view", self.base_url);
        let req = self
            .apply_auth(self.http.get(&url).timeout(self.timeout))
            .query(&[("filename", &query.filename), ("subfolder", &query.subfolder), ("type", &query.kind)]);
        req.send().await.map_err(|e| GatewayError::transport(e.to_string()))
    }

    /// Open the worker's push channel. The caller owns the read loop.
    pub async fn open_ws(&self) -> GatewayResult<WsStream> {
        let ws_url = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
            + "/ws";
        let mut request = ws_url
            .into_client_request()
            .map_err(|e| GatewayError::transport(e.to_string()))?;
        if let Some(c) = &self.credentials {
            let value = format!("Basic {}", basic_auth_value(&c.username, &c.password));
            request.headers_mut().insert(
                AUTHORIZATION,
                value.parse().map_err(|_| GatewayError::transport("invalid credentials"))?,
            );
        }
        let (stream, _response) =
            tokio_tungstenite::connect_async(request).await.map_err(|e| GatewayError::transport(e.to_string()))?;
        Ok(stream)
    }
}

fn basic_auth_value(username: &str, password: &str) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_rewrites_scheme_and_appends_path() {
        let client = WorkerClient::new("http://w1:8188/", None, Duration::from_secs(30));
        let url = client.base_url.replacen("http://", "ws://", 1) + "/ws";
        assert_eq!(url, "ws://w1:8188/ws");
    }

    #[test]
    fn basic_auth_value_matches_known_vector() {
        // "Aladdin:open sesame" is the canonical RFC 7617 example.
        assert_eq!(basic_auth_value("Aladdin", "open sesame"), "QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }
}
