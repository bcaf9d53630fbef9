//! Newline-delimited JSON gateway over TCP.
//!
//! One connection per request. Requests:
//!
//! ```text
//! {"command":"execute","code":"..."}
//! {"command":"reset","baseline":"..."}
//! {"command":"capture"}
//! ```
//!
//! Replies carry `status` (`success` or `error`) plus `output`, `errors`,
//! `snapshot`, `fingerprint` and `views` (hex-encoded bytes per view name).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{ApplyOutcome, EnvironmentGateway, GatewayError, ResetOutcome, Views};
use crate::state::{ExecutionResult, Snapshot};

/// Default per-request timeouts.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on a single reply line.
const MAX_REPLY_BYTES: u64 = 64 * 1024 * 1024;

/// Per-operation deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTimeouts {
    pub apply: Duration,
    pub reset: Duration,
    pub capture: Duration,
}

impl Default for GatewayTimeouts {
    fn default() -> Self {
        Self {
            apply: DEFAULT_APPLY_TIMEOUT,
            reset: DEFAULT_RESET_TIMEOUT,
            capture: DEFAULT_CAPTURE_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    status: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    snapshot: Option<Snapshot>,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    views: BTreeMap<String, String>,
}

impl Reply {
    fn is_success(&self) -> bool {
        self.status == "success"
    }

    fn error_text(&self) -> String {
        if !self.errors.is_empty() {
            self.errors.join("; ")
        } else {
            self.message
                .clone()
                .unwrap_or_else(|| "environment reported an error".to_string())
        }
    }
}

/// Gateway speaking JSON lines to a TCP endpoint.
#[derive(Debug, Clone)]
pub struct SocketGateway {
    endpoint: String,
    timeouts: GatewayTimeouts,
}

impl SocketGateway {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeouts: GatewayTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: GatewayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check that the endpoint accepts connections.
    pub async fn probe(&self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&self.endpoint)).await,
            Ok(Ok(_))
        )
    }

    async fn request(
        &self,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Reply, GatewayError> {
        match tokio::time::timeout(timeout, self.exchange(payload)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                endpoint: self.endpoint.clone(),
                operation: operation.to_string(),
                secs: timeout.as_secs(),
            }),
        }
    }

    async fn exchange(&self, payload: Value) -> Result<Reply, GatewayError> {
        let mut stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|e| GatewayError::unreachable(&self.endpoint, e.to_string()))?;

        let mut line = payload.to_string();
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| GatewayError::unreachable(&self.endpoint, e.to_string()))?;

        let mut reader = BufReader::new(stream.take(MAX_REPLY_BYTES));
        let mut response = String::new();
        let n = reader
            .read_line(&mut response)
            .await
            .map_err(|e| GatewayError::unreachable(&self.endpoint, e.to_string()))?;
        if n == 0 {
            return Err(GatewayError::unreachable(
                &self.endpoint,
                "connection closed before reply",
            ));
        }

        serde_json::from_str(response.trim())
            .map_err(|e| GatewayError::protocol(&self.endpoint, format!("invalid reply: {e}")))
    }
}

#[async_trait]
impl EnvironmentGateway for SocketGateway {
    async fn apply(&self, action: &str) -> Result<ApplyOutcome, GatewayError> {
        debug!(endpoint = %self.endpoint, "Applying action ({} chars)", action.len());
        let reply = self
            .request(
                "execute",
                json!({"command": "execute", "code": action}),
                self.timeouts.apply,
            )
            .await?;

        let ok = match reply.status.as_str() {
            "success" => true,
            "error" => false,
            other => {
                return Err(GatewayError::protocol(
                    &self.endpoint,
                    format!("unknown status '{other}'"),
                ))
            }
        };
        let error = (!ok).then(|| reply.error_text());
        let snapshot = reply.snapshot.clone().unwrap_or_else(|| Snapshot {
            id: String::new(),
            description: reply.output.clone(),
        });
        Ok(ApplyOutcome {
            result: ExecutionResult {
                ok,
                output: reply.output,
                error,
            },
            snapshot,
        })
    }

    async fn reset(&self, baseline: &str) -> Result<ResetOutcome, GatewayError> {
        let reply = self
            .request(
                "reset",
                json!({"command": "reset", "baseline": baseline}),
                self.timeouts.reset,
            )
            .await?;

        if !reply.is_success() {
            return Ok(ResetOutcome {
                ok: false,
                fingerprint: String::new(),
                error: Some(reply.error_text()),
            });
        }
        let fingerprint = reply.fingerprint.clone().ok_or_else(|| {
            GatewayError::protocol(&self.endpoint, "reset reply has no fingerprint")
        })?;
        Ok(ResetOutcome {
            ok: true,
            fingerprint,
            error: None,
        })
    }

    async fn capture(&self) -> Result<Views, GatewayError> {
        let reply = self
            .request("capture", json!({"command": "capture"}), self.timeouts.capture)
            .await?;

        if !reply.is_success() {
            warn!(endpoint = %self.endpoint, "Capture failed: {}", reply.error_text());
            return Ok(Views::new());
        }

        reply
            .views
            .into_iter()
            .map(|(name, encoded)| {
                hex::decode(&encoded)
                    .map(|bytes| (name.clone(), bytes))
                    .map_err(|e| {
                        GatewayError::protocol(&self.endpoint, format!("view {name}: {e}"))
                    })
            })
            .collect()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
