//! MCP (Model Context Protocol) arming and proxying.
//!
//! Talks to the stdio-to-HTTP bridge running inside an MCP workload:
//! `arm` launches the stdio process and streams its startup events, `proxy`
//! forwards raw JSON-RPC traffic, `status`/`stop` are pass-throughs. The
//! bridge's process states (Idle, Initializing, Ready, Error, Disposed) are
//! opaque strings here; callers render them.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::labels::{self, ANNOTATION_LAST_ACTIVITY, ANNOTATION_MCP_LAUNCH_COMMAND};
use crate::pool::PoolEngine;

/// Launch request for the in-sandbox MCP bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpStartRequest {
    #[serde(default)]
    pub pre_exec_scripts: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_start_timeout")]
    pub timeout_seconds: u64,
}

fn default_start_timeout() -> u64 {
    30
}

/// Bridge process status as reported by `/api/mcp/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpStatus {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<String>,
}

/// HTTP client for the in-sandbox MCP bridge.
#[derive(Clone)]
pub struct McpBridge {
    http: reqwest::Client,
    port: u16,
}

impl McpBridge {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            port,
        }
    }

    /// Launch the MCP stdio process and stream its startup events.
    ///
    /// The rendered launch command is stored as an annotation for display.
    /// Each decoded SSE event is forwarded to the returned channel; lines
    /// that are not JSON are skipped (one warning per stream). Dropping the
    /// receiver ends consumption.
    pub async fn arm(
        &self,
        engine: &PoolEngine,
        name: &str,
        request: McpStartRequest,
    ) -> Result<mpsc::Receiver<Value>> {
        let display = labels::render_launch_command(&request.command, &request.arguments);
        engine
            .annotate(
                name,
                &[
                    (ANNOTATION_MCP_LAUNCH_COMMAND, display),
                    (ANNOTATION_LAST_ACTIVITY, labels::ts_now_string()),
                ],
            )
            .await?;

        let addr = engine.workload_address(name).await?;
        let url = format!("http://{}:{}/api/mcp/start", addr, self.port);
        let response = self.http.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Bridge {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(16);
        let workload = name.to_string();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut warned_non_json = false;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(workload = %workload, error = %e, "MCP start stream interrupted");
                        return;
                    }
                };
                for payload in decoder.push(&chunk) {
                    match serde_json::from_str::<Value>(&payload) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => {
                            if !warned_non_json {
                                warn!(workload = %workload, "skipping non-JSON line in MCP start stream");
                                warned_non_json = true;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Forward a raw JSON-RPC body to the bridge.
    ///
    /// HTTP 202 means the body was a notification: there is no response,
    /// translated to `{}`. Any other 2xx returns the body verbatim.
    pub async fn proxy(&self, engine: &PoolEngine, name: &str, body: Value) -> Result<Value> {
        // Activity tracking must not gate the request.
        {
            let engine = engine.clone();
            let workload = name.to_string();
            tokio::spawn(async move {
                engine.touch_activity(&workload).await;
            });
        }

        let addr = engine.workload_address(name).await?;
        let url = format!("http://{}:{}/mcp", addr, self.port);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Bridge {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Pass-through to the bridge's status endpoint.
    pub async fn status(&self, engine: &PoolEngine, name: &str) -> Result<McpStatus> {
        let addr = engine.workload_address(name).await?;
        let url = format!("http://{}:{}/api/mcp/status", addr, self.port);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Bridge {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }

    /// Stop the MCP process. The bridge reports Disposed afterwards.
    pub async fn stop(&self, engine: &PoolEngine, name: &str) -> Result<()> {
        let addr = engine.workload_address(name).await?;
        let url = format!("http://{}:{}/api/mcp", addr, self.port);
        let response = self.http.delete(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Bridge {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }
}

/// Incremental decoder for newline-delimited SSE `data:` payloads.
/// Chunks may split lines anywhere; partial lines are buffered.
pub(crate) struct SseDecoder {
    buf: String,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self { buf: String::new() }
    }

    /// Feed a chunk, returning the complete `data:` payloads it closed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_single_event() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"state\":\"Initializing\"}\n\n");
        assert_eq!(payloads, vec!["{\"state\":\"Initializing\"}"]);
    }

    #[test]
    fn test_sse_decoder_chunk_split_mid_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"sta").is_empty());
        let payloads = decoder.push(b"te\":\"Ready\"}\n");
        assert_eq!(payloads, vec!["{\"state\":\"Ready\"}"]);
    }

    #[test]
    fn test_sse_decoder_multiple_events_one_chunk() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: 1\n\ndata: 2\n\n");
        assert_eq!(payloads, vec!["1", "2"]);
    }

    #[test]
    fn test_sse_decoder_crlf_and_noise() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"event: update\r\ndata: {\"x\":1}\r\n\r\n");
        assert_eq!(payloads, vec!["{\"x\":1}"]);
    }

    #[test]
    fn test_start_request_wire_format() {
        let request = McpStartRequest {
            pre_exec_scripts: vec!["setup.sh".to_string()],
            command: "npx".to_string(),
            arguments: vec!["-y".to_string(), "@modelcontextprotocol/server-everything".to_string()],
            timeout_seconds: 30,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["preExecScripts"][0], "setup.sh");
        assert_eq!(json["command"], "npx");
        assert_eq!(json["arguments"][1], "@modelcontextprotocol/server-everything");
        assert_eq!(json["timeoutSeconds"], 30);
    }

    #[test]
    fn test_status_decode() {
        let status: McpStatus = serde_json::from_str(
            r#"{"state":"Ready","startedAt":"2026-01-01T00:00:00Z","lastRequestAt":null}"#,
        )
        .unwrap();
        assert_eq!(status.state, "Ready");
        assert!(status.error.is_none());
        assert!(status.started_at.is_some());
    }
}
