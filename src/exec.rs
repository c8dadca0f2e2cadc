//! Command execution bridge to the in-sandbox executor.
//!
//! Opens a streaming POST against the executor and byte-copies its SSE
//! response into the caller's sink. The event framing (OutputEvent /
//! CompletedEvent envelopes) is preserved end-to-end, never parsed here.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::pool::PoolEngine;

/// Request forwarded to the executor's `/api/execute` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
}

/// HTTP client for the in-sandbox executor.
#[derive(Clone)]
pub struct ExecBridge {
    http: reqwest::Client,
    port: u16,
}

impl ExecBridge {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            port,
        }
    }

    /// Run a command in the workload, streaming the executor's response
    /// bytes into `sink` as they arrive.
    ///
    /// Partial output already written is not rolled back on transport
    /// errors; the caller sees the error after whatever bytes made it.
    pub async fn exec<W>(
        &self,
        engine: &PoolEngine,
        name: &str,
        request: &ExecRequest,
        sink: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        engine.touch_activity(name).await;

        let addr = engine.workload_address(name).await?;
        let url = format!("http://{}:{}/api/execute", addr, self.port);
        let response = self.http.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Bridge {
                status: status.as_u16(),
                message,
            });
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk: bytes::Bytes = chunk?;
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_wire_format() {
        let request = ExecRequest {
            command: "echo hi".to_string(),
            timeout_seconds: Some(30),
            working_directory: None,
            environment: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["command"], "echo hi");
        assert_eq!(json["timeoutSeconds"], 30);
        assert!(json.get("workingDirectory").is_none());
    }

    #[test]
    fn test_exec_request_decode_extra_fields() {
        let request: ExecRequest = serde_json::from_str(
            r#"{"command":"ls","environment":{"TERM":"xterm"}}"#,
        )
        .unwrap();
        assert_eq!(request.command, "ls");
        assert_eq!(
            request.environment.unwrap().get("TERM").map(String::as_str),
            Some("xterm")
        );
        assert!(request.timeout_seconds.is_none());
    }
}
