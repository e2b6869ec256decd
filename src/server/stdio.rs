//! Newline-delimited JSON transport on stdin/stdout.
//!
//! One JSON object per line: requests carry the execute shape plus a `tool`
//! field, responses mirror `ToolResult`. Malformed lines get a structured
//! error response instead of tearing down the stream. Shutdown cancels the
//! read loop; in-flight executions are drained by the caller.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::error::{ErrorContext, ErrorKind, TransportError};
use crate::gateway::{DispatchError, Gateway};
use crate::types::{ToolRequest, ToolResult};

/// A stdio request: the execute shape plus the tool to run.
#[derive(Debug, Deserialize)]
struct StdioRequest {
    tool: String,
    #[serde(flatten)]
    request: ToolRequest,
}

/// Run the stdio loop until stdin closes or shutdown fires.
pub async fn run(
    gateway: Arc<Gateway>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    tracing::info!("stdio transport ready");

    loop {
        let line = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("stdio transport shutting down");
                    break;
                }
                continue;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::info!("stdin closed, stdio transport ending");
                    break;
                }
                Err(e) => {
                    return Err(TransportError::WriteFailed {
                        name: "stdio".to_string(),
                        reason: format!("stdin read failed: {e}"),
                    });
                }
            },
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = handle_line(&gateway, trimmed).await;
        let mut serialized = serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"error":"serialization failed: {e}"}}"#)
        });
        serialized.push('\n');
        let write = async {
            stdout.write_all(serialized.as_bytes()).await?;
            stdout.flush().await
        };
        write.await.map_err(|e| TransportError::WriteFailed {
            name: "stdio".to_string(),
            reason: e.to_string(),
        })?;
    }

    Ok(())
}

async fn handle_line(gateway: &Gateway, line: &str) -> ToolResult {
    let parsed: Result<StdioRequest, _> = serde_json::from_str(line);
    match parsed {
        Ok(req) => match gateway.execute(&req.tool, &req.request).await {
            Ok(result) => result,
            Err(e) => dispatch_error_result(e, &req.request),
        },
        Err(e) => {
            let ctx = ErrorContext::new(
                ErrorKind::ValidationError,
                format!("malformed request line: {e}"),
                "",
                "",
            )
            .with_hint("Send one JSON object per line with a tool field");
            ToolResult::from_error(ctx, 2, Uuid::new_v4().to_string())
        }
    }
}

fn dispatch_error_result(e: DispatchError, request: &ToolRequest) -> ToolResult {
    let (kind, hint) = match &e {
        DispatchError::UnknownTool(_) => (
            ErrorKind::NotFound,
            "List available tools with the tools endpoint",
        ),
        DispatchError::ToolDisabled(_) => {
            (ErrorKind::ExecutionError, "Enable the tool before use")
        }
    };
    let ctx = ErrorContext::new(kind, e.to_string(), "", &request.target).with_hint(hint);
    ToolResult::from_error(ctx, 1, request.correlation_id_or_new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Gateway;

    fn gateway() -> Arc<Gateway> {
        Gateway::new(&crate::registry::tests::test_config())
    }

    #[tokio::test]
    async fn malformed_line_yields_validation_error() {
        let result = handle_line(&gateway(), "{not json").await;
        assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
        assert!(!result.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn missing_tool_field_yields_validation_error() {
        let result = handle_line(&gateway(), r#"{"target":"10.0.0.1"}"#).await;
        assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
    }

    #[tokio::test]
    async fn unknown_tool_yields_not_found() {
        let result =
            handle_line(&gateway(), r#"{"tool":"nessus","target":"10.0.0.1"}"#).await;
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn forbidden_args_yield_structured_validation_error() {
        let result = handle_line(
            &gateway(),
            r#"{"tool":"nmap","target":"10.0.0.1","extra_args":"-p 80|id"}"#,
        )
        .await;
        assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
        let ctx = result.error.unwrap();
        assert_eq!(ctx.kind, ErrorKind::ValidationError);
        assert!(!ctx.recovery_hint.is_empty());
    }

    #[tokio::test]
    async fn correlation_id_flows_through() {
        let result = handle_line(
            &gateway(),
            r#"{"tool":"nmap","target":"8.8.8.8","correlation_id":"abc-123"}"#,
        )
        .await;
        assert_eq!(result.correlation_id, "abc-123");
    }
}
