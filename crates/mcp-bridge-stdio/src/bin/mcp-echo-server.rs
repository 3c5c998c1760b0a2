//! Minimal MCP server on stdin/stdout exposing a single `echo_tool`.
//!
//! Flags:
//! - `--exit-before-handshake` exits immediately with status 1
//! - `--no-banner` skips the plain-text banner printed before serving

use mcp_bridge_core::{
    CallToolResult,
    protocol::{Incoming, LATEST_PROTOCOL_VERSION, Response, RpcError, methods},
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVER_NAME: &str = "EchoMCPServer";
const ECHO_TOOL: &str = "echo_tool";
const INVALID_PARAMS: i64 = -32602;
const ECHO_PREFIX: &str = "Echo from MCP STDIN/STDOUT Server: ";

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // stdout carries the protocol, so traces go to stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--exit-before-handshake") {
        tracing::warn!("Exiting before handshake as requested");
        std::process::exit(1);
    }

    let mut stdout = tokio::io::stdout();
    if !args.iter().any(|a| a == "--no-banner") {
        stdout
            .write_all(b"Starting Echo MCP Server on STDIN/STDOUT.\n")
            .await?;
        stdout.flush().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(Incoming::Request { id, method, params }) = Incoming::parse(&line) else {
            tracing::debug!(line, "Ignoring non-request message");
            continue;
        };
        let response = handle(id, &method, params.unwrap_or(Value::Null));
        let json = serde_json::to_string(&response)?;
        stdout.write_all(json.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn handle(id: Value, method: &str, params: Value) -> Response {
    match method {
        methods::INITIALIZE => {
            let version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(LATEST_PROTOCOL_VERSION);
            Response::success(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
                }),
            )
        }
        methods::PING => Response::success(id, json!({})),
        methods::TOOLS_LIST => Response::success(
            id,
            json!({
                "tools": [{
                    "name": ECHO_TOOL,
                    "description": "A simple echo tool via MCP",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } },
                        "required": ["message"]
                    }
                }]
            }),
        ),
        methods::TOOLS_CALL => call_tool(id, &params),
        other => Response::failure(id, RpcError::method_not_found(other)),
    }
}

fn call_tool(id: Value, params: &Value) -> Response {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if name != ECHO_TOOL {
        return Response::failure(
            id,
            RpcError {
                code: INVALID_PARAMS,
                message: format!("Unknown tool: {name}"),
                data: None,
            },
        );
    }

    let result = match params
        .pointer("/arguments/message")
        .and_then(Value::as_str)
    {
        Some(message) => CallToolResult::text(format!("{ECHO_PREFIX}{message}")),
        None => CallToolResult {
            is_error: true,
            ..CallToolResult::text("missing required argument 'message'")
        },
    };
    match serde_json::to_value(result) {
        Ok(value) => Response::success(id, value),
        Err(e) => Response::failure(
            id,
            RpcError {
                code: INVALID_PARAMS,
                message: e.to_string(),
                data: None,
            },
        ),
    }
}
