//! Mock discovery pipeline driving an MCP tool over stdio.
//!
//! Run with:
//! cargo build -p mcp-bridge-stdio && cargo run -p research-pipeline -- target/debug/mcp-echo-server
//!
//! Each stage hands its predecessor's output to the tool and passes the
//! result on. `MCP_BRIDGE_CONFIG` may name a JSON file with manager settings.

use std::sync::Arc;

use anyhow::{Context, Result};
use mcp_bridge_core::{ManagerConfig, StdioConfig};
use mcp_bridge_session::{CallableTool, SessionManager, ToolAdapter};
use mcp_bridge_stdio::StdioConnector;
use serde_json::{Map, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_SERVER: &str = "mcp-echo-server";

/// (role, task) for each stage, in order.
const STAGES: &[(&str, &str)] = &[
    ("researcher", "form a hypothesis"),
    ("designer", "design an experiment"),
    ("technician", "execute the experiment"),
    ("analyst", "analyze the results"),
    ("writer", "write the paper"),
    ("reviewer", "review the paper"),
];

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let command = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let config = load_config()?;

    let manager = Arc::new(SessionManager::with_config(
        StdioConnector::new(StdioConfig::default()),
        config,
    ));
    let echo: Arc<dyn CallableTool> = Arc::new(
        ToolAdapter::new(Arc::clone(&manager), command, "echo_tool")
            .with_description("Echoes a message using the stdio MCP echo server."),
    );
    tracing::info!(tool = echo.name(), description = %echo.description(), "Tool registered");

    let outcome = tokio::select! {
        result = run_pipeline(echo.as_ref()) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, shutting down");
            Ok(())
        }
    };

    // Close failures are logged by the manager.
    manager.release_all().await;
    outcome
}

async fn run_pipeline(tool: &dyn CallableTool) -> Result<()> {
    let mut carried = String::from("initial observations");
    for (role, task) in STAGES {
        let mut arguments = Map::new();
        arguments.insert(
            "message".to_string(),
            json!(format!("[{role}] {task} given: {carried}")),
        );
        let result = tool
            .call(arguments)
            .await
            .with_context(|| format!("stage '{role}' failed"))?;
        carried = result.text_content();
        tracing::info!(stage = role, output = %carried, "Stage complete");
    }
    println!("{carried}");
    Ok(())
}

fn load_config() -> Result<ManagerConfig> {
    let Ok(path) = std::env::var("MCP_BRIDGE_CONFIG") else {
        return Ok(ManagerConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}
