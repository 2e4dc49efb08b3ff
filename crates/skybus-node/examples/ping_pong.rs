//! Two nodes on one in-process broker: a fire-and-forget broadcast and a
//! blocking ping/pong request.
//!
//! Run with `cargo run -p skybus-node --example ping_pong`.

use serde_json::{json, Value};
use skybus_node::{MemoryBroker, Node, NodeConfig, RouteOptions};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let broker = MemoryBroker::new();

    let responder = Node::new(
        NodeConfig {
            name: Some("responder".to_string()),
            ..NodeConfig::default()
        },
        Arc::new(broker.clone()),
    );
    responder.register("^ping$", RouteOptions::blocking(), |delivery| {
        tracing::info!(from = %delivery.sender, "ping received");
        Ok(Some(json!("pong")))
    })?;
    responder.register("announce\\..*", RouteOptions::default(), |delivery| {
        tracing::info!(label = %delivery.label, data = %delivery.data, "announcement");
        Ok(None)
    })?;

    let caller = Node::new(
        NodeConfig {
            name: Some("caller".to_string()),
            ..NodeConfig::default()
        },
        Arc::new(broker.clone()),
    );

    responder.start().await?;
    caller.start().await?;

    caller
        .send("announce.online", &json!({"node": "caller"}))
        .await?;

    let reply = caller
        .send_blocking(
            responder.id(),
            "ping",
            &Value::Null,
            Duration::from_secs(2),
        )
        .await?;
    tracing::info!(%reply, "pong received");

    caller.stop().await?;
    responder.stop().await?;
    Ok(())
}
