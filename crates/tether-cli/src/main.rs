//! Tether CLI: serve a node over TCP or probe a running one.

mod cli;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use std::net::SocketAddr;
use tether_types::TetherConfig;
use tether_wire::config::load_config;
use tether_wire::{Node, TypeRegistry, Value};
use tracing::info;

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);

    let result = match cli.command {
        Commands::Serve { listen, name } => cmd_serve(config, listen, name),
        Commands::Probe {
            addr,
            mimetype,
            args,
            keep,
        } => cmd_probe(&config, addr, &mimetype, &args, keep),
    };

    if let Err(e) = result {
        ui::error(&e);
        std::process::exit(1);
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Runtime::new().map_err(|e| format!("Failed to start async runtime: {e}"))
}

fn cmd_serve(
    mut config: TetherConfig,
    listen: Option<String>,
    name: Option<String>,
) -> Result<(), String> {
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if let Some(name) = name {
        config.node_name = name;
    }

    runtime()?.block_on(async move {
        let (node, accept) = Node::start(config, TypeRegistry::new())
            .await
            .map_err(|e| format!("Failed to start node: {e}"))?;
        ui::success(&format!("Tether node listening on {}", node.local_addr()));
        ui::kv("Object types", &node.types().mimetypes().join(", "));

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to wait for Ctrl+C: {e}"))?;
        info!(peers = node.connected_count(), "interrupt received");
        accept.abort();
        node.shutdown().await;
        Ok::<(), String>(())
    })
}

fn cmd_probe(
    config: &TetherConfig,
    addr: SocketAddr,
    mimetype: &str,
    args: &str,
    keep: bool,
) -> Result<(), String> {
    let args: serde_json::Value =
        serde_json::from_str(args).map_err(|e| format!("--args is not valid JSON: {e}"))?;

    runtime()?.block_on(async move {
        let peer = Node::connect(addr, config, TypeRegistry::new())
            .await
            .map_err(|e| e.to_string())?;
        let root = peer
            .create(mimetype, args)
            .await
            .map_err(|e| format!("Failed to create {mimetype}: {e}"))?;

        ui::success(&format!("Created {mimetype} as spawn {}", root.spawn_id()));
        ui::section("Properties");
        for name in root.properties() {
            let fetch = root.get_property(&name).map_err(|e| e.to_string())?;
            let shown = match fetch.await {
                Ok(value) => describe(&value),
                Err(e) => format!("<{e}>"),
            };
            ui::kv(&name, &shown);
        }

        if !keep {
            root.destroy()
                .await
                .map_err(|e| format!("Failed to destroy spawn: {e}"))?;
        }
        peer.shutdown();
        Ok::<(), String>(())
    })
}

/// One-line rendering of a received value.
fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Json(data) => data.to_string(),
        Value::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        Value::Error(message) => format!("<error: {message}>"),
        Value::Remote(remote) => {
            let props = remote.properties();
            if props.is_empty() || props == ["length"] {
                format!("<remote {}>", remote.handle())
            } else {
                format!("<remote {} {{{}}}>", remote.handle(), props.join(", "))
            }
        }
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_values() {
        assert_eq!(describe(&Value::Null), "null");
        assert_eq!(describe(&Value::from(42)), "42");
        assert_eq!(describe(&Value::from("hi")), "\"hi\"");
        assert_eq!(describe(&Value::json(json!({"a": 1}))), r#"{"a":1}"#);
        assert_eq!(describe(&Value::bytes(vec![1, 2, 3])), "<3 bytes>");
        assert_eq!(describe(&Value::Error("boom".into())), "<error: boom>");
    }
}
