//! chainsub CLI — watch WebSocket subscriptions from the terminal.
//!
//! Usage:
//! ```bash
//! # Stream new head hashes until Ctrl-C
//! chainsub watch --url ws://localhost:8545 --method subscribeForHeadBlockHash
//!
//! # Stop after 10 payloads, without reconnecting on failure
//! chainsub watch --url wss://node.example/ws --method eth_subscribe \
//!     --params '["newHeads"]' --count 10 --no-reconnect
//!
//! # Send a one-off call over the socket
//! chainsub call --url ws://localhost:8545 --method eth_blockNumber
//! ```

use std::env;
use std::process;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainsub_core::{EngineConfig, ReconnectConfig, SubscribeRequest};
use chainsub_ws::{EngineEvent, SubscriptionClient};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(has_flag(&args, "--verbose"), has_flag(&args, "--json-logs"));

    let result = match args[1].as_str() {
        "watch" => cmd_watch(&args[2..]).await,
        "call" => cmd_call(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("chainsub {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainsub {}", env!("CARGO_PKG_VERSION"));
    println!("Watch JSON-RPC WebSocket subscriptions\n");
    println!("USAGE:");
    println!("    chainsub <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    watch      Subscribe and print every payload as a JSON line");
    println!("    call       Send a single JSON-RPC call and print the result");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --url <URL>        WebSocket endpoint (ws:// or wss://)");
    println!("    --method <NAME>    RPC method  [required]");
    println!("    --params <JSON>    Method params as a JSON value");
    println!("    --count <N>        Stop after N payloads (watch)");
    println!("    --config <FILE>    Engine configuration JSON file");
    println!("    --no-reconnect     Do not reconnect after a disconnect");
    println!("    --verbose          Debug logging (RUST_LOG takes precedence)");
    println!("    --json-logs        Emit logs as JSON");
}

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Logs go to stderr so stdout carries only payloads.
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn cmd_watch(args: &[String]) -> Result<()> {
    let config = engine_config(args)?;
    let method = parse_flag(args, "--method").context("--method is required")?;
    let params = parse_params(args)?;
    let count = parse_flag(args, "--count")
        .map(|n| n.parse::<usize>().context("--count must be a positive integer"))
        .transpose()?;

    let client = SubscriptionClient::new(config)?;
    let mut events = client.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Reconnecting { attempt, delay } => {
                    warn!(attempt, "reconnecting in {delay:?}")
                }
                EngineEvent::SubscriptionClosed { key, reason } => {
                    warn!(%key, %reason, "subscription closed")
                }
                EngineEvent::DecodeFailed { error } => warn!(%error, "dropped frame"),
                _ => {}
            }
        }
    });

    let mut request = SubscribeRequest::new(&method);
    if let Some(params) = params {
        request = request.with_params(params);
    }
    let mut handle = client
        .subscribe(request)
        .await
        .with_context(|| format!("subscribing with {method}"))?;
    info!(key = %handle.key(), id = ?handle.id(), "watching {method}");

    let mut seen = 0usize;
    loop {
        tokio::select! {
            payload = handle.next() => match payload {
                Some(payload) => {
                    println!("{payload}");
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                None => {
                    let reason = handle.close_reason().unwrap_or_default();
                    bail!("subscription ended: {reason}");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.unsubscribe().await?;
    client.close().await;
    info!(payloads = seen, "done");
    Ok(())
}

async fn cmd_call(args: &[String]) -> Result<()> {
    let config = engine_config(args)?;
    let method = parse_flag(args, "--method").context("--method is required")?;
    let params = parse_params(args)?;

    let client = SubscriptionClient::new(config)?;
    let result = client
        .request(&method, params)
        .await
        .with_context(|| format!("calling {method}"))?;
    client.close().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn engine_config(args: &[String]) -> Result<EngineConfig> {
    let mut config = match (parse_flag(args, "--config"), parse_flag(args, "--url")) {
        (Some(path), url) => {
            let mut config = EngineConfig::from_file(&path)
                .with_context(|| format!("loading config from {path}"))?;
            if let Some(url) = url {
                config.url = url;
            }
            config
        }
        (None, Some(url)) => EngineConfig::new(url),
        (None, None) => bail!("--url or --config is required"),
    };
    if has_flag(args, "--no-reconnect") {
        config.reconnect = ReconnectConfig::disabled();
    }
    config.validate()?;
    Ok(config)
}

fn parse_params(args: &[String]) -> Result<Option<Value>> {
    parse_flag(args, "--params")
        .map(|raw| serde_json::from_str(&raw).context("--params must be valid JSON"))
        .transpose()
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
