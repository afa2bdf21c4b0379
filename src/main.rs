use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wireboard_core::config::{AppConfig, Topology};
use wireboard_core::event::{InputRequest, RunEvent, SecretRequest};
use wireboard_core::traits::GraphLoader;
use wireboard_core::types::{reserved, InputValues};
use wireboard_gateway::ProxyServer;
use wireboard_kits::KitRegistry;
use wireboard_runtime::{DefaultGraphLoader, Harness};

#[derive(Parser)]
#[command(name = "wireboard", version, about = "Run wired node graphs with privileged nodes behind a proxy")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "wireboard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a board and answer its prompts on the terminal
    Run {
        /// Board path or URL
        board: String,
        /// Preset input (repeatable). Values parse as JSON, else as strings.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Override harness.topology (in-process, worker, remote)
        #[arg(long)]
        topology: Option<Topology>,
        /// Also print lifecycle events
        #[arg(long)]
        diagnostics: bool,
    },
    /// Start the proxy server
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },
    /// List a board's nodes and the kits that handle them
    Describe {
        /// Board path or URL
        board: String,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("wireboard=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "wireboard", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(path = %cli.config.display(), "No config file found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Run {
            board,
            inputs,
            topology,
            diagnostics,
        } => {
            let presets = parse_inputs(&inputs)?;
            run_board(config, &board, presets, topology, diagnostics).await?;
        }
        Commands::Serve { bind } => {
            let mut server_config = config.server.clone().unwrap_or_default();
            if let Some(bind) = bind {
                server_config.bind = bind;
            }
            if server_config.proxy_nodes.is_empty() {
                warn!("server.proxy_nodes is empty; every proxy request will be rejected");
            }
            let kits = KitRegistry::with_builtins();
            let server = ProxyServer::new(server_config, kits.handlers().clone())?;

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down proxy server...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Describe { board } => {
            describe_board(&board).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&redacted(config))?);
        }
        Commands::Completions { .. } => unreachable!(),
    }

    Ok(())
}

async fn run_board(
    config: AppConfig,
    board: &str,
    presets: InputValues,
    topology: Option<Topology>,
    diagnostics: bool,
) -> anyhow::Result<()> {
    let mut run_config = config.run.clone();
    run_config.diagnostics |= diagnostics;
    let mut harness_config = config.harness.clone();
    if let Some(topology) = topology {
        harness_config.topology = topology;
    }

    let harness = Harness::new(KitRegistry::with_builtins())
        .with_run_config(run_config)
        .with_harness_config(harness_config);
    let mut run = harness.run(board, presets).await?;
    info!(run_id = %run.run_id(), board = %board, "Run started");

    let cancel = run.cancel_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel.cancel();
    });

    while let Some(mut result) = run.next().await {
        match result.event().clone() {
            RunEvent::Input(req) => {
                let values = tokio::task::spawn_blocking(move || prompt_inputs(&req)).await??;
                result.reply(values);
            }
            RunEvent::Secret(req) => {
                let values = tokio::task::spawn_blocking(move || prompt_secrets(&req)).await??;
                result.reply(values);
            }
            RunEvent::Output(data) => {
                println!("{}", serde_json::to_string_pretty(&data.outputs)?);
            }
            RunEvent::Error(data) => {
                anyhow::bail!("{}", data.error);
            }
            RunEvent::End(_) => {
                eprintln!("[done]");
            }
            event => print_diagnostic(&event),
        }
    }
    Ok(())
}

fn print_diagnostic(event: &RunEvent) {
    match event {
        RunEvent::GraphStart(data) => {
            eprintln!("[graphstart {}]", data.url.as_deref().unwrap_or("<inline>"))
        }
        RunEvent::NodeStart(data) => {
            eprintln!("[nodestart {} ({}) #{}]", data.node.id, data.node.node_type, data.firing)
        }
        RunEvent::NodeEnd(data) => {
            eprintln!("[nodeend {} ({}) #{}]", data.node.id, data.node.node_type, data.firing)
        }
        RunEvent::GraphEnd(data) => eprintln!("[graphend: {} firings]", data.firings),
        other => eprintln!("[{}]", other.kind()),
    }
}

/// Ask for every property of the node's schema; without one, ask for a JSON object.
fn prompt_inputs(req: &InputRequest) -> anyhow::Result<InputValues> {
    let properties = req
        .input_arguments
        .schema
        .as_ref()
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object);

    let mut values = InputValues::new();
    match properties {
        Some(properties) if !properties.is_empty() => {
            for (name, schema) in properties {
                let label = schema
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(name.as_str());
                let raw: String = dialoguer::Input::new()
                    .with_prompt(format!("{} ({})", label, req.node.id))
                    .interact_text()?;
                values.insert(name.clone(), parse_value(&raw));
            }
        }
        _ => {
            let raw: String = dialoguer::Input::new()
                .with_prompt(format!("{} (JSON object)", req.node.id))
                .interact_text()?;
            match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => values = map,
                _ => anyhow::bail!("input for {} must be a JSON object", req.node.id),
            }
        }
    }
    Ok(values)
}

/// Secrets come from the environment first, then a hidden prompt.
fn prompt_secrets(req: &SecretRequest) -> anyhow::Result<InputValues> {
    let mut values = InputValues::new();
    for key in &req.keys {
        let value = match std::env::var(key) {
            Ok(v) => v,
            Err(_) => dialoguer::Password::new()
                .with_prompt(format!("Secret {}", key))
                .interact()
                .with_context(|| format!("reading secret {}", key))?,
        };
        values.insert(key.clone(), Value::String(value));
    }
    Ok(values)
}

async fn describe_board(board: &str) -> anyhow::Result<()> {
    let graph = DefaultGraphLoader::new().load(board).await?;
    let kits = KitRegistry::with_builtins();

    println!("{}", graph.title.as_deref().unwrap_or(board));
    println!("Nodes:");
    for node in &graph.nodes {
        let provider = if matches!(
            node.node_type.as_str(),
            reserved::INPUT | reserved::OUTPUT | reserved::SECRETS
        ) {
            "reserved".to_string()
        } else {
            match kits.kit_for(&node.node_type) {
                Some(kit) => kit.url.clone(),
                None => "(no handler)".to_string(),
            }
        };
        println!("  {:<20} {:<18} {}", node.id, node.node_type, provider);
    }
    println!("Edges: {}", graph.edges.len());
    Ok(())
}

/// Parse `KEY=VALUE` pairs into preset inputs.
fn parse_inputs(pairs: &[String]) -> anyhow::Result<InputValues> {
    let mut values = InputValues::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got {:?}", pair))?;
        values.insert(key.trim().to_string(), parse_value(raw));
    }
    Ok(values)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn redacted(mut config: AppConfig) -> AppConfig {
    if config.harness.remote_token.is_some() {
        config.harness.remote_token = Some("********".into());
    }
    if let Some(server) = config.server.as_mut() {
        if server.token.is_some() {
            server.token = Some("********".into());
        }
        for value in server.secrets.values_mut() {
            *value = "********".into();
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inputs_parse_as_json_then_string() {
        let values = parse_inputs(&[
            "x=5".to_string(),
            "name=Ada".to_string(),
            "flags={\"a\":true}".to_string(),
        ])
        .unwrap();
        assert_eq!(values["x"], 5);
        assert_eq!(values["name"], "Ada");
        assert_eq!(values["flags"]["a"], true);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse_inputs(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn config_output_hides_secrets() {
        let config = AppConfig::parse(
            r#"
[server]
token = "tok"
[server.secrets]
API_KEY = "hunter2"
"#,
        )
        .unwrap();
        let text = toml::to_string_pretty(&redacted(config)).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("\"tok\""));
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "wireboard", "run", "board.json", "-i", "x=1", "--topology", "worker",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { board, inputs, topology, .. } => {
                assert_eq!(board, "board.json");
                assert_eq!(inputs, vec!["x=1".to_string()]);
                assert_eq!(topology, Some(Topology::Worker));
            }
            _ => panic!("expected run"),
        }
    }
}
