use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mcp_relay::config::{AppConfig, McpConfig};
use mcp_relay::mcp::{MCPServerRegistry, ToolIndex, TransportKind};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcp_relay", version, about = "Discover and call tools on MCP servers")]
struct Cli {
    /// Settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server descriptor file ({"mcpServers": {...}})
    #[arg(long)]
    servers: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the tools of every server that connects
    List,
    /// Call one tool and print its text output
    Call {
        tool: String,
        /// Call on this server instead of looking the tool up
        #[arg(long)]
        server: Option<String>,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Show each configured server and whether it connects
    Servers,
    /// Print the effective settings
    ShowConfig,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut app_config = AppConfig::load(cli.config.as_deref())?;
    if let Some(servers) = cli.servers {
        app_config.servers_file = Some(servers);
    }

    init_tracing(app_config.log_level.as_deref());
    info!("Starting mcp_relay...");

    if let Command::ShowConfig = cli.command {
        print!("{}", app_config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let mcp_config = McpConfig::load_from_json(&app_config.servers_path())?;
    let registry = MCPServerRegistry::new(app_config.client.clone());
    registry.initialize_from_config(&mcp_config).await;

    let outcome = run(cli.command, &registry, &mcp_config).await;
    registry.close_all().await;
    outcome
}

async fn run(command: Command, registry: &MCPServerRegistry, mcp_config: &McpConfig) -> Result<ExitCode> {
    match command {
        Command::List => {
            let all = registry.list_all().await;
            let mut names: Vec<&String> = all.keys().collect();
            names.sort();
            for name in names {
                for tool in &all[name] {
                    println!("{}: {} - {}", name, tool.name, tool.description);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Call { tool, server, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }

            let result = match server {
                Some(server) => match registry.get(&server).await {
                    Some(client) => client.call_tool(&tool, arguments).await,
                    None => bail!("MCP server {} is not connected", server),
                },
                None => {
                    let mut index = ToolIndex::new();
                    index.refresh(registry).await;
                    index.invoke(registry, &tool, arguments).await
                }
            };

            for text in result.texts() {
                println!("{}", text);
            }
            Ok(if result.is_error { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Command::Servers => {
            let failures = registry.failures().await;
            let mut names: Vec<&String> = mcp_config.servers.keys().collect();
            names.sort();
            for name in names {
                let kind = TransportKind::resolve(&mcp_config.servers[name]);
                match failures.get(name.as_str()) {
                    Some(reason) => println!("{} ({}): failed - {}", name, kind, reason),
                    None => println!("{} ({}): connected", name, kind),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ShowConfig => Ok(ExitCode::SUCCESS),
    }
}
