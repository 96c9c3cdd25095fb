//! Sandbox MCP Gateway
//!
//! Exposes the sandbox provisioning API as MCP tools over Streamable HTTP
//! and legacy SSE.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use sandbox_mcp_gateway::{
    cli::{Cli, Command, OutputFormat},
    config::Config,
    gateway::Gateway,
    registry::Registry,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Tools { format }) => run_tools(format),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print the tool table
fn run_tools(format: OutputFormat) -> ExitCode {
    let registry = match Registry::builtin() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Tool table is inconsistent: {e}");
            return ExitCode::FAILURE;
        }
    };

    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(&registry.list_tools()) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to serialize tools: {e}");
                return ExitCode::FAILURE;
            }
        },
        OutputFormat::Table => {
            let width = registry.iter().map(|t| t.name.len()).max().unwrap_or(0);
            for tool in registry.iter() {
                let flags = if tool.idempotent { "read" } else { "write" };
                println!(
                    "{:<width$}  {:<6} {:<5}  {}",
                    tool.name,
                    tool.method.as_str(),
                    flags,
                    tool.path
                );
            }
            println!("\n{} tools", registry.len());
        }
    }
    ExitCode::SUCCESS
}

async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        upstream = %config.upstream.base_url,
        "Starting Sandbox MCP Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
