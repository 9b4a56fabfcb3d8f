//! playbox - disposable workspace sandbox with HTTP API and WebSocket terminal.
//!
//! Usage:
//!   playbox serve [--port 8080]      # Session + execution API
//!   playbox gateway [--port 8081]    # Interactive terminal gateway

use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};

mod backend;
mod config;
mod error;
mod exec;
mod gateway;
mod http_server;
mod sanitizer;
mod sessions;
mod state;
mod ticket;
mod workspace;

use config::Config;
use sessions::SessionManager;
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "playbox")]
#[command(about = "Disposable workspace sandbox with HTTP API and WebSocket terminal")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the session and execution API
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Start the interactive terminal gateway
    Gateway {
        /// Port to listen on
        #[arg(long, default_value = "8081")]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    match args.command {
        Commands::Serve { port } => {
            let manager = match SessionManager::new(config.workspace_root.clone()) {
                Ok(manager) => manager,
                Err(e) => {
                    eprintln!("Error: cannot open workspace root: {}", e);
                    exit(1);
                }
            };
            let state = AppState {
                manager: Arc::new(manager),
                config: Arc::new(config),
            };
            http_server::run_server(port, state).await;
        }
        Commands::Gateway { port } => {
            gateway::run_gateway(port, Arc::new(config)).await;
        }
    }
}
