//! Kiwi session server.
//!
//! Hosts collaborative patcher sessions over WebSocket. Each session is
//! stored as `<16 hex digits>.kiwi` in the backend directory, loaded when its
//! first user joins and saved when its last user leaves.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kiwi_collab::server::{Server, ServerConfig};
use kiwi_collab::storage::StoreConfig;
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kiwi-server", version, about = "Kiwi collaborative patcher server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9090)]
    port: u16,

    /// Directory holding the session files
    #[arg(long, default_value = "kiwi_sessions")]
    backend_dir: PathBuf,

    /// Token clients must present when opening a session
    #[arg(long, default_value = "kiwi")]
    open_token: String,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        store: StoreConfig {
            directory: args.backend_dir,
            ..StoreConfig::default()
        },
        open_token: args.open_token,
        ..ServerConfig::default()
    };
    info!("Kiwi server {} (model {})", config.kiwi_version, config.model_version);

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };

    let runner = Arc::clone(&server);
    let mut handle = tokio::spawn(async move { runner.run().await });

    let result = tokio::select! {
        finished = &mut handle => finished,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
            server.stop();
            handle.await
        }
    };

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Server error: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("Server task failed: {e}");
            std::process::exit(1);
        }
    }
}
