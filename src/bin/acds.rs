//! The ACDS discovery server binary.
//!
//! Runs the rendezvous listener and, optionally, the stage-3 relay
//! listener. State is purely in memory; restarting the server only
//! forgets sessions whose keepalives would have expired anyway.

use acip::crypto::{Identity, KeySource, LoadedKey};
use acip::discovery::AcdsServer;
use acip::policy::Policy;
use acip::types::exit_code;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "acds", version, about = "ACIP discovery / rendezvous server")]
struct Args {
    /// Discovery listener address
    #[arg(short, long, default_value = "0.0.0.0:7337")]
    listen: SocketAddr,

    /// Relay listener address (stage-3 fallback); disabled when absent
    #[arg(long)]
    relay_listen: Option<SocketAddr>,

    /// Server identity key source; clients verify it out of band
    #[arg(short, long)]
    key: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("acip=info".parse().expect("static directive")),
        )
        .init();

    let args = Args::parse();

    let identity = match load_identity(args.key.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            error!("{e}");
            std::process::exit(exit_code::CONFIG_INVALID);
        }
    };
    match &identity {
        Some(id) => info!("server identity: {}", id.fingerprint()),
        None => info!("running without an identity key; clients cannot verify this server"),
    }

    let listener = match TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {}: {e}", args.listen);
            std::process::exit(exit_code::NETWORK_UNREACHABLE);
        }
    };
    info!("discovery listening on {}", args.listen);

    if let Some(relay_addr) = args.relay_listen {
        match TcpListener::bind(relay_addr).await {
            Ok(relay_listener) => {
                info!("relay listening on {relay_addr}");
                tokio::spawn(acip::discovery::run_relay(relay_listener));
            }
            Err(e) => {
                error!("cannot bind relay {relay_addr}: {e}");
                std::process::exit(exit_code::NETWORK_UNREACHABLE);
            }
        }
    }

    let server = Arc::new(AcdsServer::new(identity));
    tokio::select! {
        result = server.run(listener) => {
            if let Err(e) = result {
                error!("server stopped: {e}");
                std::process::exit(exit_code::FAILURE);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}

async fn load_identity(uri: Option<&str>) -> Result<Option<Arc<Identity>>, String> {
    let Some(uri) = uri else { return Ok(None) };
    let source = KeySource::parse(uri).map_err(|e| e.to_string())?;
    let passphrase = Policy::key_password();
    match source.load(passphrase.as_deref()).await {
        Ok(LoadedKey::Full(identity)) => Ok(Some(Arc::new(identity))),
        Ok(LoadedKey::PublicOnly(_)) => {
            Err(format!("{uri} yields a public-only key; the server must sign pings"))
        }
        Err(e) => Err(format!("cannot load {uri}: {e}")),
    }
}
