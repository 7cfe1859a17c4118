use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use pulsenet_common::auth::Authenticator;
use pulsenet_common::{PulseNetError, ShortNodeId};
use pulsenet_consensus::Power;
use pulsenet_node::{build_runtime, cli::Args, config::Config, keys::load_or_generate_keypair};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let node_name = Path::new(&args.config_path)
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .unwrap_or("node");

    std::panic::set_hook(Box::new(|info| {
        let msg = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<Any>",
            },
        };
        let location = match info.location() {
            Some(l) => format!("at {}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };
        let err_msg = format!("CRASH: {} {}\n", msg, location);
        eprintln!("{}", err_msg);
        let _ = std::fs::write("panic.log", err_msg);
    }));

    let log_filename = format!("logs/consensus-{}.log", node_name);
    let file_appender = tracing_appender::rolling::never(".", log_filename);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let consensus_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() == "consensus"
        }));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pulsenet_node=debug".into()),
        )
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != "consensus"
        }));

    tracing_subscriber::registry()
        .with(consensus_layer)
        .with(stdout_layer)
        .init();

    let auth = Arc::new(load_or_generate_keypair(Path::new(&args.keypair_path))?);

    if args.init {
        let address = args.listen_addr.as_deref().unwrap_or("127.0.0.1:7000");
        let config = Config::single_node(ShortNodeId(1), address, auth.public_key(), "data");
        config.save_to_file(&args.config_path)?;
        info!("Wrote single-node config to {}", args.config_path);
        return Ok(());
    }

    if let Some(joiner_path) = &args.issue_for {
        let config = Config::load_from_file(&args.config_path)?;
        let mut joiner = Config::load_from_file(joiner_path)?;
        let key = args.joiner_key.as_deref().unwrap_or_default();
        let joiner_key = hex::decode(key).map_err(|e| PulseNetError::Config(format!("joiner key: {}", e)))?;
        config.issue_extension_for(&*auth, &mut joiner, joiner_key, Power(args.power))?;
        joiner.save_to_file(joiner_path)?;
        info!("Issued extension for node {} into {}", joiner.node_id, joiner_path);
        return Ok(());
    }

    let mut config = Config::load_from_file(&args.config_path)?;
    if let Some(listen) = args.listen_addr {
        config.listen_addr = listen;
    }
    if args.ephemeral {
        config.consensus.ephemeral = true;
    }
    info!("--- STARTING PULSENET NODE {} ---", config.node_id);
    info!("Config: {}", args.config_path);
    info!("Listen: {}", config.listen_addr);

    let runtime = match build_runtime(config, auth).await {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start node: {}", e);
            return Err(e.into());
        }
    };
    info!("Node started on {}. Press Ctrl+C to stop.", runtime.local_address());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    runtime.shutdown().await;
    Ok(())
}
