//! camlink - Main entry point
//!
//! Streams a local camera to the viewer whose signaling endpoint was last
//! scanned, reconnecting while it is unreachable.

mod args;

use args::Args;
use camlink_core::capture::build_media_source;
use camlink_core::config::{Config, EndpointAddress, EndpointStore};
use camlink_core::session::Orchestrator;
use clap::Parser;
use log::{debug, error, info, warn};
use std::env;
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        loaded.as_ref().map(|c| c.logging.level.clone()).unwrap_or_else(|_| "info".to_string())
    };
    env_logger::Builder::new()
        .parse_filters(&env::var("CAMLINK_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("camlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    config.validate()?;

    let store = EndpointStore::new(config.endpoint_store.path.clone());

    if let Some(ref url) = args.set_url {
        let address = EndpointAddress::parse(url)?;
        store.save(&address)?;
        return Ok(());
    }

    let mut current = resolve_endpoint(&args, &config, &store)?;

    let media = build_media_source(&config.capture, config.webrtc.video_codec)?;
    info!("Media source: {} ({})", media.name(), media.codec().as_str());
    let mut orchestrator = Orchestrator::from_config(&config, media);

    // Keep the watcher alive for the whole run
    let (_watcher, mut endpoint_updates) = match store.watch() {
        Ok((watcher, updates)) => (Some(watcher), Some(updates)),
        Err(e) => {
            warn!("Endpoint changes will not be picked up: {}", e);
            (None, None)
        }
    };

    match current {
        Some(ref address) => orchestrator.start(address.clone()).await?,
        None => warn!(
            "No signaling endpoint known yet, waiting for {}",
            store.path().display()
        ),
    }

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            Some(next) = next_endpoint(&mut endpoint_updates) => {
                if current.as_ref() == Some(&next) {
                    debug!("Endpoint store rewritten with the same address");
                    continue;
                }
                info!("Signaling endpoint changed to {}", next);
                if let Err(e) = orchestrator.restart(next.clone()).await {
                    error!("Failed to start session for {}: {}", next, e);
                }
                current = Some(next);
            }
        }
    }

    orchestrator.stop().await;
    info!("camlink stopped");
    Ok(())
}

/// Command line override, then the scanned endpoint, then the config file
fn resolve_endpoint(
    args: &Args,
    config: &Config,
    store: &EndpointStore,
) -> Result<Option<EndpointAddress>, Box<dyn std::error::Error>> {
    if let Some(address) = args.url_override()? {
        info!("Using signaling endpoint from command line: {}", address);
        return Ok(Some(address));
    }

    match store.load() {
        Ok(Some(address)) => {
            info!("Using stored signaling endpoint: {}", address);
            return Ok(Some(address));
        }
        Ok(None) => {}
        Err(e) => warn!("{}", e),
    }

    match config.signaling.url {
        Some(ref url) => {
            let address = EndpointAddress::parse(url)?;
            info!("Using signaling endpoint from config: {}", address);
            Ok(Some(address))
        }
        None => Ok(None),
    }
}

async fn next_endpoint(updates: &mut Option<mpsc::UnboundedReceiver<EndpointAddress>>) -> Option<EndpointAddress> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
