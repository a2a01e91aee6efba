use anyhow::{bail, Context};
use murmur_core::{logging, Config};
use murmur_identity::{FileSecureStorage, IdentityKeyStore};
use murmur_mesh::PeerRegistry;
use murmur_session::{SessionEstablisher, OFFER_LEN};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
    bundle_len: usize,
    offer_len: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
            bundle_len: murmur_identity::BUNDLE_LEN,
            offer_len: OFFER_LEN,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let mut config = match parse_config_path(&args)? {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default_config(),
    };
    if args.iter().any(|arg| arg == "--log-json") {
        config.logging.json = true;
    }
    logging::init_with(&config.logging);
    config.validate()?;

    let storage = FileSecureStorage::new(config.identity.storage_dir.clone())
        .context("opening secure storage")?;
    let identity = Arc::new(IdentityKeyStore::with_config(
        Arc::new(storage),
        &config.identity,
    ));
    // Without a stable identity no peer can authenticate this device.
    let fingerprint = identity
        .ensure_identity()
        .context("device identity unavailable")?;

    let registry = PeerRegistry::new(config.registry.clone());
    registry.start_sweeper()?;

    let sessions = Arc::new(SessionEstablisher::new(
        identity.clone(),
        config.session.clone(),
    ));
    let listener = sessions.spawn_presence_listener(registry.subscribe());

    tracing::info!(
        fingerprint = %fingerprint,
        stale_after_secs = config.registry.stale_after_secs,
        storage_dir = %config.identity.storage_dir.display(),
        "murmur node started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    tracing::info!("shutting down");
    listener.abort();
    registry.shutdown();
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<Option<PathBuf>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(Some(PathBuf::from(path)));
            }
            bail!("--config was provided without a path");
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_config_path_parsed() {
        let parsed = parse_config_path(&args(&["murmur-node", "--config", "node.toml"])).unwrap();
        assert_eq!(parsed, Some(PathBuf::from("node.toml")));
    }

    #[test]
    fn test_config_path_optional() {
        assert_eq!(parse_config_path(&args(&["murmur-node"])).unwrap(), None);
    }

    #[test]
    fn test_config_flag_without_path() {
        assert!(parse_config_path(&args(&["murmur-node", "--config"])).is_err());
    }
}
