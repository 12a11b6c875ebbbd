// SPDX-License-Identifier: MIT OR Apache-2.0
//! Coordinator daemon for collage commits.
//!
//! Usage: `collage_server <port>`. Commit proposals arrive on stdin as
//! `<filename> <image-path> <source>...` lines, standing in for the
//! upstream originator. The peer routing table comes from `COLLAGE_PEERS`
//! (`name=host:port,...`).

use std::io::BufRead;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use collage_commit::{
    parse_peer_table, Coordinator, CoordinatorConfig, RetryEngine, TcpTransport,
    TcpTransportConfig, Transport,
};

/// Node name environment variable.
const ENV_NODE_ID: &str = "COLLAGE_NODE_ID";
/// Peer routing table environment variable.
const ENV_PEERS: &str = "COLLAGE_PEERS";
/// Data directory environment variable (snapshot log and composites).
const ENV_DATA_DIR: &str = "COLLAGE_DATA_DIR";
/// PREPARE deadline override, milliseconds.
const ENV_PREPARE_TIMEOUT_MS: &str = "COLLAGE_PREPARE_TIMEOUT_MS";
/// Decision heartbeat override, milliseconds.
const ENV_RESEND_INTERVAL_MS: &str = "COLLAGE_RESEND_INTERVAL_MS";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("collage_commit=info".parse()?)
                .add_directive("collage_server=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        return Err("usage: collage_server <port>".into());
    }
    let port: u16 = args[1].parse()?;

    let node_id = std::env::var(ENV_NODE_ID).unwrap_or_else(|_| "server".to_string());
    let mut transport_config = TcpTransportConfig::new(
        node_id,
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
    );
    if let Ok(spec) = std::env::var(ENV_PEERS) {
        transport_config.peers = parse_peer_table(&spec)?;
    }
    let transport = Arc::new(TcpTransport::bind(transport_config)?);

    let mut config = CoordinatorConfig::default();
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        let dir = PathBuf::from(dir);
        config = config
            .with_log_path(dir.join("server_log.dat"))
            .with_image_dir(dir);
    }
    if let Ok(ms) = std::env::var(ENV_PREPARE_TIMEOUT_MS) {
        config = config.with_prepare_timeout(Duration::from_millis(ms.parse()?));
    }
    if let Ok(ms) = std::env::var(ENV_RESEND_INTERVAL_MS) {
        config = config.with_resend_interval(Duration::from_millis(ms.parse()?));
    }

    let coordinator = Arc::new(Coordinator::new(config, transport as Arc<dyn Transport>)?);
    let _retry = RetryEngine::start(Arc::clone(&coordinator));

    // Originator stand-in: one proposal per stdin line.
    let originator = Arc::clone(&coordinator);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 2 {
                tracing::warn!(line = %line, "proposal needs: <filename> <image-path> <source>...");
                continue;
            }
            let composite = match std::fs::read(fields[1]) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %fields[1], error = %e, "cannot read composite image");
                    continue;
                },
            };
            let sources: Vec<String> = fields[2..].iter().map(|s| s.to_string()).collect();
            match originator.start_commit(fields[0], composite, &sources) {
                Ok(txn_id) => {
                    tracing::info!(txn_id = %txn_id, file = %fields[0], "proposal accepted");
                },
                Err(e) => tracing::error!(file = %fields[0], error = %e, "proposal failed"),
            }
        }
    });

    coordinator.run();
    Ok(())
}
