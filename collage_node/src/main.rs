// SPDX-License-Identifier: MIT OR Apache-2.0
//! Participant daemon for collage commits.
//!
//! Usage: `collage_node <port> <id>`. Source images live in the data
//! directory; commit proposals touching them are approved or rejected at
//! the terminal. The peer routing table comes from `COLLAGE_PEERS`
//! (`name=host:port,...`) and must contain the coordinator.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use collage_commit::{
    parse_peer_table, Approval, Participant, ParticipantConfig, TcpTransport,
    TcpTransportConfig, Transport,
};

/// Peer routing table environment variable.
const ENV_PEERS: &str = "COLLAGE_PEERS";
/// Data directory environment variable (snapshot log and source images).
const ENV_DATA_DIR: &str = "COLLAGE_DATA_DIR";

/// Terminal y/n prompt for collage approval.
struct TerminalApproval;

impl Approval for TerminalApproval {
    fn ask_user(&self, composite: &[u8], sources: &[String]) -> bool {
        println!(
            "collage commit ({} bytes) wants to consume: {}",
            composite.len(),
            sources.join(", ")
        );
        print!("approve? [y/N] ");
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("collage_commit=info".parse()?)
                .add_directive("collage_node=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        return Err("usage: collage_node <port> <id>".into());
    }
    let port: u16 = args[1].parse()?;
    let node_id = args[2].clone();

    let mut transport_config = TcpTransportConfig::new(
        node_id.clone(),
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
    );
    if let Ok(spec) = std::env::var(ENV_PEERS) {
        transport_config.peers = parse_peer_table(&spec)?;
    }
    let transport = Arc::new(TcpTransport::bind(transport_config)?);

    let mut config = ParticipantConfig::new(node_id.clone());
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        let dir = PathBuf::from(dir);
        config = config
            .with_log_path(dir.join(format!("usernode_{node_id}_log.dat")))
            .with_image_dir(dir);
    }

    let participant = Participant::new(
        config,
        transport as Arc<dyn Transport>,
        Arc::new(TerminalApproval),
    );

    tracing::info!(node_id = %node_id, "participant ready");
    participant.run();
    Ok(())
}
