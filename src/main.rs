use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use log::warn;

use crate::config::Config;
use crate::node::Node;

mod child;
mod codec;
mod config;
mod error;
mod filesend;
mod git;
mod lpd;
mod messages;
mod node;
mod peer;
mod proxy;
mod swarm;
mod tracker;
mod util;

/// Peer-to-peer distribution of git repositories
#[derive(Parser)]
#[clap(about, version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port for the peer listener
    #[arg(short, long)]
    port: Option<u16>,

    /// Peer id to advertise (3-30 chars of [A-Za-z0-9_-])
    #[arg(short = 'i', long)]
    peerid: Option<String>,

    /// Share a local repository; may be given multiple times
    #[arg(short, long)]
    add: Vec<PathBuf>,

    /// Clone a repository from its swarm: <root-commit-sha> <directory>
    #[arg(long, num_args = 2, value_names = ["SHA", "DIR"])]
    clone: Vec<String>,

    /// UDP tracker as host:port
    #[arg(short, long)]
    tracker: Option<String>,

    /// Disable local peer discovery
    #[arg(long, action = ArgAction::SetTrue)]
    no_lpd: bool,

    /// Disable peer exchange
    #[arg(long, action = ArgAction::SetTrue)]
    no_pex: bool,
}

/// Something usable as a peer id, derived from the environment when the
/// user did not pick one.
fn default_peerid() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "peer".to_string());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "node".to_string());

    let mut peerid: String = format!("{}-{}", user, host)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(30)
        .collect();
    if peerid.len() < 3 {
        peerid = "peer".to_string();
    }
    peerid
}

fn valid_peerid(peerid: &str) -> bool {
    (3..=30).contains(&peerid.len())
        && peerid
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn parse_tracker(target: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("tracker {:?} is not host:port", target))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("bad tracker port in {:?}", target))?;
    Ok((host.to_string(), port))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("cannot load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if args.no_pex {
        config.pex = false;
    }

    let peerid = args
        .peerid
        .clone()
        .or_else(|| (!config.default_peerid.is_empty()).then(|| config.default_peerid.clone()))
        .unwrap_or_else(default_peerid);
    if !valid_peerid(&peerid) {
        bail!("invalid peer id {:?}: need 3-30 chars of [A-Za-z0-9_-]", peerid);
    }

    let mut node = Node::new(config.clone(), peerid).await?;

    for directory in &args.add {
        node.add_swarm(directory)
            .with_context(|| format!("cannot share {}", directory.display()))?;
    }
    if let [sha, directory] = args.clone.as_slice() {
        node.clone_swarm(sha.clone(), PathBuf::from(directory))?;
    }

    if !args.no_lpd {
        node.start_lpd();
    }

    let tracker = args
        .tracker
        .clone()
        .or_else(|| (!config.default_tracker.is_empty()).then(|| config.default_tracker.clone()));
    if let Some(target) = tracker {
        match parse_tracker(&target) {
            Ok((host, port)) => node.add_tracker(host, port),
            Err(err) => warn!("{}", err),
        }
    }

    node::spawn_stdin(node.events_tx.clone());
    node.run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peerid_validation() {
        assert!(valid_peerid("alice-x"));
        assert!(valid_peerid("a_1"));
        assert!(!valid_peerid("ab"));
        assert!(!valid_peerid(&"x".repeat(31)));
        assert!(!valid_peerid("has space"));
    }

    #[test]
    fn default_peerid_is_always_valid() {
        assert!(valid_peerid(&default_peerid()));
    }

    #[test]
    fn tracker_address_parsing() {
        assert_eq!(
            parse_tracker("tracker.example.org:6969").unwrap(),
            ("tracker.example.org".to_string(), 6969)
        );
        assert!(parse_tracker("no-port").is_err());
        assert!(parse_tracker("host:notaport").is_err());
    }
}
