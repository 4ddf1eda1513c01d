use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::git::Git;
use crate::node::PeerToken;
use crate::util::short_sha;

/// One shared repository and the peers distributing it. Keeps the
/// short-term bookkeeping that stops us from redialling, connecting to
/// ourselves, or holding two sessions to the same peer.
#[derive(Debug)]
pub struct Swarm {
    /// Root commit of the repository; the swarm's identity.
    pub sha: String,
    pub directory: PathBuf,
    /// Absent while the initial clone is still running.
    pub git: Option<Git>,
    /// Created in clone mode and not yet cloned.
    pub cloning: bool,
    pub peers: Vec<PeerToken>,
    /// Outbound addresses not to be redialled until the deadline passes.
    pub dampen: HashMap<SocketAddr, Instant>,
    /// Addresses recently seen to belong to a given peer id.
    pub aka: HashMap<SocketAddr, String>,
    /// Addresses known to loop back to ourselves.
    pub loops: HashSet<SocketAddr>,
}

impl Swarm {
    /// Open an existing local repository; its root commit becomes the
    /// swarm id.
    pub fn open(directory: &Path) -> Result<Swarm> {
        let git = Git::open(directory)?;
        let sha = git
            .root
            .clone()
            .ok_or_else(|| Error::Git(format!("{} has no root commit", directory.display())))?;

        Ok(Swarm {
            sha,
            directory: directory.to_path_buf(),
            git: Some(git),
            cloning: false,
            peers: Vec::new(),
            dampen: HashMap::new(),
            aka: HashMap::new(),
            loops: HashSet::new(),
        })
    }

    /// A swarm for a repository we do not have yet. The first negotiated
    /// peer will run the clone.
    pub fn for_clone(sha: String, directory: PathBuf) -> Swarm {
        Swarm {
            sha,
            directory,
            git: None,
            cloning: true,
            peers: Vec::new(),
            dampen: HashMap::new(),
            aka: HashMap::new(),
            loops: HashSet::new(),
        }
    }

    pub fn short(&self) -> &str {
        short_sha(&self.sha)
    }

    /// The clone child finished: open the repository and release every
    /// peer's cloning flag (the caller clears the flags, as it owns the
    /// peers).
    pub fn clone_done(&mut self) -> Result<()> {
        self.git = Some(Git::open(&self.directory)?);
        self.cloning = false;
        Ok(())
    }

    /// Heartbeat housekeeping: expire dampened addresses, and forget
    /// aliases whose peer id is no longer connected.
    pub fn expire(&mut self, now: Instant, connected: &HashSet<String>) {
        self.dampen.retain(|addr, deadline| {
            let keep = *deadline > now;
            if !keep {
                debug!("[{}] undampening {}", short_sha(&self.sha), addr);
            }
            keep
        });
        self.aka.retain(|_, peerid| connected.contains(peerid));
    }

    /// Decide whether an outbound dial to `addr` should happen, applying
    /// the dedup, loopback, and dampening rules in order. The caller
    /// constructs the peer when this returns true.
    pub fn should_connect(
        &self,
        addr: SocketAddr,
        peerid: Option<&str>,
        my_peerid: &str,
        connected: &HashSet<String>,
    ) -> bool {
        if let Some(peerid) = peerid {
            if connected.contains(peerid) {
                debug!("[{}] already connected to {:?}", self.short(), peerid);
                return false;
            }
            if peerid == my_peerid {
                debug!("[{}] not going to connect to myself", self.short());
                return false;
            }
        }

        if self.dampen.contains_key(&addr) {
            debug!("[{}] {} is dampened, not connecting", self.short(), addr);
            return false;
        }

        if let Some(known) = self.aka.get(&addr) {
            if connected.contains(known) {
                debug!(
                    "[{}] {} known to be {:?}, already connected",
                    self.short(),
                    addr,
                    known
                );
                return false;
            }
        }

        if self.loops.contains(&addr) {
            debug!("[{}] {} is a loopback address, not connecting", self.short(), addr);
            return false;
        }

        true
    }

    pub fn add_peer(
        &mut self,
        token: PeerToken,
        addr: SocketAddr,
        inbound: bool,
        dampen_time: Duration,
    ) {
        debug_assert!(!self.peers.contains(&token));
        self.peers.push(token);

        if !inbound {
            self.dampen.insert(addr, Instant::now() + dampen_time);
        }

        if self.cloning {
            info!("[{}] peer is a candidate for cloning", self.short());
        }
    }

    pub fn remove_peer(&mut self, token: PeerToken) {
        self.peers.retain(|t| *t != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_swarm() -> Swarm {
        Swarm::for_clone("a".repeat(40), PathBuf::from("/tmp/repo"))
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn connect_rejects_connected_peerid() {
        let swarm = bare_swarm();
        let connected: HashSet<String> = ["bob-y".to_string()].into();
        assert!(!swarm.should_connect(addr(7000), Some("bob-y"), "alice-x", &connected));
        assert!(swarm.should_connect(addr(7000), Some("carol-z"), "alice-x", &connected));
    }

    #[test]
    fn connect_rejects_own_peerid() {
        let swarm = bare_swarm();
        assert!(!swarm.should_connect(addr(7000), Some("alice-x"), "alice-x", &HashSet::new()));
    }

    #[test]
    fn connect_respects_dampen_aka_loops() {
        let mut swarm = bare_swarm();
        let connected: HashSet<String> = ["bob-y".to_string()].into();

        swarm.dampen.insert(addr(1), Instant::now() + Duration::from_secs(25));
        assert!(!swarm.should_connect(addr(1), None, "alice-x", &connected));

        swarm.aka.insert(addr(2), "bob-y".to_string());
        assert!(!swarm.should_connect(addr(2), None, "alice-x", &connected));

        // An alias whose peer is gone does not block the dial.
        swarm.aka.insert(addr(3), "gone-peer".to_string());
        assert!(swarm.should_connect(addr(3), None, "alice-x", &connected));

        swarm.loops.insert(addr(4));
        assert!(!swarm.should_connect(addr(4), None, "alice-x", &connected));
    }

    #[test]
    fn dial_then_dial_again_is_dampened() {
        let mut swarm = bare_swarm();
        let target = addr(7000);
        assert!(swarm.should_connect(target, None, "alice-x", &HashSet::new()));
        swarm.add_peer(1, target, false, Duration::from_secs(25));
        assert!(!swarm.should_connect(target, None, "alice-x", &HashSet::new()));
    }

    #[test]
    fn add_then_remove_restores_peer_set() {
        let mut swarm = bare_swarm();
        let before = swarm.peers.clone();
        swarm.add_peer(7, addr(7000), true, Duration::from_secs(25));
        swarm.remove_peer(7);
        assert_eq!(swarm.peers, before);
    }

    #[test]
    fn expire_drops_stale_entries() {
        let mut swarm = bare_swarm();
        let now = Instant::now();
        swarm.dampen.insert(addr(1), now - Duration::from_secs(1));
        swarm.dampen.insert(addr(2), now + Duration::from_secs(30));
        swarm.aka.insert(addr(3), "gone-peer".to_string());
        swarm.aka.insert(addr(4), "bob-y".to_string());

        let connected: HashSet<String> = ["bob-y".to_string()].into();
        swarm.expire(now, &connected);

        assert!(!swarm.dampen.contains_key(&addr(1)));
        assert!(swarm.dampen.contains_key(&addr(2)));
        assert!(!swarm.aka.contains_key(&addr(3)));
        assert!(swarm.aka.contains_key(&addr(4)));
    }
}
