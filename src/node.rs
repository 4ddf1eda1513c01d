use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{debug, info, warn};
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::child::ChildKind;
use crate::config::Config;
use crate::lpd::{self, LpdCommand};
use crate::messages::Message;
use crate::peer::{self, ChunkSink, Peer};
use crate::swarm::Swarm;
use crate::tracker::{self, TrackerCommand};

mod console;
mod session;

pub use console::spawn_stdin;

pub type PeerToken = u64;

/// Everything the io pump tasks, subprocess supervisors, proxies, and
/// discovery tasks report back to the node loop. All registry mutation
/// happens on the loop, in response to these.
#[derive(Debug)]
pub enum NodeEvent {
    /// An outbound TCP connect completed.
    Connected {
        token: PeerToken,
    },
    /// The connection ended: EOF (`reason` empty), a transport error, or a
    /// protocol error raised by the codec.
    Disconnected {
        token: PeerToken,
        reason: Option<String>,
    },
    Frame {
        token: PeerToken,
        msg: Message,
    },
    ChildExit {
        token: PeerToken,
        kind: ChildKind,
        code: i32,
    },
    /// A proxied HTTP request wants `file` fetched over the peer session.
    ProxyRequest {
        token: PeerToken,
        file: String,
        sink: ChunkSink,
        id: oneshot::Sender<i64>,
    },
    /// The HTTP side of a proxied request went away.
    ProxyClosed {
        token: PeerToken,
        id: i64,
        cancel: bool,
    },
    /// LPD or a tracker found a peer for a swarm.
    DiscoveredPeer {
        sha: String,
        addr: SocketAddr,
        peerid: Option<String>,
    },
    Command(String),
    Quit,
}

pub struct TrackerHandle {
    pub host: String,
    pub port: u16,
    pub commands: UnboundedSender<TrackerCommand>,
}

/// The node: owner of every registry and of the single event loop that
/// multiplexes the listener, the heartbeat, and all component events.
pub struct Node {
    pub config: Config,
    pub peerid: String,
    pub listen_port: u16,
    listener: TcpListener,

    pub swarms: HashMap<String, Swarm>,
    pub peers: HashMap<PeerToken, Peer>,
    next_token: PeerToken,

    pub trackers: Vec<TrackerHandle>,
    lpd: Option<UnboundedSender<LpdCommand>>,

    pub events_tx: UnboundedSender<NodeEvent>,
    events_rx: UnboundedReceiver<NodeEvent>,

    console: console::Console,
}

impl Node {
    pub async fn new(config: Config, peerid: String) -> anyhow::Result<Node> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .with_context(|| "unable to bind peer listener")?;
        let listen_port = listener.local_addr()?.port();
        info!("listening on port {}, peer id {:?}", listen_port, peerid);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Node {
            config,
            peerid,
            listen_port,
            listener,
            swarms: HashMap::new(),
            peers: HashMap::new(),
            next_token: 1,
            trackers: Vec::new(),
            lpd: None,
            events_tx,
            events_rx,
            console: console::Console::default(),
        })
    }

    /// Run until the console asks to quit. One iteration handles one
    /// accept, one event, or one heartbeat tick; nothing here blocks.
    pub async fn run(&mut self) {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr),
                    Err(err) => warn!("accept failed: {}", err),
                },
                Some(event) = self.events_rx.recv() => {
                    if !self.on_event(event) {
                        return;
                    }
                }
                _ = heartbeat.tick() => self.on_heartbeat(),
            }
        }
    }

    fn on_accept(&mut self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        if self.peers.len() >= self.config.max_peers {
            warn!("too many peers, refusing connection from {}", addr);
            return;
        }

        let token = self.next_token;
        self.next_token += 1;

        let peer = peer::spawn_inbound(
            token,
            stream,
            addr,
            self.config.msg_len_bytes,
            self.config.msg_max_len,
            self.events_tx.clone(),
        );
        self.peers.insert(token, peer);
    }

    /// Dispatch one event. A handler error is isolated to the peer that
    /// produced it: the peer closes and the loop continues. Returns false
    /// only for the quit request.
    fn on_event(&mut self, event: NodeEvent) -> bool {
        match event {
            NodeEvent::Connected { token } => {
                if let Err(err) = self.on_connected(token) {
                    self.close_peer(token, &err.to_string());
                }
            }
            NodeEvent::Disconnected { token, reason } => {
                self.close_peer(token, reason.as_deref().unwrap_or("EOF"));
            }
            NodeEvent::Frame { token, msg } => {
                if let Err(err) = self.on_frame(token, msg) {
                    self.close_peer(token, &err.to_string());
                }
            }
            NodeEvent::ChildExit { token, kind, code } => {
                self.on_child_exit(token, kind, code);
            }
            NodeEvent::ProxyRequest { token, file, sink, id } => {
                if let Err(err) = self.on_proxy_request(token, file, sink, id) {
                    self.close_peer(token, &err.to_string());
                }
            }
            NodeEvent::ProxyClosed { token, id, cancel } => {
                if let Err(err) = self.on_proxy_closed(token, id, cancel) {
                    self.close_peer(token, &err.to_string());
                }
            }
            NodeEvent::DiscoveredPeer { sha, addr, peerid } => {
                if self.swarms.contains_key(&sha) {
                    self.connect(&sha, addr, peerid.as_deref());
                } else {
                    debug!("discovered peer {} for unknown swarm {}", addr, sha);
                }
            }
            NodeEvent::Command(line) => return self.on_command(&line),
            NodeEvent::Quit => return false,
        }
        true
    }

    /// Roughly once a second: peer timers, swarm table expiry, clone
    /// orchestration, and ref checks.
    fn on_heartbeat(&mut self) {
        let now = Instant::now();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout);
        let helo_timeout = Duration::from_secs(self.config.helo_timeout);
        let idle_timeout = Duration::from_secs(self.config.idle_timeout);
        let idle_ping = Duration::from_secs(self.config.idle_ping);

        let mut to_close: Vec<(PeerToken, &'static str)> = Vec::new();
        let mut to_ping: Vec<PeerToken> = Vec::new();

        for (token, peer) in &mut self.peers {
            if !peer.connected {
                if peer.idle(now) >= connect_timeout {
                    to_close.push((*token, "connect timeout"));
                }
                continue;
            }
            if peer.remote_peerid.is_none() && peer.idle(now) >= helo_timeout {
                to_close.push((*token, "helo timeout"));
                continue;
            }
            if peer.idle(now) >= idle_timeout {
                to_close.push((*token, "idle timeout"));
                continue;
            }

            // Jitter keeps two idle nodes from pinging in lock-step.
            let jitter =
                Duration::from_secs(rand::thread_rng().gen_range(0..=self.config.idle_ping / 2));
            if peer.idle(now) >= idle_ping + jitter && peer.since_ping(now) >= idle_ping {
                peer.last_ping = now;
                to_ping.push(*token);
            }
        }

        for (token, reason) in to_close {
            self.close_peer(token, reason);
        }
        for token in to_ping {
            if let Err(err) = self.send(token, &Message::Ping) {
                self.close_peer(token, &err.to_string());
            }
        }

        let shas: Vec<String> = self.swarms.keys().cloned().collect();

        for sha in &shas {
            let connected = self.connected_peerids(sha);
            if let Some(swarm) = self.swarms.get_mut(sha) {
                swarm.expire(now, &connected);
            }
        }

        // Clone orchestration: the first negotiated peer of a swarm in
        // clone mode takes responsibility, unless somebody already has.
        let mut to_clone: Vec<PeerToken> = Vec::new();
        for sha in &shas {
            let swarm = &self.swarms[sha];
            if !swarm.cloning {
                continue;
            }
            let busy = swarm
                .peers
                .iter()
                .any(|t| self.peers.get(t).map_or(false, |p| p.cloning));
            if busy {
                continue;
            }
            let candidate = swarm.peers.iter().find(|t| {
                self.peers
                    .get(*t)
                    .map_or(false, |p| p.negotiated && p.child.is_none())
            });
            if let Some(token) = candidate {
                to_clone.push(*token);
            }
        }
        for token in to_clone {
            if let Some(peer) = self.peers.get_mut(&token) {
                info!("{} cloning", peer);
                peer.cloning = true;
            }
            self.do_clone(token);
        }

        let tokens: Vec<PeerToken> = self.peers.keys().cloned().collect();
        for token in tokens {
            self.check_refs(token, false);
        }
    }

    /// Remote peer ids currently present in a swarm.
    pub fn connected_peerids(&self, sha: &str) -> HashSet<String> {
        match self.swarms.get(sha) {
            Some(swarm) => swarm
                .peers
                .iter()
                .filter_map(|t| self.peers.get(t))
                .filter_map(|p| p.remote_peerid.clone())
                .collect(),
            None => HashSet::new(),
        }
    }

    /// Dial a peer for a swarm, subject to the swarm's dedup, dampening,
    /// and loopback rules.
    pub fn connect(&mut self, sha: &str, addr: SocketAddr, peerid: Option<&str>) {
        let connected = self.connected_peerids(sha);
        let Some(swarm) = self.swarms.get_mut(sha) else { return };
        if !swarm.should_connect(addr, peerid, &self.peerid, &connected) {
            return;
        }
        if self.peers.len() >= self.config.max_peers {
            warn!("too many peers, not connecting to {}", addr);
            return;
        }

        let token = self.next_token;
        self.next_token += 1;

        let peer = peer::spawn_outbound(
            token,
            addr,
            sha.to_string(),
            self.config.msg_len_bytes,
            self.config.msg_max_len,
            Duration::from_secs(self.config.connect_timeout),
            self.events_tx.clone(),
        );
        swarm.add_peer(token, addr, false, Duration::from_secs(self.config.dampen_time));
        self.peers.insert(token, peer);
    }

    /// Tear down one peer and everything hanging off it: child process,
    /// proxies, transfers in both directions, and the connection itself.
    pub fn close_peer(&mut self, token: PeerToken, reason: &str) {
        let Some(mut peer) = self.peers.remove(&token) else { return };
        info!("{} closing: {}", peer, reason);

        if let Some(sha) = &peer.swarm {
            if let Some(swarm) = self.swarms.get_mut(sha) {
                swarm.remove_peer(token);
            }
        }

        if let Some(proxy) = peer.proxy.take() {
            proxy.close();
        }
        for proxy in peer.debug_proxies.drain(..) {
            proxy.close();
        }
        if let Some(child) = peer.child.take() {
            child.close();
        }

        // Dropping the sinks tells proxied requests their peer is gone;
        // dropping the senders closes the served file handles.
        peer.requests.clear();
        peer.sending.clear();

        peer.close_io();
    }

    pub fn add_swarm(&mut self, directory: &Path) -> crate::error::Result<String> {
        let swarm = Swarm::open(directory)?;
        let sha = swarm.sha.clone();
        self.register_swarm(swarm)?;
        Ok(sha)
    }

    pub fn clone_swarm(
        &mut self,
        sha: String,
        directory: std::path::PathBuf,
    ) -> crate::error::Result<()> {
        let swarm = Swarm::for_clone(sha, directory);
        self.register_swarm(swarm)
    }

    fn register_swarm(&mut self, swarm: Swarm) -> crate::error::Result<()> {
        if self.swarms.contains_key(&swarm.sha) {
            return Err(crate::error::Error::Git(format!(
                "swarm already exists for {}",
                swarm.directory.display()
            )));
        }

        let sha = swarm.sha.clone();
        info!("[{}] registered {}", swarm.short(), swarm.directory.display());
        self.swarms.insert(sha.clone(), swarm);

        if let Some(lpd) = &self.lpd {
            let _ = lpd.send(LpdCommand::AddSwarm(sha.clone()));
        }
        for tracker in &self.trackers {
            let _ = tracker.commands.send(TrackerCommand::AddSwarm(sha.clone()));
        }
        Ok(())
    }

    /// Drop a swarm, closing every one of its peers. The peer list is
    /// snapshotted first: closing mutates it.
    pub fn drop_swarm(&mut self, sha: &str) {
        let Some(swarm) = self.swarms.remove(sha) else { return };
        info!("[{}] dropping (and {} peers)", swarm.short(), swarm.peers.len());

        for token in swarm.peers.clone() {
            self.close_peer(token, "swarm dropped");
        }

        if let Some(lpd) = &self.lpd {
            let _ = lpd.send(LpdCommand::RemoveSwarm(sha.to_string()));
        }
        for tracker in &self.trackers {
            let _ = tracker.commands.send(TrackerCommand::RemoveSwarm(sha.to_string()));
        }
    }

    pub fn start_lpd(&mut self) {
        if self.lpd.is_some() {
            return;
        }
        let commands = lpd::spawn(
            &self.config,
            self.peerid.clone(),
            self.listen_port,
            self.events_tx.clone(),
        );
        for sha in self.swarms.keys() {
            let _ = commands.send(LpdCommand::AddSwarm(sha.clone()));
        }
        self.lpd = Some(commands);
    }

    pub fn lpd_update(&self) {
        if let Some(lpd) = &self.lpd {
            let _ = lpd.send(LpdCommand::Update);
        }
    }

    pub fn add_tracker(&mut self, host: String, port: u16) {
        if self.trackers.iter().any(|t| t.host == host && t.port == port) {
            warn!("tracker already exists for {}:{}", host, port);
            return;
        }

        let commands = tracker::spawn(
            host.clone(),
            port,
            self.listen_port,
            self.peerid.clone(),
            &self.config,
            self.events_tx.clone(),
        );
        for sha in self.swarms.keys() {
            let _ = commands.send(TrackerCommand::AddSwarm(sha.clone()));
        }
        self.trackers.push(TrackerHandle { host, port, commands });
    }
}
