use std::net::IpAddr;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::child::{Child, ChildKind};
use crate::codec;
use crate::config::CLIENT_NAME;
use crate::error::{Error, Result};
use crate::filesend::FileSend;
use crate::messages::{Helo, Message};
use crate::node::{Node, PeerToken};
use crate::peer::ChunkSink;
use crate::proxy::ProxyListener;

/// Message handling and session orchestration for one peer: handshake,
/// peer exchange, ref-change propagation, file transfer in both
/// directions, and the clone/fetch/merge children.
impl Node {
    /// Validate, frame, and queue one message. An encoding failure means
    /// we built an invalid message; callers propagate it so the session
    /// closes.
    pub fn send(&self, token: PeerToken, msg: &Message) -> Result<()> {
        let Some(peer) = self.peers.get(&token) else { return Ok(()) };
        let frame = codec::frame(msg, self.config.msg_len_bytes, self.config.msg_max_len)?;
        debug!("{} --> {}", peer, msg.name());
        peer.send_frame(frame);
        Ok(())
    }

    /// Outbound TCP established; the connecting side speaks first.
    pub(super) fn on_connected(&mut self, token: PeerToken) -> Result<()> {
        if let Some(peer) = self.peers.get_mut(&token) {
            info!("{} connected", peer);
            let now = Instant::now();
            peer.connected = true;
            peer.last_read = now;
            peer.last_ping = now;
        }
        self.send_helo(token)
    }

    fn send_helo(&self, token: PeerToken) -> Result<()> {
        let Some(peer) = self.peers.get(&token) else { return Ok(()) };
        let Some(swarmid) = peer.swarm.clone() else { return Ok(()) };

        self.send(
            token,
            &Message::Helo(Helo {
                peerid: self.peerid.clone(),
                swarmid,
                port: self.listen_port,
                client: CLIENT_NAME.to_string(),
            }),
        )
    }

    pub(super) fn on_frame(&mut self, token: PeerToken, msg: Message) -> Result<()> {
        match self.peers.get_mut(&token) {
            Some(peer) => {
                peer.last_read = Instant::now();
                debug!("{} <-- {}", peer, msg.name());
            }
            None => return Ok(()),
        }

        match msg {
            Message::Helo(helo) => self.on_helo(token, helo),
            Message::Ping => self.send(token, &Message::Pong),
            Message::Pong => Ok(()),
            Message::PexRequest => self.on_pex_request(token),
            Message::Pex { peerid, ip, port } => self.on_pex(token, peerid, ip, port),
            Message::RefChange => {
                self.do_fetch(token);
                Ok(())
            }
            Message::FileGet { file, id } => self.on_file_get(token, file, id),
            Message::FileDat { id, chunk, buf } => self.on_file_dat(token, id, chunk, buf),
            Message::FileAck { id, chunk } => self.on_file_ack(token, id, chunk),
            Message::FileCancel { id } => self.on_file_cancel(token, id),
        }
    }

    fn on_helo(&mut self, token: PeerToken, helo: Helo) -> Result<()> {
        let (inbound, addr) = match self.peers.get_mut(&token) {
            Some(peer) => {
                peer.remote_peerid = Some(helo.peerid.clone());
                peer.advertised_port = helo.port;
                (peer.inbound, peer.addr)
            }
            None => return Ok(()),
        };

        // Inbound sessions pick their swarm from the handshake.
        if inbound {
            if !self.swarms.contains_key(&helo.swarmid) {
                info!("{} announced unknown swarm {}", addr, helo.swarmid);
                self.close_peer(token, "unknown swarm");
                return Ok(());
            }
            if let Some(peer) = self.peers.get_mut(&token) {
                peer.swarm = Some(helo.swarmid.clone());
            }
            let dampen_time = Duration::from_secs(self.config.dampen_time);
            if let Some(swarm) = self.swarms.get_mut(&helo.swarmid) {
                swarm.add_peer(token, addr, true, dampen_time);
            }
            self.send_helo(token)?;
        }

        let Some(sha) = self.peers.get(&token).and_then(|p| p.swarm.clone()) else {
            self.close_peer(token, "no swarm");
            return Ok(());
        };

        // The loopback test comes after the swarm step, so our helo has
        // already gone out and the remote side can record the loopback
        // address it used, too.
        if helo.peerid == self.peerid {
            info!("loopback peer detected at {}", addr);
            if !inbound {
                if let Some(swarm) = self.swarms.get_mut(&sha) {
                    swarm.loops.insert(addr);
                }
            }
            self.close_peer(token, "loopback");
            return Ok(());
        }

        if !inbound {
            if let Some(swarm) = self.swarms.get_mut(&sha) {
                swarm.aka.insert(addr, helo.peerid.clone());
            }
        }

        // One session per remote peer id and swarm; the newer one loses.
        let duplicate = self.swarms.get(&sha).map_or(false, |swarm| {
            swarm.peers.iter().any(|t| {
                *t != token
                    && self
                        .peers
                        .get(t)
                        .map_or(false, |p| p.remote_peerid.as_deref() == Some(helo.peerid.as_str()))
            })
        });
        if duplicate {
            info!("already have a connection to {}", helo.peerid);
            self.close_peer(token, "duplicate peer");
            return Ok(());
        }

        // Introduce the newcomer and the established peers to each other.
        if self.config.pex {
            let new_ip = match addr.ip() {
                IpAddr::V4(ip) => Some(ip.to_string()),
                IpAddr::V6(_) => None,
            };
            let mut outgoing: Vec<(PeerToken, Message)> = Vec::new();
            if let Some(swarm) = self.swarms.get(&sha) {
                for t in &swarm.peers {
                    if *t == token {
                        continue;
                    }
                    let Some(other) = self.peers.get(t) else { continue };
                    if !other.negotiated {
                        continue;
                    }
                    let Some(other_peerid) = other.remote_peerid.clone() else { continue };

                    if let Some(ip) = &new_ip {
                        outgoing.push((
                            *t,
                            Message::Pex {
                                peerid: helo.peerid.clone(),
                                ip: ip.clone(),
                                port: helo.port,
                            },
                        ));
                    }
                    if let IpAddr::V4(other_ip) = other.addr.ip() {
                        outgoing.push((
                            token,
                            Message::Pex {
                                peerid: other_peerid,
                                ip: other_ip.to_string(),
                                port: other.advertised_port,
                            },
                        ));
                    }
                }
            }
            for (t, msg) in outgoing {
                let _ = self.send(t, &msg);
            }
        }

        if let Some(peer) = self.peers.get_mut(&token) {
            peer.negotiated = true;
            info!("{} handshake complete", peer);
        }
        self.check_refs(token, false);
        Ok(())
    }

    fn on_pex_request(&mut self, token: PeerToken) -> Result<()> {
        if !self.config.pex {
            return Ok(());
        }
        let Some(peer) = self.peers.get(&token) else { return Ok(()) };
        let requester = peer.remote_peerid.clone();
        let Some(sha) = peer.swarm.clone() else { return Ok(()) };
        let Some(swarm) = self.swarms.get(&sha) else { return Ok(()) };

        let replies: Vec<Message> = swarm
            .peers
            .iter()
            .filter(|t| **t != token)
            .filter_map(|t| self.peers.get(t))
            .filter(|p| p.negotiated && p.remote_peerid.is_some() && p.remote_peerid != requester)
            .filter_map(|p| match p.addr.ip() {
                IpAddr::V4(ip) => Some(Message::Pex {
                    peerid: p.remote_peerid.clone().expect("filtered above"),
                    ip: ip.to_string(),
                    port: p.advertised_port,
                }),
                IpAddr::V6(_) => None,
            })
            .collect();

        for msg in replies {
            self.send(token, &msg)?;
        }
        Ok(())
    }

    fn on_pex(&mut self, token: PeerToken, peerid: String, ip: String, port: u16) -> Result<()> {
        if !self.config.pex {
            return Ok(());
        }
        let Some(sha) = self.peers.get(&token).and_then(|p| p.swarm.clone()) else {
            return Ok(());
        };
        let Ok(addr) = format!("{}:{}", ip, port).parse() else { return Ok(()) };
        self.connect(&sha, addr, Some(&peerid));
        Ok(())
    }

    /// Rate-limited comparison of the local refs signature; a change
    /// refreshes the dumb-protocol files and notifies the peer. With
    /// `update_only` the new signature is recorded silently, e.g. right
    /// after a clone when the peer by definition has everything.
    pub(super) fn check_refs(&mut self, token: PeerToken, update_only: bool) {
        let now = Instant::now();
        let interval = Duration::from_secs(self.config.ref_check_interval);

        let Some(peer) = self.peers.get_mut(&token) else { return };
        if !peer.negotiated {
            return;
        }
        let Some(sha) = peer.swarm.clone() else { return };
        let Some(swarm) = self.swarms.get(&sha) else { return };
        if swarm.cloning {
            return;
        }
        if peer
            .last_refs_check
            .map_or(false, |t| now.duration_since(t) <= interval)
        {
            return;
        }
        peer.last_refs_check = Some(now);

        let Some(git) = swarm.git.as_ref() else { return };
        let sig = git.refs_signature();
        if peer.refs_sig == sig {
            return;
        }
        peer.refs_sig = sig;

        if update_only {
            return;
        }
        if let Err(err) = git.update_server_info() {
            warn!("update-server-info failed: {}", err);
        }
        if let Err(err) = self.send(token, &Message::RefChange) {
            self.close_peer(token, &err.to_string());
        }
    }

    /// Take responsibility for the swarm's initial clone: point a fresh
    /// proxy at this peer and run `git clone` through it.
    pub(super) fn do_clone(&mut self, token: PeerToken) {
        let Some(peer) = self.peers.get(&token) else { return };
        let Some(remote) = peer.remote_peerid.clone() else { return };
        let directory = peer
            .swarm
            .as_ref()
            .and_then(|sha| self.swarms.get(sha))
            .map(|s| s.directory.clone());
        let Some(directory) = directory else { return };

        let proxy = match ProxyListener::start(token, &self.config, self.events_tx.clone()) {
            Ok(proxy) => proxy,
            Err(err) => {
                error!("cannot start proxy for clone: {}", err);
                self.close_peer(token, "proxy failed");
                return;
            }
        };

        let argv = vec![
            "git".to_string(),
            "clone".to_string(),
            "--verbose".to_string(),
            "--origin".to_string(),
            format!("p2p-{}", remote),
            format!("p2p://{}", remote),
            directory.to_string_lossy().into_owned(),
        ];
        self.start_child(token, ChildKind::Clone, remote, argv, proxy);
    }

    pub(super) fn do_fetch(&mut self, token: PeerToken) {
        let Some(peer) = self.peers.get(&token) else { return };
        if !peer.negotiated {
            info!("{} cannot fetch, connection not negotiated", peer);
            return;
        }
        if let Some(child) = &peer.child {
            info!("{} git {} already in progress, cannot fetch", peer, child.kind);
            return;
        }
        let Some(remote) = peer.remote_peerid.clone() else { return };
        let Some(swarm) = peer.swarm.as_ref().and_then(|sha| self.swarms.get(sha)) else {
            return;
        };
        if swarm.cloning {
            info!("cloning, cannot fetch from {}", remote);
            return;
        }
        let directory = swarm.directory.clone();

        if let Some(git) = swarm.git.as_ref() {
            if let Err(err) = git.add_remote(&remote) {
                warn!("cannot add remote for {}: {}", remote, err);
                return;
            }
        }

        let proxy = match ProxyListener::start(token, &self.config, self.events_tx.clone()) {
            Ok(proxy) => proxy,
            Err(err) => {
                error!("cannot start proxy for fetch: {}", err);
                return;
            }
        };

        let mut argv = vec![
            "git".to_string(),
            "-C".to_string(),
            directory.to_string_lossy().into_owned(),
            "fetch".to_string(),
            "--verbose".to_string(),
            "--prune".to_string(),
            "--progress".to_string(),
            format!("p2p-{}", remote),
        ];
        if !self.config.prune {
            argv.retain(|arg| arg != "--prune");
        }
        self.start_child(token, ChildKind::Fetch, remote, argv, proxy);
    }

    pub(super) fn do_merge(&mut self, token: PeerToken) {
        let Some(peer) = self.peers.get(&token) else { return };
        if let Some(child) = &peer.child {
            info!("{} git {} already in progress, cannot merge", peer, child.kind);
            return;
        }
        let Some(remote) = peer.remote_peerid.clone() else { return };
        let Some(swarm) = peer.swarm.as_ref().and_then(|sha| self.swarms.get(sha)) else {
            return;
        };
        if swarm.cloning {
            info!("cloning, cannot merge from {}", remote);
            return;
        }

        let branch = match swarm.git.as_ref().and_then(|git| git.branch()) {
            Some(branch) => branch,
            None => {
                info!("could not determine branch, not merging");
                return;
            }
        };

        // The checked out branch could change between the probe above and
        // the merge below. Life is not without risk; may the reflog save
        // us all.

        let proxy = match ProxyListener::start(token, &self.config, self.events_tx.clone()) {
            Ok(proxy) => proxy,
            Err(err) => {
                error!("cannot start proxy for merge: {}", err);
                return;
            }
        };

        let argv = vec![
            "git".to_string(),
            "-C".to_string(),
            swarm.directory.to_string_lossy().into_owned(),
            "merge".to_string(),
            "--verbose".to_string(),
            "--ff-only".to_string(),
            format!("p2p-{}/{}", remote, branch),
        ];
        self.start_child(token, ChildKind::Merge, remote, argv, proxy);
    }

    fn start_child(
        &mut self,
        token: PeerToken,
        kind: ChildKind,
        tag: String,
        argv: Vec<String>,
        proxy: ProxyListener,
    ) {
        match Child::spawn(token, kind, tag, argv, proxy.env(), self.events_tx.clone()) {
            Ok(child) => {
                if let Some(peer) = self.peers.get_mut(&token) {
                    peer.child = Some(child);
                    peer.proxy = Some(proxy);
                } else {
                    child.close();
                    proxy.close();
                }
            }
            Err(err) => {
                error!("failed to spawn git {}: {}", kind, err);
                proxy.close();
                if kind == ChildKind::Clone {
                    self.close_peer(token, "clone spawn failed");
                }
            }
        }
    }

    /// A supervised child finished. Its proxy is always torn down; what
    /// happens next depends on what the child was doing.
    pub(super) fn on_child_exit(&mut self, token: PeerToken, kind: ChildKind, code: i32) {
        let Some(peer) = self.peers.get_mut(&token) else { return };
        peer.child = None;
        if let Some(proxy) = peer.proxy.take() {
            proxy.close();
        }
        let was_cloning = peer.cloning;
        let sha = peer.swarm.clone();

        match kind {
            ChildKind::Clone => {
                if !was_cloning {
                    warn!("clone child finished for a peer that was not cloning?");
                    return;
                }
                if code != 0 {
                    let err = Error::Orchestration {
                        command: "git clone".to_string(),
                        code,
                    };
                    error!("{}", err);
                    self.close_peer(token, &err.to_string());
                    return;
                }
                let Some(sha) = sha else { return };
                match self.swarms.get_mut(&sha).map(|s| s.clone_done()) {
                    Some(Ok(())) => {
                        info!("clone done");
                        let members = self
                            .swarms
                            .get(&sha)
                            .map(|s| s.peers.clone())
                            .unwrap_or_default();
                        for t in members {
                            if let Some(p) = self.peers.get_mut(&t) {
                                p.cloning = false;
                            }
                        }
                        self.check_refs(token, true);
                        self.lpd_update();
                    }
                    Some(Err(err)) => {
                        error!("clone finished but repository is unusable: {}", err);
                        self.close_peer(token, "clone failed");
                    }
                    None => {}
                }
            }
            ChildKind::Fetch => {
                if code != 0 {
                    warn!(
                        "{}",
                        Error::Orchestration {
                            command: "git fetch".to_string(),
                            code,
                        }
                    );
                } else if self.config.automerge {
                    info!("fetch done, now merging");
                    self.do_merge(token);
                } else {
                    info!("fetch done");
                }
            }
            ChildKind::Merge => {
                if code != 0 {
                    warn!(
                        "{}",
                        Error::Orchestration {
                            command: "git merge".to_string(),
                            code,
                        }
                    );
                } else {
                    info!("merge done");
                }
            }
        }
    }

    //
    // Sending files
    //

    fn on_file_get(&mut self, token: PeerToken, file: String, id: i64) -> Result<()> {
        let Some(peer) = self.peers.get(&token) else { return Ok(()) };
        if peer.sending.contains_key(&id) {
            return Err(Error::protocol(format!("duplicate file_get id {}", id)));
        }

        let directory = peer
            .swarm
            .as_ref()
            .and_then(|sha| self.swarms.get(sha))
            .map(|s| s.directory.clone());

        let eof = Message::FileDat {
            id,
            chunk: 0,
            buf: Vec::new(),
        };
        let Some(directory) = directory else {
            return self.send(token, &eof);
        };

        let mut send = match FileSend::open(
            &directory,
            &file,
            id,
            self.config.file_get_chunk_size,
            self.config.file_get_window,
        ) {
            Ok(send) => send,
            Err(err) => {
                info!("open failed for {:?}: {}", file, err);
                return self.send(token, &eof);
            }
        };

        // Seed the pipeline: a virtual ack of chunk 0 sends the first
        // window.
        let result = send.on_ack(0)?;
        if !result.done {
            if let Some(peer) = self.peers.get_mut(&token) {
                peer.sending.insert(id, send);
            }
        }
        for msg in &result.messages {
            self.send(token, msg)?;
        }
        Ok(())
    }

    fn on_file_ack(&mut self, token: PeerToken, id: i64, chunk: i64) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&token) else { return Ok(()) };
        let Some(send) = peer.sending.get_mut(&id) else {
            // Chunk 0 is the error-path EOF we never record; acks for it
            // are expected noise.
            if chunk != 0 {
                debug!("file_ack for non-existent sender {}", id);
            }
            return Ok(());
        };

        let result = send.on_ack(chunk)?;
        if result.done {
            peer.sending.remove(&id);
        }
        for msg in &result.messages {
            self.send(token, msg)?;
        }
        Ok(())
    }

    fn on_file_cancel(&mut self, token: PeerToken, id: i64) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&token) else { return Ok(()) };
        if peer.sending.remove(&id).is_none() {
            debug!("file_cancel for non-existent sender {}", id);
        }
        Ok(())
    }

    //
    // Receiving files
    //

    /// A proxied HTTP request (or the console) wants a file: allocate a
    /// request id, remember where the chunks go, and ask the remote peer.
    pub(super) fn on_proxy_request(
        &mut self,
        token: PeerToken,
        file: String,
        sink: ChunkSink,
        id_reply: oneshot::Sender<i64>,
    ) -> Result<()> {
        // If the peer is gone the sink is dropped, which the requester
        // sees as a closed channel.
        let Some(peer) = self.peers.get_mut(&token) else { return Ok(()) };
        let id = peer.next_request_id;
        peer.next_request_id += 1;
        peer.requests.insert(id, sink);
        let _ = id_reply.send(id);

        self.send(token, &Message::FileGet { file, id })
    }

    pub(super) fn on_proxy_closed(
        &mut self,
        token: PeerToken,
        id: i64,
        cancel: bool,
    ) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&token) else { return Ok(()) };
        if peer.requests.remove(&id).is_none() {
            debug!("proxy_close for unknown request {}", id);
            return Ok(());
        }
        if cancel {
            self.send(token, &Message::FileCancel { id })?;
        }
        Ok(())
    }

    fn on_file_dat(&mut self, token: PeerToken, id: i64, chunk: i64, buf: Vec<u8>) -> Result<()> {
        let Some(peer) = self.peers.get_mut(&token) else { return Ok(()) };
        let Some(sink) = peer.requests.get(&id) else {
            debug!("no requester found for file data id {}", id);
            return Ok(());
        };

        if sink.send(buf).is_ok() {
            self.send(token, &Message::FileAck { id, chunk })
        } else {
            warn!("requester for id {} failed to take data, cancelling", id);
            peer.requests.remove(&id);
            self.send(token, &Message::FileCancel { id })
        }
    }

    /// Console fetch without an HTTP client: pull a file over the session
    /// and line-log it.
    pub(super) fn debug_get(&mut self, token: PeerToken, file: String) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let Some(peer) = self.peers.get_mut(&token) else { return };
        let id = peer.next_request_id;
        peer.next_request_id += 1;
        peer.requests.insert(id, tx);

        if let Err(err) = self.send(token, &Message::FileGet { file: file.clone(), id }) {
            error!("{}", err);
            self.close_peer(token, &err.to_string());
            return;
        }

        tokio::spawn(async move {
            let mut bytes = 0usize;
            while let Some(buf) = rx.recv().await {
                if buf.is_empty() {
                    if bytes > 0 {
                        info!("get {:?}: EOF after {} bytes", file, bytes);
                    } else {
                        info!("get {:?}: not found, empty, or rejected", file);
                    }
                    return;
                }
                bytes += buf.len();
                for line in String::from_utf8_lossy(&buf).lines() {
                    info!("get {:?}: {}", file, line);
                }
            }
        });
    }
}
