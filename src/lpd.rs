use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::config::Config;
use crate::node::NodeEvent;
use crate::util::my_ip;

/// Seconds between multicast announcements of each swarm.
const ANNOUNCE_TIME: Duration = Duration::from_secs(600);
/// Seconds between attempts to reopen a failed socket.
const SOCK_ATTEMPT_TIME: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum LpdCommand {
    AddSwarm(String),
    RemoveSwarm(String),
    /// Announce on the next heartbeat regardless of the interval.
    Update,
}

/// Local peer discovery over UDP multicast. Socket errors are expected
/// here (network flaps, suspend/resume); the socket is dropped and
/// reopened on a timer rather than treated as fatal.
struct Lpd {
    group: Ipv4Addr,
    port: u16,
    listen_port: u16,
    peerid: String,
    swarms: HashSet<String>,
    sock: Option<Arc<UdpSocket>>,
    last_announce: Option<Instant>,
    last_sock_attempt: Option<Instant>,
}

pub fn spawn(
    config: &Config,
    peerid: String,
    listen_port: u16,
    events: UnboundedSender<NodeEvent>,
) -> UnboundedSender<LpdCommand> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut lpd = Lpd {
        group: config
            .mcast_grp
            .parse()
            .unwrap_or(Ipv4Addr::new(239, 192, 152, 143)),
        port: config.mcast_port,
        listen_port,
        peerid,
        swarms: HashSet::new(),
        sock: None,
        last_announce: None,
        last_sock_attempt: None,
    };

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        loop {
            let sock = lpd.sock.clone();
            tokio::select! {
                _ = heartbeat.tick() => lpd.on_heartbeat().await,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => lpd.on_command(cmd).await,
                    None => return,
                },
                received = recv_datagram(sock) => lpd.on_datagram(received, &events),
            }
        }
    });

    tx
}

async fn recv_datagram(sock: Option<Arc<UdpSocket>>) -> io::Result<(Vec<u8>, SocketAddr)> {
    match sock {
        Some(sock) => {
            let mut buf = [0u8; 1024];
            let (n, from) = sock.recv_from(&mut buf).await?;
            Ok((buf[..n].to_vec(), from))
        }
        None => std::future::pending().await,
    }
}

impl Lpd {
    async fn on_heartbeat(&mut self) {
        if self.sock.is_none() {
            self.open_socket();
        }
        if self.sock.is_none() {
            return;
        }

        let due = self
            .last_announce
            .map_or(true, |t| t.elapsed() >= ANNOUNCE_TIME);
        if due {
            self.announce().await;
        }
    }

    async fn on_command(&mut self, cmd: LpdCommand) {
        match cmd {
            LpdCommand::AddSwarm(sha) => {
                self.swarms.insert(sha);
                self.update().await;
            }
            LpdCommand::RemoveSwarm(sha) => {
                self.swarms.remove(&sha);
            }
            LpdCommand::Update => self.update().await,
        }
    }

    /// Force an announcement now, e.g. when a swarm was just added.
    async fn update(&mut self) {
        self.last_announce = None;
        self.last_sock_attempt = None;
        self.on_heartbeat().await;
    }

    fn open_socket(&mut self) {
        let retry_due = self
            .last_sock_attempt
            .map_or(true, |t| t.elapsed() >= SOCK_ATTEMPT_TIME);
        if !retry_due {
            return;
        }
        self.last_sock_attempt = Some(Instant::now());

        match open_multicast(self.group, self.port) {
            Ok(sock) => {
                info!("lpd listening on {}:{}", self.group, self.port);
                self.sock = Some(Arc::new(sock));
                self.last_announce = None;
            }
            Err(err) => {
                warn!("lpd socket error, will try again later: {}", err);
            }
        }
    }

    fn drop_socket(&mut self) {
        self.sock = None;
        self.last_sock_attempt = Some(Instant::now());
    }

    async fn announce(&mut self) {
        let Some(sock) = self.sock.clone() else { return };
        self.last_announce = Some(Instant::now());

        let destination = (self.group, self.port);
        let shas: Vec<String> = self.swarms.iter().cloned().collect();
        for sha in shas {
            let datagram = format_announce(&sha, my_ip(), self.listen_port, &self.peerid);
            debug!("lpd --> {:?}", datagram);
            if let Err(err) = sock.send_to(datagram.as_bytes(), destination).await {
                warn!("lpd sendto error, will reopen socket later: {}", err);
                self.drop_socket();
                return;
            }
        }
    }

    fn on_datagram(
        &mut self,
        received: io::Result<(Vec<u8>, SocketAddr)>,
        events: &UnboundedSender<NodeEvent>,
    ) {
        let (buf, _) = match received {
            Ok(received) => received,
            Err(err) => {
                warn!("lpd recv error, will reopen socket later: {}", err);
                self.drop_socket();
                return;
            }
        };

        let text = String::from_utf8_lossy(&buf);
        let Some((sha, host, port, peerid)) = parse_announce(&text) else {
            debug!("lpd <-- {:?} # not an announcement, ignoring", text);
            return;
        };

        if peerid == self.peerid {
            return;
        }

        debug!("lpd <-- {:?}", text);
        let _ = events.send(NodeEvent::DiscoveredPeer {
            sha,
            addr: SocketAddr::new(host.into(), port),
            peerid: Some(peerid),
        });
    }
}

fn open_multicast(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    sock.set_multicast_loop_v4(true)?;
    sock.set_multicast_ttl_v4(1)?;
    sock.set_nonblocking(true)?;
    UdpSocket::from_std(sock)
}

pub fn format_announce(sha: &str, ip: Ipv4Addr, port: u16, peerid: &str) -> String {
    format!("{} {} {} {}", sha, ip, port, peerid)
}

/// Parse `"<swarmid> <ipv4> <port> <peerid>"`; anything else on the
/// multicast group is ignored.
pub fn parse_announce(buf: &str) -> Option<(String, Ipv4Addr, u16, String)> {
    let mut fields = buf.split_whitespace();
    let sha = fields.next()?;
    let host: Ipv4Addr = fields.next()?.parse().ok()?;
    let port: u16 = fields.next()?.parse().ok()?;
    let peerid = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some((sha.to_string(), host, port, peerid.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_round_trip() {
        let sha = "a".repeat(40);
        let wire = format_announce(&sha, Ipv4Addr::new(10, 0, 0, 2), 7000, "alice-x");
        assert_eq!(wire, format!("{} 10.0.0.2 7000 alice-x", sha));

        let (got_sha, host, port, peerid) = parse_announce(&wire).unwrap();
        assert_eq!(got_sha, sha);
        assert_eq!(host, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(port, 7000);
        assert_eq!(peerid, "alice-x");
    }

    #[test]
    fn junk_datagrams_ignored() {
        assert!(parse_announce("").is_none());
        assert!(parse_announce("BT-SEARCH * HTTP/1.1").is_none());
        assert!(parse_announce("aaaa not-an-ip 7000 alice-x").is_none());
        assert!(parse_announce("aaaa 10.0.0.2 not-a-port alice-x").is_none());
        assert!(parse_announce("aaaa 10.0.0.2 7000 alice-x extra").is_none());
    }
}
