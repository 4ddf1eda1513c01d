use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::config::Config;
use crate::node::NodeEvent;

/// Magic number opening every BEP-15 connection request.
const CONNECT_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
/// Some trackers historically sent the error action in the wrong byte
/// order; treat it the same.
const ACTION_ERROR_BE_TYPO: u32 = ACTION_ERROR.swap_bytes();

/// A connection id is valid for 60 seconds after receipt.
const CONN_ID_LIFETIME: Duration = Duration::from_secs(60);
const CONN_ID_RETRY_BASE: u64 = 15;
const ANNOUNCE_RETRY_BASE: u64 = 5;
const MAX_RETRY_EXPONENT: u32 = 4;

#[derive(Debug)]
pub enum TrackerCommand {
    AddSwarm(String),
    RemoveSwarm(String),
    /// Mark every swarm as due so the next heartbeat re-announces.
    Announce,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    NeedSocket,
    PickSwarm,
    NeedConnId,
    Announcing,
    /// The tracker reported an error; stay quiet until the deadline.
    Muted(Instant),
}

/// Client for a single BitTorrent UDP tracker (BEP-15). Announces every
/// local swarm and feeds the returned peers to the node. Socket errors
/// are transient: the socket is dropped and reopened on a timer.
struct Tracker {
    host: String,
    port: u16,
    listen_port: u16,
    peerid: String,

    socket_retry: Duration,
    mute_time: Duration,
    max_interval: u64,

    sock: Option<Arc<UdpSocket>>,
    last_sock_attempt: Option<Instant>,

    transaction_id: u32,
    key: u32,

    conn_id: Option<u64>,
    conn_id_time: Instant,
    conn_id_retries: u32,
    conn_id_last_sent: Option<Instant>,

    announce_retries: u32,
    announce_last_sent: Option<Instant>,
    /// Swarm id currently being announced.
    announce_swarm: Option<String>,
    /// Per-swarm deadline for the next announcement; `None` means due.
    swarms: HashMap<String, Option<Instant>>,

    state: State,
    events: UnboundedSender<NodeEvent>,
}

pub fn spawn(
    host: String,
    port: u16,
    listen_port: u16,
    peerid: String,
    config: &Config,
    events: UnboundedSender<NodeEvent>,
) -> UnboundedSender<TrackerCommand> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut tracker = Tracker {
        host,
        port,
        listen_port,
        peerid,
        socket_retry: Duration::from_secs(config.tracker_socket_retry),
        mute_time: Duration::from_secs(config.tracker_mute_time),
        max_interval: config.max_tracker_interval,
        sock: None,
        last_sock_attempt: None,
        transaction_id: rand::random(),
        key: rand::random(),
        conn_id: None,
        conn_id_time: Instant::now(),
        conn_id_retries: 0,
        conn_id_last_sent: None,
        announce_retries: 0,
        announce_last_sent: None,
        announce_swarm: None,
        swarms: HashMap::new(),
        state: State::NeedSocket,
        events,
    };

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        loop {
            let sock = tracker.sock.clone();
            tokio::select! {
                _ = heartbeat.tick() => tracker.on_heartbeat().await,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => tracker.on_command(cmd),
                    None => return,
                },
                received = recv_datagram(sock) => tracker.on_datagram(received).await,
            }
        }
    });

    tx
}

async fn recv_datagram(sock: Option<Arc<UdpSocket>>) -> io::Result<Vec<u8>> {
    match sock {
        Some(sock) => {
            let mut buf = [0u8; 10240];
            let n = sock.recv(&mut buf).await?;
            Ok(buf[..n].to_vec())
        }
        None => std::future::pending().await,
    }
}

impl Tracker {
    fn on_command(&mut self, cmd: TrackerCommand) {
        match cmd {
            TrackerCommand::AddSwarm(sha) => {
                info!("tracker {}:{} adding swarm {}", self.host, self.port, sha);
                self.swarms.entry(sha).or_insert(None);
            }
            TrackerCommand::RemoveSwarm(sha) => {
                self.swarms.remove(&sha);
                if self.announce_swarm.as_ref() == Some(&sha) {
                    self.announce_swarm = None;
                }
            }
            TrackerCommand::Announce => {
                for deadline in self.swarms.values_mut() {
                    *deadline = None;
                }
            }
        }
    }

    async fn on_heartbeat(&mut self) {
        // The chosen swarm may have been dropped mid-exchange.
        if let Some(sha) = &self.announce_swarm {
            if !self.swarms.contains_key(sha) {
                self.announce_swarm = None;
                if matches!(self.state, State::Announcing | State::NeedConnId) {
                    self.state = State::PickSwarm;
                }
            }
        }

        loop {
            match self.state {
                State::NeedSocket => {
                    if !self.open_socket().await {
                        return;
                    }
                    self.state = State::PickSwarm;
                }
                State::Muted(until) => {
                    if Instant::now() < until {
                        return;
                    }
                    self.state = State::PickSwarm;
                }
                State::PickSwarm => {
                    let now = Instant::now();
                    let due: Vec<&String> = self
                        .swarms
                        .iter()
                        .filter(|(_, deadline)| deadline.map_or(true, |d| d <= now))
                        .map(|(sha, _)| sha)
                        .collect();
                    let Some(sha) = due.choose(&mut rand::thread_rng()) else {
                        return;
                    };

                    info!("tracker {}:{} announcing {}", self.host, self.port, sha);
                    self.announce_swarm = Some(sha.to_string());
                    self.announce_retries = 0;
                    self.announce_last_sent = None;
                    self.state = State::NeedConnId;
                }
                State::NeedConnId => {
                    if self.conn_id.is_some() && self.conn_id_time.elapsed() < CONN_ID_LIFETIME {
                        self.state = State::Announcing;
                        continue;
                    }
                    self.conn_id = None;

                    if !retry_due(
                        self.conn_id_last_sent,
                        CONN_ID_RETRY_BASE,
                        self.conn_id_retries,
                    ) {
                        return;
                    }

                    debug!(
                        "tracker {}:{} requesting connection id, retry {}",
                        self.host, self.port, self.conn_id_retries
                    );
                    self.conn_id_retries = (self.conn_id_retries + 1).min(MAX_RETRY_EXPONENT);
                    self.conn_id_last_sent = Some(Instant::now());
                    let packet = connect_request(self.transaction_id);
                    self.send(&packet).await;
                    return;
                }
                State::Announcing => {
                    if self.conn_id.is_none() || self.conn_id_time.elapsed() >= CONN_ID_LIFETIME {
                        self.conn_id = None;
                        self.state = State::NeedConnId;
                        continue;
                    }
                    let Some(sha) = self.announce_swarm.clone() else {
                        self.state = State::PickSwarm;
                        continue;
                    };

                    if !retry_due(
                        self.announce_last_sent,
                        ANNOUNCE_RETRY_BASE,
                        self.announce_retries,
                    ) {
                        return;
                    }

                    debug!(
                        "tracker {}:{} sending announce for {}, retry {}",
                        self.host, self.port, sha, self.announce_retries
                    );
                    self.announce_retries = (self.announce_retries + 1).min(MAX_RETRY_EXPONENT);
                    self.announce_last_sent = Some(Instant::now());

                    let Ok(packet) = announce_request(
                        self.conn_id.unwrap_or(0),
                        self.transaction_id,
                        &sha,
                        &self.peerid,
                        self.key,
                        self.listen_port,
                    ) else {
                        warn!("tracker {}:{} cannot encode {} as an info hash", self.host, self.port, sha);
                        self.swarms.remove(&sha);
                        self.announce_swarm = None;
                        self.state = State::PickSwarm;
                        continue;
                    };
                    self.send(&packet).await;
                    return;
                }
            }
        }
    }

    async fn open_socket(&mut self) -> bool {
        if self.sock.is_some() {
            return true;
        }
        let retry_due = self
            .last_sock_attempt
            .map_or(true, |t| t.elapsed() >= self.socket_retry);
        if !retry_due {
            return false;
        }
        self.last_sock_attempt = Some(Instant::now());

        let target = format!("{}:{}", self.host, self.port);
        let opened = async {
            let sock = UdpSocket::bind("0.0.0.0:0").await?;
            sock.connect(&target).await?;
            Ok::<_, io::Error>(sock)
        }
        .await;

        match opened {
            Ok(sock) => {
                self.sock = Some(Arc::new(sock));
                true
            }
            Err(err) => {
                warn!("tracker {} socket error, will try again later: {}", target, err);
                false
            }
        }
    }

    fn drop_socket(&mut self) {
        self.sock = None;
        self.last_sock_attempt = Some(Instant::now());
        self.state = State::NeedSocket;
    }

    async fn send(&mut self, packet: &[u8]) {
        let Some(sock) = self.sock.clone() else {
            debug!("tracker {}:{} refusing to send while socket is down", self.host, self.port);
            return;
        };
        debug!("tracker {}:{} --> {} bytes", self.host, self.port, packet.len());
        if let Err(err) = sock.send(packet).await {
            warn!("tracker {}:{} send error: {}", self.host, self.port, err);
            self.drop_socket();
        }
    }

    async fn on_datagram(&mut self, received: io::Result<Vec<u8>>) {
        let buf = match received {
            Ok(buf) => buf,
            Err(err) => {
                warn!("tracker {}:{} recv error: {}", self.host, self.port, err);
                self.drop_socket();
                return;
            }
        };
        debug!("tracker {}:{} <-- {} bytes", self.host, self.port, buf.len());

        match parse_response(&buf, self.transaction_id) {
            None => {}
            Some(Response::ConnId(conn_id)) => {
                info!("tracker {}:{} connection id {:#x}", self.host, self.port, conn_id);
                self.conn_id = Some(conn_id);
                self.conn_id_time = Instant::now();
                self.conn_id_retries = 0;
                self.conn_id_last_sent = None;
                if self.state == State::NeedConnId {
                    self.state = State::Announcing;
                }
                // Follow up immediately rather than waiting a heartbeat.
                self.on_heartbeat().await;
            }
            Some(Response::Announce {
                interval,
                leechers,
                seeders,
                peers,
            }) => {
                let Some(sha) = self.announce_swarm.take() else { return };
                debug!(
                    "tracker {}:{} announce response: {} peers, {} leechers, {} seeders",
                    self.host,
                    self.port,
                    peers.len(),
                    leechers,
                    seeders
                );

                for addr in peers {
                    let _ = self.events.send(NodeEvent::DiscoveredPeer {
                        sha: sha.clone(),
                        addr: SocketAddr::V4(addr),
                        peerid: None,
                    });
                }

                let wait = interval.min(self.max_interval);
                info!(
                    "tracker {}:{} will ask for more peers for {} in {} seconds",
                    self.host, self.port, sha, wait
                );
                self.swarms
                    .insert(sha, Some(Instant::now() + Duration::from_secs(wait)));
                self.announce_retries = 0;
                self.announce_last_sent = None;
                self.state = State::PickSwarm;
            }
            Some(Response::Error(message)) => {
                warn!("tracker {}:{} reports error: {:?}", self.host, self.port, message);
                self.conn_id = None;
                self.announce_swarm = None;
                self.state = State::Muted(Instant::now() + self.mute_time);
            }
        }
    }
}

fn retry_due(last_sent: Option<Instant>, base: u64, retries: u32) -> bool {
    match last_sent {
        None => true,
        Some(sent) => {
            let wait = base * 2u64.pow(retries.min(MAX_RETRY_EXPONENT));
            sent.elapsed() >= Duration::from_secs(wait)
        }
    }
}

pub fn connect_request(transaction_id: u32) -> Vec<u8> {
    []
        .into_iter()
        .chain(CONNECT_MAGIC.to_be_bytes())
        .chain(ACTION_CONNECT.to_be_bytes())
        .chain(transaction_id.to_be_bytes())
        .collect()
}

/// Build the announce packet: the 20-byte info hash is the raw swarm id,
/// and our peer id on the tracker side is the SHA-1 digest of the
/// protocol-level peer id. `left`/`downloaded`/`uploaded` are meaningless
/// for a repository swarm and stay zero; the event is always `started`.
pub fn announce_request(
    conn_id: u64,
    transaction_id: u32,
    sha: &str,
    peerid: &str,
    key: u32,
    port: u16,
) -> std::result::Result<Vec<u8>, hex::FromHexError> {
    let info_hash = hex::decode(sha)?;
    let peer_digest: [u8; 20] = Sha1::digest(peerid.as_bytes()).into();

    Ok([]
        .into_iter()
        .chain(conn_id.to_be_bytes())
        .chain(ACTION_ANNOUNCE.to_be_bytes())
        .chain(transaction_id.to_be_bytes())
        .chain(info_hash)
        .chain(peer_digest)
        .chain(0u64.to_be_bytes()) // downloaded
        .chain(0u64.to_be_bytes()) // left
        .chain(0u64.to_be_bytes()) // uploaded
        .chain(1u32.to_be_bytes()) // event (1: started)
        .chain(0u32.to_be_bytes()) // ip address (0: use source)
        .chain(key.to_be_bytes())
        .chain((-1i32).to_be_bytes()) // num_want (-1: no preference)
        .chain(port.to_be_bytes())
        .collect())
}

#[derive(Debug, PartialEq)]
pub enum Response {
    ConnId(u64),
    Announce {
        interval: u64,
        leechers: u32,
        seeders: u32,
        peers: Vec<SocketAddrV4>,
    },
    Error(String),
}

/// Parse one tracker datagram. Runts and transaction id mismatches are
/// dropped silently; they are either noise or stale.
pub fn parse_response(buf: &[u8], transaction_id: u32) -> Option<Response> {
    if buf.len() < 16 {
        debug!("tracker runt of {} bytes", buf.len());
        return None;
    }

    let action = u32::from_be_bytes(buf[0..4].try_into().ok()?);
    let txid = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    if txid != transaction_id {
        debug!("tracker transaction id mismatch");
        return None;
    }

    match action {
        ACTION_CONNECT => {
            let conn_id = u64::from_be_bytes(buf[8..16].try_into().ok()?);
            Some(Response::ConnId(conn_id))
        }
        ACTION_ANNOUNCE => {
            if buf.len() < 20 {
                debug!("tracker announce runt");
                return None;
            }
            let interval = u32::from_be_bytes(buf[8..12].try_into().ok()?) as u64;
            let leechers = u32::from_be_bytes(buf[12..16].try_into().ok()?);
            let seeders = u32::from_be_bytes(buf[16..20].try_into().ok()?);

            let peers = buf[20..]
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    SocketAddrV4::new(ip, port)
                })
                .collect();

            Some(Response::Announce {
                interval,
                leechers,
                seeders,
                peers,
            })
        }
        ACTION_ERROR | ACTION_ERROR_BE_TYPO => Some(Response::Error(
            String::from_utf8_lossy(&buf[8..]).into_owned(),
        )),
        other => {
            debug!("tracker unknown action {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_bytes() {
        let packet = connect_request(0xDEADBEEF);
        assert_eq!(
            packet,
            vec![
                0x00, 0x00, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80, // magic
                0x00, 0x00, 0x00, 0x00, // action: connect
                0xDE, 0xAD, 0xBE, 0xEF, // transaction id
            ]
        );
    }

    #[test]
    fn announce_request_layout() {
        let sha = "aa".repeat(20);
        let packet =
            announce_request(0x0102030405060708, 0xDEADBEEF, &sha, "alice-x", 0x11223344, 7000)
                .unwrap();
        assert_eq!(packet.len(), 98);

        assert_eq!(&packet[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&packet[8..12], &[0, 0, 0, 1]); // action: announce
        assert_eq!(&packet[12..16], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&packet[16..36], &[0xaa; 20]); // info hash
        let digest: [u8; 20] = Sha1::digest(b"alice-x").into();
        assert_eq!(&packet[36..56], &digest);
        assert_eq!(&packet[56..80], &[0; 24]); // downloaded, left, uploaded
        assert_eq!(&packet[80..84], &[0, 0, 0, 1]); // event: started
        assert_eq!(&packet[84..88], &[0, 0, 0, 0]); // ip
        assert_eq!(&packet[88..92], &[0x11, 0x22, 0x33, 0x44]); // key
        assert_eq!(&packet[92..96], &[0xFF, 0xFF, 0xFF, 0xFF]); // num_want
        assert_eq!(&packet[96..98], &[0x1B, 0x58]); // port 7000
    }

    #[test]
    fn bad_swarm_id_is_not_an_info_hash() {
        assert!(announce_request(0, 0, "zz", "alice-x", 0, 7000).is_err());
    }

    #[test]
    fn conn_id_response_parses() {
        let mut buf = vec![0, 0, 0, 0, 0xDE, 0xAD, 0xBE, 0xEF];
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            parse_response(&buf, 0xDEADBEEF),
            Some(Response::ConnId(0x0102030405060708))
        );
    }

    #[test]
    fn announce_response_parses_compact_peers() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
        buf.extend_from_slice(&1800u32.to_be_bytes());
        buf.extend_from_slice(&3u32.to_be_bytes()); // leechers
        buf.extend_from_slice(&5u32.to_be_bytes()); // seeders
        buf.extend_from_slice(&[10, 0, 0, 1, 0x1B, 0x58]);
        buf.extend_from_slice(&[192, 168, 1, 2, 0x1B, 0x59]);

        match parse_response(&buf, 0xDEADBEEF) {
            Some(Response::Announce {
                interval,
                leechers,
                seeders,
                peers,
            }) => {
                assert_eq!(interval, 1800);
                assert_eq!(leechers, 3);
                assert_eq!(seeders, 5);
                assert_eq!(
                    peers,
                    vec![
                        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7000),
                        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 7001),
                    ]
                );
            }
            other => panic!("unexpected parse {:?}", other),
        }
    }

    #[test]
    fn runt_and_stale_responses_dropped() {
        assert_eq!(parse_response(&[0; 8], 1), None);

        let mut buf = vec![0, 0, 0, 0];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&[0; 8]);
        assert_eq!(parse_response(&buf, 8), None);
    }

    #[test]
    fn error_actions_parse_either_byte_order() {
        for action in [ACTION_ERROR, ACTION_ERROR_BE_TYPO] {
            let mut buf = Vec::new();
            buf.extend_from_slice(&action.to_be_bytes());
            buf.extend_from_slice(&0xDEADBEEFu32.to_be_bytes());
            buf.extend_from_slice(b"overloaded");
            assert_eq!(
                parse_response(&buf, 0xDEADBEEF),
                Some(Response::Error("overloaded".to_string()))
            );
        }
    }

    #[test]
    fn retry_backoff_caps_at_two_to_the_fourth() {
        let long_ago = Instant::now() - Duration::from_secs(100);
        assert!(retry_due(None, 5, 0));
        assert!(retry_due(Some(long_ago), 5, 0));
        // 5 * 2^4 = 80 <= 100 elapsed, and the exponent stays capped far
        // beyond four retries.
        assert!(retry_due(Some(long_ago), 5, 10));
        assert!(!retry_due(Some(Instant::now()), 5, 0));
    }
}
