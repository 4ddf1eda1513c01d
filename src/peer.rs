use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::SinkExt;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::child::Child;
use crate::codec::FrameCodec;
use crate::filesend::FileSend;
use crate::node::{NodeEvent, PeerToken};
use crate::proxy::ProxyListener;
use crate::util::short_sha;

/// Where file chunks received for an outstanding `file_get` are delivered:
/// the HTTP proxy request that asked for them, or the console's debug
/// fetch. A dropped receiver stands for a vanished requester.
pub type ChunkSink = mpsc::UnboundedSender<Vec<u8>>;

/// Session state for a single remote peer. The socket lives in an io pump
/// task ([`spawn_outbound`]/[`spawn_inbound`]); everything here is owned
/// and mutated by the node loop.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    pub inbound: bool,
    /// Swarm id. Inbound peers have none until their helo arrives.
    pub swarm: Option<String>,
    pub remote_peerid: Option<String>,
    /// The listener port the remote advertised in its helo.
    pub advertised_port: u16,
    pub connected: bool,
    /// Handshake completed in both directions.
    pub negotiated: bool,
    /// This peer is running the swarm's initial clone.
    pub cloning: bool,

    pub child: Option<Child>,
    pub proxy: Option<ProxyListener>,
    /// Extra listeners started from the console for poking at the peer
    /// with curl or git directly.
    pub debug_proxies: Vec<ProxyListener>,

    /// Files we are fetching from the remote peer, keyed by request id.
    pub requests: HashMap<i64, ChunkSink>,
    pub next_request_id: i64,
    /// Files we are sending to the remote peer.
    pub sending: HashMap<i64, FileSend>,

    pub refs_sig: String,
    pub last_refs_check: Option<Instant>,
    pub last_read: Instant,
    pub last_ping: Instant,

    writer: mpsc::UnboundedSender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peerid = self.remote_peerid.as_deref().unwrap_or("?");
        let sha = self.swarm.as_deref().map(short_sha).unwrap_or("inbound");
        write!(f, "Peer({}, {}, {})", peerid, sha, self.addr)
    }
}

impl Peer {
    fn new(
        addr: SocketAddr,
        inbound: bool,
        swarm: Option<String>,
        writer: mpsc::UnboundedSender<Bytes>,
        shutdown: watch::Sender<bool>,
    ) -> Peer {
        let now = Instant::now();
        Peer {
            addr,
            inbound,
            swarm,
            remote_peerid: None,
            advertised_port: 0,
            connected: inbound,
            negotiated: false,
            cloning: false,
            child: None,
            proxy: None,
            debug_proxies: Vec::new(),
            requests: HashMap::new(),
            next_request_id: 0,
            sending: HashMap::new(),
            refs_sig: String::new(),
            last_refs_check: None,
            last_read: now,
            last_ping: now,
            writer,
            shutdown,
        }
    }

    /// Queue one framed message on the connection. Failure means the io
    /// pump is already gone; the caller's heartbeat will notice.
    pub fn send_frame(&self, frame: Bytes) {
        let _ = self.writer.send(frame);
    }

    /// Ask the io pump to flush and drop the socket.
    pub fn close_io(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.duration_since(self.last_read)
    }

    pub fn since_ping(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ping)
    }
}

/// Construct the session for an already-accepted inbound connection and
/// start its io pump.
pub fn spawn_inbound(
    token: PeerToken,
    stream: TcpStream,
    addr: SocketAddr,
    len_bytes: usize,
    max_len: usize,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> Peer {
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("incoming connection from {}", addr);
    tokio::spawn(async move {
        let framed = Framed::new(stream, FrameCodec::new(len_bytes, max_len));
        pump(framed, token, events, writer_rx, shutdown_rx).await;
    });

    Peer::new(addr, true, None, writer_tx, shutdown_tx)
}

/// Construct an outbound session: dial with a connect timeout, then run
/// the io pump. The node learns about the outcome through `Connected` or
/// `Disconnected` events.
pub fn spawn_outbound(
    token: PeerToken,
    addr: SocketAddr,
    swarm: String,
    len_bytes: usize,
    max_len: usize,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> Peer {
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("connecting to {}", addr);
    tokio::spawn(async move {
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                let _ = events.send(NodeEvent::Disconnected {
                    token,
                    reason: Some(format!("connect failed: {}", err)),
                });
                return;
            }
            Err(_) => {
                let _ = events.send(NodeEvent::Disconnected {
                    token,
                    reason: Some("connect timeout".to_string()),
                });
                return;
            }
        };

        let _ = events.send(NodeEvent::Connected { token });
        let framed = Framed::new(stream, FrameCodec::new(len_bytes, max_len));
        pump(framed, token, events, writer_rx, shutdown_rx).await;
    });

    Peer::new(addr, false, Some(swarm), writer_tx, shutdown_tx)
}

/// Move frames between the socket and the node until either side closes.
/// On a requested shutdown the queued outbound frames are flushed first,
/// so a final helo or cancel still reaches the wire.
async fn pump(
    mut framed: Framed<TcpStream, FrameCodec>,
    token: PeerToken,
    events: mpsc::UnboundedSender<NodeEvent>,
    mut writer_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                while let Ok(frame) = writer_rx.try_recv() {
                    if framed.send(frame).await.is_err() {
                        return;
                    }
                }
                let _ = framed.flush().await;
                debug!("connection to peer {} shut down", token);
                return;
            }
            Some(frame) = writer_rx.recv() => {
                if let Err(err) = framed.send(frame).await {
                    let _ = events.send(NodeEvent::Disconnected {
                        token,
                        reason: Some(err.to_string()),
                    });
                    return;
                }
            }
            frame = framed.next() => match frame {
                Some(Ok(msg)) => {
                    let _ = events.send(NodeEvent::Frame { token, msg });
                }
                Some(Err(err)) => {
                    let _ = events.send(NodeEvent::Disconnected {
                        token,
                        reason: Some(err.to_string()),
                    });
                    return;
                }
                None => {
                    let _ = events.send(NodeEvent::Disconnected {
                        token,
                        reason: None,
                    });
                    return;
                }
            }
        }
    }
}
