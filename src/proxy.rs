use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;

use crate::config::Config;
use crate::error::Result;
use crate::node::{NodeEvent, PeerToken};
use crate::util::auth_token;

lazy_static! {
    static ref VERB_RE: Regex = Regex::new(r"^GET http://p2p/([.a-zA-Z0-9/_-]+)[? ]").unwrap();
    static ref AUTH_RE: Regex = Regex::new(r"\nProxy-Authorization: Basic ([^\s]+)\n").unwrap();
}

const HEADER_BLOCK: &str =
    "Content-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";

/// Loopback HTTP proxy listener for one peer. The repository tool is
/// pointed at it via `http_proxy`; each request it makes becomes a
/// `file_get` on the peer session. The random credentials keep other
/// local users from riding our session.
#[derive(Debug)]
pub struct ProxyListener {
    pub url: String,
    shutdown: watch::Sender<bool>,
}

impl ProxyListener {
    pub fn start(
        token: PeerToken,
        config: &Config,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Result<ProxyListener> {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let port = listener.local_addr()?.port();

        let auth = format!("{}:{}", auth_token(), auth_token());
        let url = format!("http://{}@127.0.0.1:{}/", auth, port);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let limits = Limits {
            idle_timeout: Duration::from_secs(config.proxy_idle_timeout),
            max_recv: config.proxy_max_recv,
            max_readbuf: config.proxy_max_readbuf,
        };

        info!("proxy for peer {} listening on 127.0.0.1:{}", token, port);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    accepted = listener.accept() => {
                        let Ok((stream, addr)) = accepted else { return };
                        let auth = auth.clone();
                        let events = events.clone();
                        let limits = limits.clone();
                        tokio::spawn(async move {
                            handle_request(stream, addr, token, auth, limits, events).await;
                        });
                    }
                }
            }
        });

        Ok(ProxyListener { url, shutdown })
    }

    /// Environment handed to repository tool children spawned behind this
    /// proxy.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![("http_proxy".to_string(), self.url.clone())]
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[derive(Debug, Clone)]
struct Limits {
    idle_timeout: Duration,
    max_recv: usize,
    max_readbuf: usize,
}

/// One proxied request: parse and authenticate the HTTP request, ask the
/// node to fetch the file over the peer session, and stream the chunks
/// back as a chunked HTTP response.
async fn handle_request(
    mut stream: TcpStream,
    addr: SocketAddr,
    token: PeerToken,
    auth: String,
    limits: Limits,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    let request = match timeout(limits.idle_timeout, read_request(&mut stream, &limits)).await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(_) => {
            debug!("proxy connection from {} idle timeout", addr);
            return;
        }
    };

    let Some(file) = parse_request(&request, &auth) else {
        warn!("rejecting proxy request from {}", addr);
        return;
    };

    let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel();
    let (id_tx, id_rx) = oneshot::channel();
    let _ = events.send(NodeEvent::ProxyRequest {
        token,
        file,
        sink: chunks_tx,
        id: id_tx,
    });
    // The peer may already be gone, in which case the id never arrives.
    let Ok(id) = id_rx.await else { return };

    let mut sent_header = false;
    let mut eof = false;

    while let Some(buf) = chunks_rx.recv().await {
        if buf.is_empty() {
            let tail: Vec<u8> = if sent_header {
                b"0\r\n\r\n".to_vec()
            } else {
                format!("HTTP/1.1 404 Not Found\r\n{}", HEADER_BLOCK).into_bytes()
            };
            let _ = stream.write_all(&tail).await;
            eof = true;
            break;
        }

        let mut out = Vec::with_capacity(buf.len() + 64);
        if !sent_header {
            sent_header = true;
            out.extend_from_slice(format!("HTTP/1.1 200 OK\r\n{}", HEADER_BLOCK).as_bytes());
        }
        out.extend_from_slice(&chunk_frame(&buf));

        if stream.write_all(&out).await.is_err() {
            // The HTTP client hung up mid-transfer.
            break;
        }
    }

    let _ = stream.shutdown().await;
    let _ = events.send(NodeEvent::ProxyClosed {
        token,
        id,
        cancel: !eof,
    });
}

/// Accumulate bytes until the blank line ending the HTTP request, with
/// `\r` stripped for uniform parsing. Returns `None` if the client sends
/// too much without completing a request, or disconnects.
async fn read_request(stream: &mut TcpStream, limits: &Limits) -> Option<String> {
    let mut request = String::new();
    let mut total = 0usize;
    let mut buf = vec![0u8; limits.max_recv];

    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }

        total += n;
        if total > limits.max_readbuf {
            warn!("more than {} bytes received while parsing proxy request", limits.max_readbuf);
            return None;
        }

        request.extend(
            String::from_utf8_lossy(&buf[..n])
                .chars()
                .filter(|c| *c != '\r'),
        );

        if let Some(end) = request.find("\n\n") {
            request.truncate(end);
            return Some(request);
        }
    }
}

/// One HTTP chunk: hex length, CRLF, the data, CRLF.
fn chunk_frame(buf: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", buf.len()).into_bytes();
    out.extend_from_slice(buf);
    out.extend_from_slice(b"\r\n");
    out
}

/// Validate the request line and the proxy credentials; returns the
/// requested file path on success.
fn parse_request(request: &str, auth: &str) -> Option<String> {
    let file = VERB_RE.captures(request)?.get(1)?.as_str().to_string();

    // The last header has no trailing newline once the terminator is
    // stripped, so search with one restored.
    let headers = format!("{}\n", request);
    let encoded = AUTH_RE.captures(&headers)?.get(1)?.as_str().to_string();
    let decoded = BASE64.decode(encoded).ok()?;

    if decoded != auth.as_bytes() {
        warn!("proxy authorization failure");
        return None;
    }

    Some(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH: &str = "ABCDEFGHIJKLMNOP:QRSTUVWXYZ234567";

    fn request_with(auth_value: &str) -> String {
        format!(
            "GET http://p2p/info/refs?service=git-upload-pack HTTP/1.1\n\
             Host: p2p\n\
             Proxy-Authorization: Basic {}\n\
             User-Agent: git/2.39.0",
            auth_value
        )
    }

    #[test]
    fn valid_request_parses() {
        let encoded = BASE64.encode(AUTH);
        assert_eq!(
            parse_request(&request_with(&encoded), AUTH).as_deref(),
            Some("info/refs")
        );
    }

    #[test]
    fn plain_path_without_query_parses() {
        let encoded = BASE64.encode(AUTH);
        let request = format!(
            "GET http://p2p/HEAD HTTP/1.1\nProxy-Authorization: Basic {}",
            encoded
        );
        assert_eq!(parse_request(&request, AUTH).as_deref(), Some("HEAD"));
    }

    #[test]
    fn wrong_credentials_rejected() {
        let encoded = BASE64.encode("not:the-credentials");
        assert_eq!(parse_request(&request_with(&encoded), AUTH), None);
    }

    #[test]
    fn missing_auth_header_rejected() {
        let request = "GET http://p2p/HEAD HTTP/1.1\nHost: p2p";
        assert_eq!(parse_request(request, AUTH), None);
    }

    #[test]
    fn non_get_and_foreign_urls_rejected() {
        let encoded = BASE64.encode(AUTH);
        for line in [
            "POST http://p2p/HEAD HTTP/1.1",
            "GET http://example.com/HEAD HTTP/1.1",
            "GET /HEAD HTTP/1.1",
        ] {
            let request = format!("{}\nProxy-Authorization: Basic {}", line, encoded);
            assert_eq!(parse_request(&request, AUTH), None);
        }
    }

    #[test]
    fn header_block_is_the_chunked_close_block() {
        assert!(HEADER_BLOCK.contains("Transfer-Encoding: chunked\r\n"));
        assert!(HEADER_BLOCK.contains("Connection: close\r\n"));
        assert!(HEADER_BLOCK.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunk_frames_carry_hex_lengths() {
        assert_eq!(
            chunk_frame(b"ref: refs/heads/main\n"),
            b"15\r\nref: refs/heads/main\n\r\n".to_vec()
        );
        assert_eq!(chunk_frame(b""), b"0\r\n\r\n".to_vec());
    }
}
