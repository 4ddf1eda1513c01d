use std::path::Path;

use serde::Deserialize;

pub const PROTOCOL_NAME: &str = "p2p-git";
pub const MAJOR_VERSION: i64 = 0;
pub const MINOR_VERSION: i64 = 1;
pub const CLIENT_NAME: &str = "mainline-0.1";

/// Runtime configuration. Every field has a default, so an absent or empty
/// config file yields a working node.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// TCP port for the peer listener; 0 picks an ephemeral port.
    pub listen_port: u16,

    /// Peer id advertised in the handshake; empty means derive one from the
    /// username and hostname at startup.
    pub default_peerid: String,

    /// Minimum seconds between local ref-signature checks per peer.
    pub ref_check_interval: u64,

    /// Run `git merge --ff-only` automatically after a successful fetch.
    pub automerge: bool,

    pub connect_timeout: u64,
    pub helo_timeout: u64,
    pub idle_ping: u64,
    pub idle_timeout: u64,

    /// Exchange known peers with other members of the swarm.
    pub pex: bool,

    /// Pass `--prune` to `git fetch`.
    pub prune: bool,

    /// Seconds an outbound address stays undialable after a connect.
    pub dampen_time: u64,

    pub max_peers: usize,

    pub default_tracker: String,
    pub max_tracker_interval: u64,
    pub tracker_socket_retry: u64,
    pub tracker_mute_time: u64,

    pub mcast_grp: String,
    pub mcast_port: u16,

    pub proxy_idle_timeout: u64,
    pub proxy_max_recv: usize,
    /// Close a proxy connection that sends this many bytes without
    /// completing an HTTP request.
    pub proxy_max_readbuf: usize,

    /// ASCII hex digits in the frame length prefix.
    pub msg_len_bytes: usize,
    pub msg_max_len: usize,

    pub file_get_chunk_size: usize,
    /// How many file chunks may be in flight unacknowledged.
    pub file_get_window: u64,
}

impl Default for Config {
    fn default() -> Self {
        let msg_max_len = 16 * 1024;
        Config {
            listen_port: 0,
            default_peerid: String::new(),
            ref_check_interval: 10,
            automerge: false,
            connect_timeout: 30,
            helo_timeout: 10,
            idle_ping: 200,
            idle_timeout: 700,
            pex: true,
            prune: true,
            dampen_time: 25,
            max_peers: 100,
            default_tracker: String::new(),
            max_tracker_interval: 30 * 60,
            tracker_socket_retry: 10,
            tracker_mute_time: 20,
            mcast_grp: "239.192.152.143".to_string(),
            mcast_port: 6772,
            proxy_idle_timeout: 60,
            proxy_max_recv: 8 * 1024,
            proxy_max_readbuf: 32 * 1024,
            msg_len_bytes: 4,
            msg_max_len,
            file_get_chunk_size: msg_max_len * 2 / 3,
            file_get_window: 5,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(toml::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.msg_len_bytes, 4);
        assert_eq!(c.msg_max_len, 16 * 1024);
        assert_eq!(c.file_get_window, 5);
        assert_eq!(c.idle_timeout, 700);
        assert!(c.file_get_chunk_size < c.msg_max_len);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c: Config = toml::from_str("listen_port = 7000\nautomerge = true\n").unwrap();
        assert_eq!(c.listen_port, 7000);
        assert!(c.automerge);
        assert_eq!(c.dampen_time, 25);
        assert_eq!(c.mcast_grp, "239.192.152.143");
    }
}
