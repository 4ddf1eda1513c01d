use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use log::error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;

use crate::messages::Message;
use crate::node::{Node, NodeEvent, PeerToken};
use crate::proxy::ProxyListener;
use crate::tracker::TrackerCommand;
use crate::util::validate_ip;

/// All valid console commands. Case matters: `next`/`prev` move the peer
/// selector, `NEXT`/`PREV` the swarm selector.
const COMMANDS: &[&str] = &[
    "NEXT", "PREV", "add", "aliases", "clone", "close", "connect", "drop", "fetch", "get",
    "help", "list", "lpd", "next", "peerid", "pex", "ping", "port", "prev", "proxy", "quit",
    "remotes", "undampen", "updatetracker",
];

/// Short forms that would otherwise be ambiguous prefixes.
const ALIASES: &[(&str, &str)] = &[
    ("?", "help"),
    ("l", "list"),
    ("ls", "list"),
    ("p", "prev"),
    ("c", "connect"),
];

#[derive(Debug, PartialEq)]
enum Resolution {
    Exact(&'static str),
    Ambiguous(Vec<&'static str>),
    Unknown,
}

/// Aliases resolve first and may not be abbreviated; anything else may be
/// abbreviated as long as the prefix is unique.
fn resolve_command(input: &str) -> Resolution {
    let name = ALIASES
        .iter()
        .find(|(alias, _)| *alias == input)
        .map(|(_, target)| *target)
        .unwrap_or(input);

    if let Some(exact) = COMMANDS.iter().copied().find(|c| *c == name) {
        return Resolution::Exact(exact);
    }

    let matches: Vec<&'static str> = COMMANDS
        .iter()
        .filter(|c| c.starts_with(name))
        .copied()
        .collect();
    match matches.as_slice() {
        [] => Resolution::Unknown,
        [single] => Resolution::Exact(*single),
        _ => Resolution::Ambiguous(matches),
    }
}

/// Selection state for the interactive console: the current peer and
/// swarm, which most commands use as their implicit argument.
#[derive(Debug, Default)]
pub struct Console {
    peer_index: usize,
    swarm_index: usize,
    current_peer: Option<PeerToken>,
    current_swarm: Option<String>,
}

/// Feed stdin lines to the node loop; EOF quits.
pub fn spawn_stdin(events: UnboundedSender<NodeEvent>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events.send(NodeEvent::Command(line)).is_err() {
                        return;
                    }
                }
                _ => {
                    println!("stdin EOF");
                    let _ = events.send(NodeEvent::Quit);
                    return;
                }
            }
        }
    });
}

impl Node {
    /// Execute one console line. Returns false when the node should exit.
    pub(super) fn on_command(&mut self, line: &str) -> bool {
        let mut args = line.split_whitespace();
        let Some(input) = args.next() else { return true };
        let args: Vec<&str> = args.collect();

        let cmd = match resolve_command(input) {
            Resolution::Exact(cmd) => cmd,
            Resolution::Ambiguous(matches) => {
                println!("Ambiguous command, might be: {}", matches.join(" "));
                return true;
            }
            Resolution::Unknown => {
                println!("Unknown command");
                return true;
            }
        };

        println!(">> {} {}", cmd, args.join(" "));
        self.update_selection();

        match cmd {
            "quit" => return false,
            "help" => {
                println!("{}", COMMANDS.join(" "));
            }
            "aliases" => {
                for (alias, target) in ALIASES {
                    println!("{}: {}", alias, target);
                }
            }
            "list" => self.cmd_list(),
            "next" => {
                self.console.current_peer = None;
                self.console.peer_index += 1;
                self.update_selection();
                self.cmd_list();
            }
            "prev" => {
                self.console.current_peer = None;
                let len = self.peer_order().len();
                self.console.peer_index = match self.console.peer_index {
                    0 => len.saturating_sub(1),
                    i => i - 1,
                };
                self.update_selection();
                self.cmd_list();
            }
            "NEXT" => {
                self.console.current_swarm = None;
                self.console.swarm_index += 1;
                self.update_selection();
                self.cmd_list();
            }
            "PREV" => {
                self.console.current_swarm = None;
                let len = self.sorted_shas().len();
                self.console.swarm_index = match self.console.swarm_index {
                    0 => len.saturating_sub(1),
                    i => i - 1,
                };
                self.update_selection();
                self.cmd_list();
            }
            "connect" => self.cmd_connect(&args),
            "close" => {
                if let Some(token) = self.active_peer() {
                    self.close_peer(token, "closed from console");
                }
            }
            "fetch" => {
                if let Some(token) = self.active_peer() {
                    self.do_fetch(token);
                }
            }
            "ping" => {
                if let Some(token) = self.active_peer() {
                    if let Err(err) = self.send(token, &Message::Ping) {
                        error!("{}", err);
                    }
                }
            }
            "pex" => {
                if let Some(token) = self.active_peer() {
                    if let Err(err) = self.send(token, &Message::PexRequest) {
                        error!("{}", err);
                    }
                }
            }
            "get" => {
                if args.len() != 1 {
                    println!("Usage: get <filename>");
                } else if let Some(token) = self.active_peer() {
                    self.debug_get(token, args[0].to_string());
                }
            }
            "proxy" => {
                if let Some(token) = self.active_peer() {
                    match ProxyListener::start(token, &self.config, self.events_tx.clone()) {
                        Ok(proxy) => {
                            println!("Proxy URL {}", proxy.url);
                            if let Some(peer) = self.peers.get_mut(&token) {
                                peer.debug_proxies.push(proxy);
                            }
                        }
                        Err(err) => println!("Cannot start proxy: {}", err),
                    }
                }
            }
            "add" => {
                if args.len() != 1 {
                    println!("Usage: add <directory>");
                } else {
                    match self.add_swarm(&expand_user(args[0])) {
                        Ok(sha) => self.console.current_swarm = Some(sha),
                        Err(err) => println!("{}", err),
                    }
                }
            }
            "clone" => self.cmd_clone(&args),
            "drop" => {
                if let Some(sha) = self.active_swarm() {
                    self.drop_swarm(&sha);
                }
            }
            "lpd" => self.lpd_update(),
            "updatetracker" => {
                for tracker in &self.trackers {
                    let _ = tracker.commands.send(TrackerCommand::Announce);
                }
            }
            "undampen" => {
                if let Some(sha) = self.active_swarm() {
                    if let Some(swarm) = self.swarms.get_mut(&sha) {
                        println!("Forgetting {} dampened peers", swarm.dampen.len());
                        swarm.dampen.clear();
                    }
                }
            }
            "remotes" => {
                for swarm in self.swarms.values() {
                    println!("Remotes for Swarm({}):", swarm.short());
                    if let Some(git) = swarm.git.as_ref() {
                        match git.remotes() {
                            Ok(remotes) => {
                                for remote in remotes {
                                    println!("    {}", remote);
                                }
                            }
                            Err(err) => println!("    {}", err),
                        }
                    }
                }
            }
            "peerid" => {
                if args.is_empty() {
                    println!("{:?}", self.peerid);
                } else {
                    println!("PeerID already set to {:?}", self.peerid);
                }
            }
            "port" => {
                if args.is_empty() {
                    println!("{}", self.listen_port);
                } else {
                    println!("Port cannot be set after startup; listening on {}", self.listen_port);
                }
            }
            _ => unreachable!("command table covers every resolution"),
        }
        true
    }

    fn active_peer(&self) -> Option<PeerToken> {
        let token = self.console.current_peer;
        if token.is_none() {
            println!("No active peer");
        }
        token
    }

    fn active_swarm(&self) -> Option<String> {
        let sha = self.console.current_swarm.clone();
        if sha.is_none() {
            println!("No active swarm");
        }
        sha
    }

    fn sorted_shas(&self) -> Vec<String> {
        let mut shas: Vec<String> = self.swarms.keys().cloned().collect();
        shas.sort();
        shas
    }

    /// Peers in display order: swarm by swarm, then the inbound ones
    /// still waiting for their handshake.
    fn peer_order(&self) -> Vec<PeerToken> {
        let mut order: Vec<PeerToken> = Vec::new();
        for sha in self.sorted_shas() {
            if let Some(swarm) = self.swarms.get(&sha) {
                order.extend(swarm.peers.iter().copied());
            }
        }
        order.extend(
            self.peers
                .iter()
                .filter(|(_, p)| p.swarm.is_none())
                .map(|(t, _)| *t),
        );
        order
    }

    /// Re-validate the current peer and swarm after any change, keeping
    /// the selection on something nearby when the old one is gone.
    fn update_selection(&mut self) {
        let order = self.peer_order();
        if let Some(pos) = self
            .console
            .current_peer
            .and_then(|token| order.iter().position(|t| *t == token))
        {
            self.console.peer_index = pos;
        } else {
            if self.console.peer_index >= order.len() {
                self.console.peer_index = 0;
            }
            self.console.current_peer = order.get(self.console.peer_index).copied();
        }

        let shas = self.sorted_shas();
        if let Some(pos) = self
            .console
            .current_swarm
            .as_ref()
            .and_then(|sha| shas.iter().position(|s| s == sha))
        {
            self.console.swarm_index = pos;
        } else {
            if self.console.swarm_index >= shas.len() {
                self.console.swarm_index = 0;
            }
            self.console.current_swarm = shas.get(self.console.swarm_index).cloned();
        }
    }

    fn show_peer(&self, token: PeerToken) {
        let Some(peer) = self.peers.get(&token) else { return };
        let selector = if self.console.current_peer == Some(token) {
            '*'
        } else {
            ' '
        };
        let direction = if !peer.connected {
            "==>"
        } else if peer.inbound && peer.swarm.is_none() {
            "<=="
        } else if peer.inbound {
            "<--"
        } else {
            "-->"
        };
        let peerid = peer
            .remote_peerid
            .as_deref()
            .unwrap_or("Connection in progress");
        let cloning = if peer.cloning { " (actively cloning)" } else { "" };

        let line = format!("  {} {} {}", selector, direction, peer.addr);
        println!("{:<28}{}{}", line, peerid, cloning);
    }

    fn cmd_list(&mut self) {
        self.update_selection();
        println!("I am {:?}", self.peerid);
        println!();

        let shas = self.sorted_shas();
        for sha in &shas {
            let swarm = &self.swarms[sha];
            let selector = if self.console.current_swarm.as_ref() == Some(sha) {
                " *"
            } else {
                ""
            };
            println!(
                "Swarm({}), {:?}{}",
                swarm.short(),
                swarm.directory.display().to_string(),
                selector
            );

            for tracker in &self.trackers {
                println!("    -T- Tracker({}:{})", tracker.host, tracker.port);
            }

            if swarm.peers.is_empty() {
                println!("    --- No peers");
            }
            for token in &swarm.peers {
                self.show_peer(*token);
            }
            println!();

            let now = Instant::now();
            let mut dampened: Vec<(u64, SocketAddr)> = swarm
                .dampen
                .iter()
                .map(|(addr, deadline)| {
                    (deadline.saturating_duration_since(now).as_secs(), *addr)
                })
                .collect();
            dampened.sort();
            for (left, addr) in &dampened {
                let unit = if *left == 1 { "second" } else { "seconds" };
                println!("    -/- Dampened for {} {}: {}", left, unit, addr);
            }
            if !dampened.is_empty() {
                println!();
            }
        }

        let inbound: Vec<PeerToken> = self
            .peers
            .iter()
            .filter(|(_, p)| p.swarm.is_none())
            .map(|(t, _)| *t)
            .collect();
        if !inbound.is_empty() {
            println!("Inbound");
            for token in inbound {
                self.show_peer(token);
            }
            println!();
        }

        if shas.is_empty() {
            println!("No swarms");
            println!();
        }
    }

    fn cmd_connect(&mut self, args: &[&str]) {
        let Some(sha) = self.active_swarm() else { return };

        let (ip, port) = match args {
            [port] => ("127.0.0.1", *port),
            [ip, port] => (*ip, *port),
            _ => {
                println!("Usage: connect <ip> <port>, or <port> for localhost");
                return;
            }
        };

        if !validate_ip(ip) {
            println!("Invalid IP. Only dotted decimal supported");
            return;
        }
        let Ok(port) = port.parse::<u16>() else {
            println!("Invalid port");
            return;
        };
        let Ok(addr) = format!("{}:{}", ip, port).parse::<SocketAddr>() else {
            println!("Invalid address");
            return;
        };

        self.connect(&sha, addr, None);
    }

    fn cmd_clone(&mut self, args: &[&str]) {
        let [sha, directory] = args else {
            println!("Usage: clone <sha> <directory>");
            return;
        };

        let valid = sha.len() == 40 && sha.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !valid {
            println!("Swarm id must be 40 lowercase hex digits");
            return;
        }

        if let Err(err) = self.clone_swarm(sha.to_string(), expand_user(directory)) {
            println!("{}", err);
        } else {
            self.console.current_swarm = Some(sha.to_string());
        }
    }
}

fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_commands_resolve() {
        assert_eq!(resolve_command("list"), Resolution::Exact("list"));
        assert_eq!(resolve_command("quit"), Resolution::Exact("quit"));
    }

    #[test]
    fn aliases_resolve_before_prefixes() {
        assert_eq!(resolve_command("l"), Resolution::Exact("list"));
        assert_eq!(resolve_command("ls"), Resolution::Exact("list"));
        assert_eq!(resolve_command("p"), Resolution::Exact("prev"));
        assert_eq!(resolve_command("c"), Resolution::Exact("connect"));
        assert_eq!(resolve_command("?"), Resolution::Exact("help"));
    }

    #[test]
    fn unique_prefixes_resolve() {
        assert_eq!(resolve_command("con"), Resolution::Exact("connect"));
        assert_eq!(resolve_command("q"), Resolution::Exact("quit"));
        assert_eq!(resolve_command("und"), Resolution::Exact("undampen"));
        assert_eq!(resolve_command("g"), Resolution::Exact("get"));
    }

    #[test]
    fn selector_commands_are_case_sensitive() {
        assert_eq!(resolve_command("n"), Resolution::Exact("next"));
        assert_eq!(resolve_command("N"), Resolution::Exact("NEXT"));
        assert_eq!(resolve_command("PR"), Resolution::Exact("PREV"));
    }

    #[test]
    fn ambiguous_prefix_reports_candidates() {
        match resolve_command("pe") {
            Resolution::Ambiguous(matches) => {
                assert!(matches.contains(&"peerid"));
                assert!(matches.contains(&"pex"));
            }
            other => panic!("unexpected resolution {:?}", other),
        }
    }

    #[test]
    fn unknown_command() {
        assert_eq!(resolve_command("frobnicate"), Resolution::Unknown);
    }
}
