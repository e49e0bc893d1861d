//! Line-oriented chat session on stdin/stdout: the binary's stand-in for a chat UI.

use std::net::Ipv4Addr;
use std::sync::Arc;

use lanchat_core::{ChatLog, ChatMessage, DeliveryStatus, Direction, Peer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::NodeEvent;
use crate::node::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Select(String),
    Msg { to: String, text: String },
    /// Text for the selected peer.
    Say(String),
    Ping,
    Queue,
    Log,
    Help,
    Quit,
    Empty,
    /// `/select` or `/msg` with something other than an IPv4 address.
    BadAddress(String),
    Unknown(String),
}

fn peer_address(raw: &str) -> Result<String, Command> {
    raw.parse::<Ipv4Addr>()
        .map(|ip| ip.to_string())
        .map_err(|_| Command::BadAddress(raw.to_string()))
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    let (cmd, args) = match rest.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (rest, ""),
    };
    match (cmd, args) {
        ("peers", _) => Command::Peers,
        ("select", addr) if !addr.is_empty() => match peer_address(addr) {
            Ok(addr) => Command::Select(addr),
            Err(bad) => bad,
        },
        ("msg", args) => match args.split_once(char::is_whitespace) {
            Some((to, text)) if !text.trim().is_empty() => match peer_address(to) {
                Ok(to) => Command::Msg {
                    to,
                    text: text.trim().to_string(),
                },
                Err(bad) => bad,
            },
            _ => Command::Unknown(line.to_string()),
        },
        ("ping", _) => Command::Ping,
        ("queue", _) => Command::Queue,
        ("log", _) => Command::Log,
        ("help", _) => Command::Help,
        ("quit", _) | ("exit", _) => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    }
}

const HELP: &str = "\
/peers              list discovered peers
/select <addr>      pick the peer plain text goes to
/msg <addr> <text>  send to a specific peer
/ping               probe every known peer
/queue              show queued (undelivered) messages
/log                show the conversation with the selected peer
/quit               leave";

fn status_mark(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Sent => "sent",
        DeliveryStatus::Delivered => "delivered",
        DeliveryStatus::Seen => "seen",
        DeliveryStatus::Failed => "failed",
    }
}

fn display_name(peers: &[Peer], address: &str) -> String {
    peers
        .iter()
        .find(|p| p.address == address)
        .map(|p| p.display_name.clone())
        .unwrap_or_else(|| address.to_string())
}

fn render(msg: &ChatMessage, peers: &[Peer]) -> String {
    let time = msg.timestamp.format("%H:%M:%S");
    match msg.direction {
        Direction::Sent => format!(
            "[{time}] you -> {}: {} ({})",
            display_name(peers, &msg.peer),
            msg.content,
            status_mark(msg.status)
        ),
        Direction::Received => format!(
            "[{time}] {}: {}",
            display_name(peers, &msg.sender),
            msg.content
        ),
    }
}

struct Session {
    node: Arc<Node>,
    log: ChatLog,
    selected: Option<String>,
}

impl Session {
    fn send(&mut self, to: String, text: String) {
        let sequence = self.node.allocate_sequence();
        self.log.record_sent(&to, &text, sequence);
        let node = self.node.clone();
        tokio::spawn(async move {
            node.send_numbered(&to, &text, sequence).await;
        });
    }

    async fn command(&mut self, cmd: Command, peers: &[Peer]) -> bool {
        match cmd {
            Command::Empty => {}
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
            Command::Peers => {
                if peers.is_empty() {
                    println!("no peers discovered yet");
                }
                for p in peers {
                    let mark = if Some(&p.address) == self.selected.as_ref() { "*" } else { " " };
                    println!("{mark} {} ({})", p.address, p.display_name);
                }
            }
            Command::Select(addr) => {
                println!("talking to {}", display_name(peers, &addr));
                self.selected = Some(addr);
            }
            Command::Msg { to, text } => self.send(to, text),
            Command::Say(text) => match self.selected.clone() {
                Some(to) => self.send(to, text),
                None => println!("no peer selected; use /select <addr> or /msg <addr> <text>"),
            },
            Command::Ping => {
                let node = self.node.clone();
                tokio::spawn(async move {
                    let answered = node.ping_all().await;
                    println!("{answered} peer(s) answered ping");
                });
            }
            Command::Queue => {
                let queued = self.node.queued().await;
                if queued.is_empty() {
                    println!("nothing queued");
                }
                for (dest, items) in queued {
                    println!("{} ({} queued)", display_name(peers, &dest), items.len());
                    for item in items {
                        println!("  #{} {}", item.sequence, item.content);
                    }
                }
            }
            Command::Log => match &self.selected {
                Some(peer) => {
                    for m in self.log.conversation(peer) {
                        println!("{}", render(m, peers));
                    }
                }
                None => println!("no peer selected"),
            },
            Command::BadAddress(raw) => println!("{raw} is not a peer address (expected IPv4, see /peers)"),
            Command::Unknown(line) => println!("unknown command: {line} (try /help)"),
        }
        true
    }

    fn event(&mut self, event: NodeEvent, peers: &[Peer]) {
        match event {
            NodeEvent::MessageReceived { from, content } => {
                let msg = self.log.record_received(&from, &content);
                println!("{}", render(msg, peers));
                let node = self.node.clone();
                tokio::spawn(async move {
                    node.send_seen(&from, &content).await;
                });
            }
            NodeEvent::Seen { from, content } => {
                self.log.mark_seen(&from, &content);
            }
            NodeEvent::Delivery {
                sequence, outcome, ..
            } => {
                if let Some(status) = self.log.apply_outcome(sequence, outcome) {
                    if status == DeliveryStatus::Failed {
                        if let Some(m) = self.log.messages().iter().find(|m| {
                            m.direction == Direction::Sent && m.sequence == sequence
                        }) {
                            println!("{}", render(m, peers));
                        }
                    }
                }
            }
            NodeEvent::Redelivered {
                destination,
                sequence,
                content,
            } => println!(
                "queued message #{sequence} to {} delivered: {content}",
                display_name(peers, &destination)
            ),
            NodeEvent::ComponentStopped { component, error } => {
                println!("warning: {component} stopped ({error})")
            }
        }
    }
}

/// Run the session until `/quit`, end of input, or `cancel`.
pub async fn run_console(
    node: Arc<Node>,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut peers_rx = node.subscribe_peers();
    let mut session = Session {
        log: ChatLog::new(node.identity().key()),
        node,
        selected: None,
    };
    let mut known = 0usize;
    println!("{HELP}");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let peers = peers_rx.borrow().clone();
                if !session.command(parse_command(&line), &peers).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                let peers = peers_rx.borrow().clone();
                session.event(event, &peers);
            }
            Ok(()) = peers_rx.changed() => {
                let count = peers_rx.borrow_and_update().len();
                if count != known {
                    println!("{count} peer(s) online");
                    known = count;
                }
            }
        }
    }
    Ok(())
}
