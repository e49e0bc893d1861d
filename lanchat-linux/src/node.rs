//! Node lifecycle: acquire sockets, start every component, expose send/peer/queue operations,
//! stop everything cooperatively.

use std::future::Future;
use std::net::SocketAddrV4;
use std::sync::Arc;

use lanchat_core::{DeliveryOutcome, Peer, QueueSnapshot, SequenceCounter};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::addr::SelfIdentity;
use crate::config::Config;
use crate::error::{Component, ComponentError, NodeError};
use crate::events::NodeEvent;
use crate::outbox::Outbox;
use crate::peers::{self, PeerTable};
use crate::presence;
use crate::server;
use crate::transport::MessageTransport;

/// Sequence and first-attempt outcome of one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub sequence: u64,
    pub outcome: DeliveryOutcome,
}

type Tasks = Vec<(Component, JoinHandle<std::io::Result<()>>)>;

/// A running LanChat node.
pub struct Node {
    identity: SelfIdentity,
    peers: Arc<PeerTable>,
    transport: Arc<MessageTransport>,
    sequences: SequenceCounter,
    events: mpsc::UnboundedSender<NodeEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Tasks>,
    startup_failures: Vec<ComponentError>,
}

impl Node {
    /// Start with the offline queue at `config.queue_file()` (in memory if there is none).
    pub async fn start(
        config: Config,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let outbox = match config.queue_file() {
            Some(path) => Outbox::load(path),
            None => Outbox::in_memory(),
        };
        Self::start_with_outbox(config, Arc::new(outbox)).await
    }

    /// Start every component. A component whose socket cannot be acquired is reported in
    /// `startup_failures` and the others run anyway; start fails only if none of the
    /// socket-based components came up.
    pub async fn start_with_outbox(
        config: Config,
        outbox: Arc<Outbox>,
    ) -> Result<(Node, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let identity = SelfIdentity::resolve(&config).map_err(NodeError::Address)?;
        let sequences = SequenceCounter::resume_after(outbox.last_sequence().await);
        let transport = Arc::new(
            MessageTransport::new(config.chat_port, config.response_timeout(), outbox)
                .with_local_addr(config.bind_addr),
        );
        let peers = Arc::new(PeerTable::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut tasks: Tasks = Vec::new();
        let mut failures = Vec::new();

        match server::bind_server(config.bind_addr, config.chat_port).await {
            Ok(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    log::info!("message server listening on {addr}");
                }
                let fut = server::run_server(
                    listener,
                    transport.clone(),
                    config.response_timeout(),
                    events_tx.clone(),
                    cancel.clone(),
                );
                spawn_component(&mut tasks, &events_tx, Component::Server, fut);
            }
            Err(e) => failures.push(ComponentError::new(Component::Server, e)),
        }

        match presence::bind_listener_socket(
            config.bind_addr,
            config.discovery_port,
            config.announce_addr,
        )
        .await
        {
            Ok(socket) => {
                let (tx, rx) = mpsc::channel(presence::SIGHTING_BACKLOG);
                let table = peers.clone();
                let self_address = identity.address;
                let cancel = cancel.clone();
                let fut = async move {
                    let listen = presence::run_listener(socket, self_address, tx, cancel.clone());
                    let apply = peers::apply_sightings(&table, rx, cancel);
                    let (listened, ()) = tokio::join!(listen, apply);
                    listened
                };
                spawn_component(&mut tasks, &events_tx, Component::Listener, fut);
            }
            Err(e) => failures.push(ComponentError::new(Component::Listener, e)),
        }

        match presence::bind_broadcast_socket(config.bind_addr, config.announce_addr).await {
            Ok(socket) => {
                let fut = presence::run_broadcaster(
                    socket,
                    SocketAddrV4::new(config.announce_addr, config.discovery_port),
                    identity.address,
                    identity.name.clone(),
                    config.broadcast_interval(),
                    cancel.clone(),
                );
                spawn_component(&mut tasks, &events_tx, Component::Broadcaster, fut);
            }
            Err(e) => failures.push(ComponentError::new(Component::Broadcaster, e)),
        }

        if tasks.is_empty() {
            return Err(NodeError::NothingStarted(failures));
        }
        for f in &failures {
            log::error!("{f}; continuing without it");
        }

        let table = peers.clone();
        let timeout = config.heartbeat_timeout();
        let sweep_cancel = cancel.clone();
        spawn_component(&mut tasks, &events_tx, Component::Sweeper, async move {
            peers::run_sweeper(&table, timeout, sweep_cancel).await
        });

        log::info!(
            "node up as {} ({})",
            identity.address,
            identity.name.as_deref().unwrap_or("<unnamed>")
        );
        let node = Node {
            identity,
            peers,
            transport,
            sequences,
            events: events_tx,
            cancel,
            tasks: Mutex::new(tasks),
            startup_failures: failures,
        };
        Ok((node, events_rx))
    }

    pub fn identity(&self) -> &SelfIdentity {
        &self.identity
    }

    /// Components that could not acquire their socket at start.
    pub fn startup_failures(&self) -> &[ComponentError] {
        &self.startup_failures
    }

    /// Next sequence number for an outgoing message.
    pub fn allocate_sequence(&self) -> u64 {
        self.sequences.next_sequence()
    }

    /// Send `content` with a fresh sequence number.
    pub async fn send(&self, destination: &str, content: &str) -> SendReceipt {
        let sequence = self.allocate_sequence();
        self.send_numbered(destination, content, sequence).await
    }

    /// Send with a sequence from `allocate_sequence`, so the caller can log the message
    /// before the outcome is known. The outcome is also pushed as `NodeEvent::Delivery`.
    ///
    /// `destination` must be a peer address (dotted IPv4); anything else yields
    /// `DeliveryOutcome::InvalidDestination`.
    pub async fn send_numbered(&self, destination: &str, content: &str, sequence: u64) -> SendReceipt {
        self.transport.outbox().note_sequence(sequence).await;
        let outcome = self.transport.send(content, destination, sequence).await;
        let _ = self.events.send(NodeEvent::Delivery {
            sequence,
            destination: destination.to_string(),
            outcome,
        });
        SendReceipt { sequence, outcome }
    }

    pub async fn ping(&self, destination: &str) -> bool {
        self.transport.ping(destination).await
    }

    /// Ping every known peer. Returns how many answered.
    pub async fn ping_all(&self) -> usize {
        let mut answered = 0;
        for peer in self.peers.snapshot().await {
            if self.transport.ping(&peer.address).await {
                answered += 1;
            }
        }
        answered
    }

    /// Tell `destination` we displayed its message.
    pub async fn send_seen(&self, destination: &str, content: &str) -> bool {
        self.transport.send_seen(destination, content).await
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.snapshot().await
    }

    pub fn subscribe_peers(&self) -> watch::Receiver<Vec<Peer>> {
        self.peers.subscribe()
    }

    pub async fn queued(&self) -> QueueSnapshot {
        self.transport.outbox().snapshot().await
    }

    /// Stop every loop, wait for them, and flush the offline queue.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (component, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => log::debug!("{component} stopped"),
                Ok(Err(_)) => {} // already reported when it ended
                Err(e) => log::error!("{component} task failed: {e}"),
            }
        }
        if let Err(e) = self.transport.outbox().flush().await {
            log::error!("cannot save offline queue: {e}");
        }
        log::info!("node stopped");
    }
}

fn spawn_component<F>(
    tasks: &mut Tasks,
    events: &mpsc::UnboundedSender<NodeEvent>,
    component: Component,
    fut: F,
) where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let events = events.clone();
    let handle = tokio::spawn(async move {
        let result = fut.await;
        if let Err(e) = &result {
            log::error!("{component} stopped: {e}");
            let _ = events.send(NodeEvent::ComponentStopped {
                component,
                error: e.to_string(),
            });
        }
        result
    });
    tasks.push((component, handle));
}
