//! Outbound chat connections: one line out, one `ACK` line back, queue on unreachability.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::protocol::{encode_chat_line, encode_ping_line, encode_seen_line, is_ack};
use lanchat_core::{DeliveryOutcome, QueuedMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::outbox::Outbox;

/// What came back on a chat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    Ack,
    Other(String),
}

/// Items attempted by one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub remaining: usize,
}

/// Sends chat lines to peers on the shared chat port.
#[derive(Debug, Clone)]
pub struct MessageTransport {
    port: u16,
    response_timeout: Duration,
    /// Outbound connections originate from here when it is a specific address.
    local_addr: Ipv4Addr,
    outbox: Arc<Outbox>,
}

impl MessageTransport {
    pub fn new(port: u16, response_timeout: Duration, outbox: Arc<Outbox>) -> Self {
        Self {
            port,
            response_timeout,
            local_addr: Ipv4Addr::UNSPECIFIED,
            outbox,
        }
    }

    /// Bind outbound connections to `addr` so receivers identify us by it.
    pub fn with_local_addr(mut self, addr: Ipv4Addr) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Deliver `content` to `destination`, an IPv4 address in dotted form.
    ///
    /// On a connectivity failure the message is queued (and persisted) under the address,
    /// the same key inbound connections drain by, before `Unreachable` is returned. A reply
    /// other than `ACK` is `Rejected` and not queued.
    pub async fn send(&self, content: &str, destination: &str, sequence: u64) -> DeliveryOutcome {
        let Some(ip) = parse_destination(destination) else {
            log::warn!("message #{sequence} not sent: {destination:?} is not an ipv4 address");
            return DeliveryOutcome::InvalidDestination;
        };
        match self.exchange(ip, &encode_chat_line(content)).await {
            Ok(Reply::Ack) => {
                log::debug!("message #{sequence} delivered to {ip}");
                DeliveryOutcome::Delivered
            }
            Ok(Reply::Other(reply)) => {
                log::warn!("message #{sequence} to {ip} rejected: unexpected reply {reply:?}");
                DeliveryOutcome::Rejected
            }
            Err(e) => {
                let queued = self
                    .outbox
                    .enqueue(QueuedMessage {
                        destination: ip.to_string(),
                        content: content.to_string(),
                        sequence,
                    })
                    .await;
                if queued {
                    log::info!("{ip} unreachable ({e}); message #{sequence} queued");
                } else {
                    log::debug!("{ip} unreachable ({e}); message #{sequence} stays queued");
                }
                DeliveryOutcome::Unreachable
            }
        }
    }

    /// Liveness probe. Never queued.
    pub async fn ping(&self, destination: &str) -> bool {
        self.send_control(destination, &encode_ping_line()).await
    }

    /// Read receipt for a message we displayed. Never queued.
    pub async fn send_seen(&self, destination: &str, content: &str) -> bool {
        self.send_control(destination, &encode_seen_line(content)).await
    }

    async fn send_control(&self, destination: &str, line: &str) -> bool {
        let Some(ip) = parse_destination(destination) else {
            log::debug!("control line not sent: {destination:?} is not an ipv4 address");
            return false;
        };
        match self.exchange(ip, line).await {
            Ok(Reply::Ack) => true,
            Ok(Reply::Other(reply)) => {
                log::debug!("{destination} answered {reply:?} to control line");
                false
            }
            Err(e) => {
                log::debug!("control line to {destination} failed: {e}");
                false
            }
        }
    }

    /// One pass over the queued messages for `destination`, ascending by sequence.
    ///
    /// Delivered items are removed; anything else stays queued for the next pass. Once
    /// `cancel` fires no further item is attempted. Returns None if nothing was queued or
    /// another drain for `destination` is running.
    pub async fn drain(&self, destination: &str, cancel: &CancellationToken) -> Option<DrainReport> {
        self.drain_with(destination, cancel, |_| {}).await
    }

    /// Like `drain`, calling `on_delivered` for each item that got through.
    pub async fn drain_with<F>(
        &self,
        destination: &str,
        cancel: &CancellationToken,
        mut on_delivered: F,
    ) -> Option<DrainReport>
    where
        F: FnMut(&QueuedMessage),
    {
        let batch = self.outbox.begin_drain(destination).await?;
        log::info!("retrying {} queued message(s) for {destination}", batch.len());
        let mut report = DrainReport::default();
        for (i, item) in batch.iter().enumerate() {
            if cancel.is_cancelled() {
                report.remaining += batch.len() - i;
                log::debug!("drain for {destination} stopped early");
                break;
            }
            match self.send(&item.content, destination, item.sequence).await {
                DeliveryOutcome::Delivered => {
                    if self.outbox.remove(destination, item.sequence).await {
                        report.delivered += 1;
                        on_delivered(item);
                    }
                }
                _ => report.remaining += 1,
            }
        }
        self.outbox.finish_drain(destination).await;
        Some(report)
    }

    /// Connect, write `line`, read one reply line, all under `response_timeout`.
    /// The stream is dropped (closed) when this returns, on every path.
    async fn exchange(&self, destination: Ipv4Addr, line: &str) -> std::io::Result<Reply> {
        let work = async {
            let stream = self.connect(destination).await?;
            let (reader, mut writer) = stream.into_split();
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            let mut reply = String::new();
            let n = BufReader::new(reader).read_line(&mut reply).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before reply",
                ));
            }
            Ok(if is_ack(&reply) {
                Reply::Ack
            } else {
                Reply::Other(reply.trim_end().to_string())
            })
        };
        match tokio::time::timeout(self.response_timeout, work).await {
            Ok(r) => r,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no reply within {:?}", self.response_timeout),
            )),
        }
    }

    async fn connect(&self, destination: Ipv4Addr) -> std::io::Result<TcpStream> {
        let target = SocketAddr::new(IpAddr::V4(destination), self.port);
        let socket = TcpSocket::new_v4()?;
        if !self.local_addr.is_unspecified() {
            socket.bind(SocketAddr::new(IpAddr::V4(self.local_addr), 0))?;
        }
        socket.connect(target).await
    }
}

/// Peers are keyed by IPv4 address; anything else (host names included) is refused.
fn parse_destination(destination: &str) -> Option<Ipv4Addr> {
    destination.trim().parse().ok()
}
