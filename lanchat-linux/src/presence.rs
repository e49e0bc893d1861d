//! LAN presence: periodic `DISCOVER` datagrams out, sightings of other devices in.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use lanchat_core::protocol::{encode_announcement, parse_announcement, MAX_DATAGRAM_LEN};
use lanchat_core::Sighting;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sightings buffered between the receive loop and the peer table.
pub const SIGHTING_BACKLOG: usize = 256;

/// Socket for sending announcements to `target` (broadcast or multicast).
pub async fn bind_broadcast_socket(bind: Ipv4Addr, target: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((bind, 0)).await?;
    if target.is_multicast() {
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;
    } else {
        socket.set_broadcast(true)?;
    }
    Ok(socket)
}

/// Socket bound to the discovery port. Joins `group` when it is a multicast address.
pub async fn bind_listener_socket(
    bind: Ipv4Addr,
    port: u16,
    group: Ipv4Addr,
) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((bind, port)).await?;
    socket.set_broadcast(true)?;
    if group.is_multicast() {
        socket.join_multicast_v4(group, bind)?;
    }
    Ok(socket)
}

/// Announce `DISCOVER:<address>:<name>` to `target` every `interval` until cancelled.
///
/// Sends nothing while the name is unknown. Send errors are logged and the loop goes on.
/// The socket is owned here and closed on every exit path.
pub async fn run_broadcaster(
    socket: UdpSocket,
    target: SocketAddrV4,
    self_address: Ipv4Addr,
    self_name: Option<String>,
    interval: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let datagram = match self_name.as_deref().map(|n| encode_announcement(self_address, n)) {
        Some(Ok(line)) => Some(line),
        Some(Err(e)) => {
            log::warn!("not announcing presence: {e}");
            None
        }
        None => {
            log::warn!("not announcing presence: display name unknown");
            None
        }
    };
    let target = SocketAddr::V4(target);
    let mut failing = false;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if let Some(line) = &datagram {
            match socket.send_to(line.as_bytes(), target).await {
                Ok(_) => {
                    if failing {
                        log::info!("presence broadcast to {target} recovered");
                        failing = false;
                    }
                    log::trace!("announced presence to {target}");
                }
                Err(e) => {
                    // keep logging at debug until it recovers
                    if !failing {
                        log::warn!("presence broadcast to {target} failed: {e}");
                        failing = true;
                    } else {
                        log::debug!("presence broadcast to {target} failed: {e}");
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    log::debug!("presence broadcaster stopped");
    Ok(())
}

/// Receive announcements, drop malformed and self-originated ones, and hand sightings to
/// `sightings` without waiting. A full backlog drops the sighting; the next announcement
/// from that peer refreshes it anyway.
pub async fn run_listener(
    socket: UdpSocket,
    self_address: Ipv4Addr,
    sightings: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let me = self_address.to_string();
    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) if is_transient(&e) => {
                    log::debug!("presence receive error: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            },
        };
        let Ok(text) = std::str::from_utf8(&buf[..n]) else {
            log::trace!("dropping non-utf8 datagram from {from}");
            continue;
        };
        let sighting = match parse_announcement(text) {
            Ok(s) => s,
            Err(e) => {
                log::trace!("dropping datagram from {from}: {e}");
                continue;
            }
        };
        if sighting.address == me {
            continue;
        }
        match sightings.try_send(sighting) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(s)) => {
                log::debug!("sighting backlog full, dropping {}", s.address);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    log::debug!("presence listener stopped");
    Ok(())
}

/// Errors a datagram socket can report for one bad packet (e.g. ICMP feedback) without
/// the socket itself being broken.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}
