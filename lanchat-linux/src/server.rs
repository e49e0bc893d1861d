//! Inbound chat connections: read one line, report it, answer `ACK`, then retry whatever
//! is queued for the peer that just proved it is reachable.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use lanchat_core::protocol::{parse_chat_line, ACK};
use lanchat_core::ChatLine;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::events::NodeEvent;
use crate::transport::MessageTransport;

/// Longest message line accepted; the rest of an oversized line is ignored.
const MAX_LINE_LEN: u64 = 64 * 1024;

pub async fn bind_server(bind: Ipv4Addr, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((bind, port)).await
}

/// Accept loop. Connections are handled one at a time; each is closed before the drain
/// for its peer is started. Drains run in the background; on shutdown they stop before
/// their next item and are awaited.
pub async fn run_server(
    listener: TcpListener,
    transport: Arc<MessageTransport>,
    read_timeout: Duration,
    events: mpsc::UnboundedSender<NodeEvent>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut drains = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = drains.join_next(), if !drains.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, from) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let peer = from.ip().to_string();
                if let Err(e) = handle_connection(stream, &peer, read_timeout, &events).await {
                    log::debug!("connection from {peer}: {e}");
                }
                let transport = transport.clone();
                let events = events.clone();
                let cancel = cancel.clone();
                drains.spawn(async move {
                    drain_for(&transport, &peer, &events, &cancel).await;
                });
            }
        }
    }
    drop(listener);
    while drains.join_next().await.is_some() {}
    log::debug!("message server stopped");
    Ok(())
}

/// Read one line, surface it, acknowledge it. The stream is closed on return.
async fn handle_connection(
    stream: TcpStream,
    peer: &str,
    timeout: Duration,
    events: &mpsc::UnboundedSender<NodeEvent>,
) -> std::io::Result<()> {
    let work = async {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader.take(MAX_LINE_LEN));
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        match parse_chat_line(&line) {
            ChatLine::Ping => log::debug!("ping from {peer}"),
            ChatLine::Seen(content) => {
                let _ = events.send(NodeEvent::Seen {
                    from: peer.to_string(),
                    content,
                });
            }
            ChatLine::Text(content) => {
                log::debug!("message from {peer} ({} bytes)", content.len());
                let _ = events.send(NodeEvent::MessageReceived {
                    from: peer.to_string(),
                    content,
                });
            }
        }
        writer.write_all(format!("{ACK}\n").as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await
    };
    match tokio::time::timeout(timeout, work).await {
        Ok(r) => r,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no complete line in time",
        )),
    }
}

async fn drain_for(
    transport: &MessageTransport,
    peer: &str,
    events: &mpsc::UnboundedSender<NodeEvent>,
    cancel: &CancellationToken,
) {
    let report = transport
        .drain_with(peer, cancel, |item| {
            let _ = events.send(NodeEvent::Redelivered {
                destination: item.destination.clone(),
                sequence: item.sequence,
                content: item.content.clone(),
            });
        })
        .await;
    if let Some(r) = report {
        log::info!(
            "drain for {peer}: {} delivered, {} still queued",
            r.delivered,
            r.remaining
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Outbox;

    /// Server on loopback whose transport targets the same port, so drains loop back to it.
    async fn start(
        outbox: Arc<Outbox>,
    ) -> (
        u16,
        mpsc::UnboundedReceiver<NodeEvent>,
        CancellationToken,
        tokio::task::JoinHandle<std::io::Result<()>>,
    ) {
        let listener = bind_server(Ipv4Addr::LOCALHOST, 0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = Arc::new(MessageTransport::new(
            port,
            Duration::from_secs(2),
            outbox,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_server(
            listener,
            transport,
            Duration::from_secs(2),
            tx,
            cancel.clone(),
        ));
        (port, rx, cancel, task)
    }

    async fn exchange(port: u16, line: &str) -> String {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let (r, mut w) = stream.into_split();
        w.write_all(line.as_bytes()).await.unwrap();
        let mut reply = String::new();
        BufReader::new(r).read_line(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn message_is_reported_then_acked() {
        let (port, mut rx, cancel, task) = start(Arc::new(Outbox::in_memory())).await;
        assert_eq!(exchange(port, "hello\n").await, "ACK\n");
        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::MessageReceived {
                from: "127.0.0.1".into(),
                content: "hello".into()
            }
        );
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ping_is_acked_but_not_surfaced() {
        let (port, mut rx, cancel, task) = start(Arc::new(Outbox::in_memory())).await;
        assert_eq!(exchange(port, "ping\n").await, "ACK\n");
        assert_eq!(exchange(port, "SEEN:hi\n").await, "ACK\n");
        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::Seen {
                from: "127.0.0.1".into(),
                content: "hi".into()
            }
        );
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_connection_drains_queue_for_that_peer() {
        let outbox = Arc::new(Outbox::in_memory());
        outbox
            .enqueue(lanchat_core::QueuedMessage {
                destination: "127.0.0.1".into(),
                content: "queued".into(),
                sequence: 9,
            })
            .await;
        let (port, mut rx, cancel, task) = start(outbox.clone()).await;

        exchange(port, "ping\n").await;

        let mut got_redelivered = false;
        let mut got_message = false;
        while !(got_redelivered && got_message) {
            match tokio::time::timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap() {
                NodeEvent::Redelivered { sequence, .. } => {
                    assert_eq!(sequence, 9);
                    got_redelivered = true;
                }
                NodeEvent::MessageReceived { content, .. } => {
                    assert_eq!(content, "queued");
                    got_message = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(outbox.is_empty().await);
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn text_that_looks_like_a_receipt_is_still_a_message() {
        let (port, mut rx, cancel, task) = start(Arc::new(Outbox::in_memory())).await;
        let sender = MessageTransport::new(port, Duration::from_secs(2), Arc::new(Outbox::in_memory()));
        assert_eq!(
            sender.send("SEEN:the plan", "127.0.0.1", 1).await,
            lanchat_core::DeliveryOutcome::Delivered
        );
        assert_eq!(sender.send("ping", "127.0.0.1", 2).await, lanchat_core::DeliveryOutcome::Delivered);
        for content in ["SEEN:the plan", "ping"] {
            assert_eq!(
                rx.recv().await.unwrap(),
                NodeEvent::MessageReceived {
                    from: "127.0.0.1".into(),
                    content: content.into()
                }
            );
        }
        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
