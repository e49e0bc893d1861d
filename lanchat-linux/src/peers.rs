//! Shared peer table: sightings from the listener, eviction from the heartbeat sweep,
//! snapshots for the chat session.

use std::time::{Duration, Instant};

use lanchat_core::{Observed, Peer, PeerSet, Sighting};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Peer set behind one lock. Subscribers get a fresh snapshot after every observe and
/// every sweep that removed something; it is published while the lock is held, so a
/// snapshot is never half-updated.
#[derive(Debug)]
pub struct PeerTable {
    peers: Mutex<PeerSet>,
    updates: watch::Sender<Vec<Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            peers: Mutex::new(PeerSet::new()),
            updates,
        }
    }

    pub async fn observe(&self, sighting: Sighting) -> Observed {
        self.observe_at(sighting, Instant::now()).await
    }

    pub async fn observe_at(&self, sighting: Sighting, now: Instant) -> Observed {
        let mut peers = self.peers.lock().await;
        let address = sighting.address.clone();
        let name = sighting.name.clone();
        let observed = peers.observe(sighting, now);
        match observed {
            Observed::Joined => log::info!("peer joined: {address} ({name})"),
            Observed::Renamed => log::info!("peer {address} is now called {name}"),
            Observed::Refreshed => log::trace!("peer refreshed: {address}"),
        }
        self.updates.send_replace(peers.snapshot());
        observed
    }

    /// Evict peers silent for longer than `timeout`. Returns how many were removed.
    pub async fn sweep(&self, now: Instant, timeout: Duration) -> usize {
        let mut peers = self.peers.lock().await;
        let removed = peers.sweep(now, timeout);
        for p in &removed {
            log::info!("peer timed out: {} ({})", p.address, p.display_name);
        }
        if !removed.is_empty() {
            self.updates.send_replace(peers.snapshot());
        }
        removed.len()
    }

    pub async fn snapshot(&self) -> Vec<Peer> {
        self.peers.lock().await.snapshot()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.peers.lock().await.contains(address)
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Peer>> {
        self.updates.subscribe()
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply sightings handed off by the presence listener until cancelled or the channel closes.
pub async fn apply_sightings(
    table: &PeerTable,
    mut sightings: mpsc::Receiver<Sighting>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = sightings.recv() => match next {
                Some(s) => {
                    table.observe(s).await;
                }
                None => break,
            },
        }
    }
}

/// Heartbeat sweep: every `timeout`, evict peers not heard from within `timeout`.
pub async fn run_sweeper(
    table: &PeerTable,
    timeout: Duration,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut ticker = tokio::time::interval(timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let removed = table.sweep(Instant::now(), timeout).await;
                if removed > 0 {
                    log::debug!("heartbeat sweep evicted {removed} peer(s)");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(address: &str) -> Sighting {
        Sighting {
            address: address.to_string(),
            name: "dev".to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_see_observe_and_sweep() {
        let table = PeerTable::new();
        let mut rx = table.subscribe();
        let t0 = Instant::now();

        table.observe_at(sighting("10.0.0.2"), t0).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        // empty sweep does not notify
        assert_eq!(table.sweep(t0, Duration::from_secs(15)).await, 0);
        assert!(!rx.has_changed().unwrap());

        let later = t0 + Duration::from_secs(16);
        assert_eq!(table.sweep(later, Duration::from_secs(15)).await, 1);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn same_announcement_twice_is_one_peer() {
        let table = PeerTable::new();
        let t0 = Instant::now();
        table.observe_at(sighting("10.0.0.2"), t0).await;
        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(
            table.observe_at(sighting("10.0.0.2"), t1).await,
            Observed::Refreshed
        );
        let snap = table.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].last_seen, t1);
    }

    #[tokio::test]
    async fn sightings_channel_feeds_table() {
        let table = PeerTable::new();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tx.send(sighting("10.0.0.2")).await.unwrap();
        tx.send(sighting("10.0.0.3")).await.unwrap();
        drop(tx);
        apply_sightings(&table, rx, cancel).await;
        assert!(table.contains("10.0.0.2").await);
        assert!(table.contains("10.0.0.3").await);
    }

    #[tokio::test]
    async fn sweeper_evicts_and_stops_on_cancel() {
        let table = PeerTable::new();
        table.observe(sighting("10.0.0.2")).await;
        let cancel = CancellationToken::new();
        let timeout = Duration::from_millis(50);

        let stop = cancel.clone();
        let sweep = async {
            run_sweeper(&table, timeout, stop).await.unwrap();
        };
        let check = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(table.snapshot().await.is_empty());
            cancel.cancel();
        };
        tokio::join!(sweep, check);
    }
}
