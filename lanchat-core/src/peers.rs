//! Peer set: known devices keyed by address, refreshed by sightings, evicted by sweep.

use std::time::{Duration, Instant};

/// A parsed discovery announcement from another device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub address: String,
    pub name: String,
}

/// A known peer. Identity key is `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: String,
    pub display_name: String,
    pub last_seen: Instant,
}

/// What `observe` did to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Joined,
    Refreshed,
    /// Known address announced a different display name.
    Renamed,
}

/// Insertion-ordered set of peers. Not synchronized; the host wraps it in a lock.
#[derive(Debug, Default, Clone)]
pub struct PeerSet {
    peers: Vec<Peer>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the peer for `sighting.address`. `last_seen` never moves backwards.
    pub fn observe(&mut self, sighting: Sighting, now: Instant) -> Observed {
        match self.peers.iter_mut().find(|p| p.address == sighting.address) {
            Some(peer) => {
                if now > peer.last_seen {
                    peer.last_seen = now;
                }
                if peer.display_name != sighting.name {
                    peer.display_name = sighting.name;
                    Observed::Renamed
                } else {
                    Observed::Refreshed
                }
            }
            None => {
                self.peers.push(Peer {
                    address: sighting.address,
                    display_name: sighting.name,
                    last_seen: now,
                });
                Observed::Joined
            }
        }
    }

    /// Remove every peer with `now - last_seen > timeout`. Returns the removed peers.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<Peer> {
        let mut removed = Vec::new();
        self.peers.retain(|p| {
            if now.saturating_duration_since(p.last_seen) > timeout {
                removed.push(p.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn get(&self, address: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.get(address).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(address: &str, name: &str) -> Sighting {
        Sighting {
            address: address.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn duplicate_announcement_keeps_one_entry() {
        let mut set = PeerSet::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(set.observe(sighting("10.0.0.2", "a"), t0), Observed::Joined);
        assert_eq!(set.observe(sighting("10.0.0.2", "a"), t1), Observed::Refreshed);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("10.0.0.2").unwrap().last_seen, t1);
    }

    #[test]
    fn last_seen_never_decreases() {
        let mut set = PeerSet::new();
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(10);
        set.observe(sighting("10.0.0.2", "a"), later);
        set.observe(sighting("10.0.0.2", "a"), t0);
        assert_eq!(set.get("10.0.0.2").unwrap().last_seen, later);
    }

    #[test]
    fn rename_updates_display_name() {
        let mut set = PeerSet::new();
        let t0 = Instant::now();
        set.observe(sighting("10.0.0.2", "old"), t0);
        assert_eq!(set.observe(sighting("10.0.0.2", "new"), t0), Observed::Renamed);
        assert_eq!(set.get("10.0.0.2").unwrap().display_name, "new");
    }

    #[test]
    fn sweep_removes_only_stale() {
        let mut set = PeerSet::new();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(15);
        set.observe(sighting("10.0.0.2", "old"), t0);
        set.observe(sighting("10.0.0.3", "fresh"), t0 + Duration::from_secs(10));
        // exactly at the timeout is still retained
        set.observe(sighting("10.0.0.4", "edge"), t0 + Duration::from_secs(5));

        let now = t0 + Duration::from_secs(20);
        let removed = set.sweep(now, timeout);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].address, "10.0.0.2");
        assert_eq!(set.len(), 2);
        for p in set.snapshot() {
            assert!(now.duration_since(p.last_seen) <= timeout);
        }
        assert!(set.sweep(now, timeout).is_empty());
    }

    #[test]
    fn snapshot_keeps_insertion_order() {
        let mut set = PeerSet::new();
        let t0 = Instant::now();
        set.observe(sighting("10.0.0.9", "z"), t0);
        set.observe(sighting("10.0.0.1", "a"), t0);
        set.observe(sighting("10.0.0.9", "z"), t0 + Duration::from_secs(1));
        let order: Vec<_> = set.snapshot().into_iter().map(|p| p.address).collect();
        assert_eq!(order, vec!["10.0.0.9", "10.0.0.1"]);
    }

    #[test]
    fn interleaved_observe_and_sweep_never_duplicates() {
        let mut set = PeerSet::new();
        let t0 = Instant::now();
        let timeout = Duration::from_secs(3);
        let addrs = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];
        for step in 0u64..40 {
            let now = t0 + Duration::from_secs(step);
            let addr = addrs[(step as usize * 7) % addrs.len()];
            if step % 5 != 4 {
                set.observe(sighting(addr, "n"), now);
            } else {
                set.sweep(now, timeout);
                for p in set.snapshot() {
                    assert!(now.duration_since(p.last_seen) <= timeout);
                }
            }
            let mut seen: Vec<_> = set.snapshot().into_iter().map(|p| p.address).collect();
            let total = seen.len();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), total);
        }
    }
}
