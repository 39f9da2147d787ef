use crate::peer::Peer;
use crate::stats::PeerRecord;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("peer id is banned")]
    BannedId,
    #[error("peer host is banned")]
    BannedHost,
    #[error("max child connections reached")]
    ChildLimitReached,
}

/// Thread-safe peer table plus the deny lists and the local child bound.
///
/// Writers (admission, removal, bans) take the map write lock briefly and do
/// no I/O under it. Broadcast and snapshots run under the read lock;
/// broadcast never blocks because the per-peer queues are non-blocking.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    banned_ids: RwLock<Vec<String>>,
    banned_hosts: RwLock<Vec<String>>,
    max_children: AtomicUsize,
}

impl PeerRegistry {
    pub fn new(banned_ids: Vec<String>, banned_hosts: Vec<String>, max_children: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            banned_ids: RwLock::new(banned_ids),
            banned_hosts: RwLock::new(banned_hosts),
            max_children: AtomicUsize::new(max_children),
        }
    }

    pub fn set_max_children(&self, max_children: usize) {
        self.max_children.store(max_children, Ordering::Relaxed);
    }

    pub fn max_children(&self) -> usize {
        self.max_children.load(Ordering::Relaxed)
    }

    fn local_children(&self, peers: &HashMap<String, Arc<Peer>>) -> usize {
        peers.values().filter(|p| p.is_local_child()).count()
    }

    fn check_deny_lists(&self, id: &str, host: &str) -> Result<(), RejectionReason> {
        if self.banned_ids.read().unwrap().iter().any(|b| b == id) {
            return Err(RejectionReason::BannedId);
        }
        if self.banned_hosts.read().unwrap().iter().any(|b| b == host) {
            return Err(RejectionReason::BannedHost);
        }
        Ok(())
    }

    /// Cheap pre-handshake gate so banned or over-limit connections are
    /// refused before any handshake bytes go out. Admission proper happens
    /// at `insert`, after the key exchange.
    pub fn check_admissible(&self, id: &str, host: &str) -> Result<(), RejectionReason> {
        self.check_deny_lists(id, host)?;
        let peers = self.peers.read().unwrap();
        if self.local_children(&peers) >= self.max_children() {
            return Err(RejectionReason::ChildLimitReached);
        }
        Ok(())
    }

    /// Admits a peer that has passed the handshake. Deny lists and the child
    /// bound are re-validated under the write lock, so concurrent handshakes
    /// cannot overshoot `max_children`.
    pub fn insert(&self, peer: Arc<Peer>) -> Result<(), RejectionReason> {
        let host = peer.remote.ip().to_string();
        self.check_deny_lists(&peer.id, &host)?;

        let mut peers = self.peers.write().unwrap();
        if peer.is_local_child() && self.local_children(&peers) >= self.max_children() {
            return Err(RejectionReason::ChildLimitReached);
        }
        peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Demo-mode insertion: synthetic peers skip admission entirely.
    pub fn insert_unchecked(&self, peer: Arc<Peer>) {
        self.peers.write().unwrap().insert(peer.id.clone(), peer);
    }

    /// Idempotent.
    pub fn remove(&self, id: &str) {
        self.peers.write().unwrap().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels the link; stream teardown performs the removal.
    pub fn disconnect(&self, id: &str) {
        if let Some(peer) = self.get(id) {
            peer.cancel.cancel();
        }
    }

    /// Appends to the deny lists (no duplicates) and severs any live link
    /// matching the banned id or host.
    pub fn ban(&self, id: &str, host: &str) {
        if !id.is_empty() {
            let mut ids = self.banned_ids.write().unwrap();
            if !ids.iter().any(|b| b == id) {
                ids.push(id.to_string());
            }
        }
        if !host.is_empty() {
            let mut hosts = self.banned_hosts.write().unwrap();
            if !hosts.iter().any(|b| b == host) {
                hosts.push(host.to_string());
            }
        }

        let peers = self.peers.read().unwrap();
        for peer in peers.values() {
            if peer.id == id || (!host.is_empty() && peer.remote.ip().to_string() == host) {
                info!("severing banned peer {}", peer.id);
                peer.cancel.cancel();
            }
        }
    }

    pub fn banned_ids(&self) -> Vec<String> {
        self.banned_ids.read().unwrap().clone()
    }

    pub fn banned_hosts(&self) -> Vec<String> {
        self.banned_hosts.read().unwrap().clone()
    }

    /// Deep copy of every peer record, unsorted; the stats assembler orders
    /// it.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let peers = self.peers.read().unwrap();
        peers.values().map(|p| p.record()).collect()
    }

    pub fn peer_arcs(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().unwrap();
        peers.values().cloned().collect()
    }

    /// Fan-out: non-blocking enqueue on every live peer. Full queues lose
    /// the frame for that peer only; the aggregate pipeline never stalls on
    /// one slow link.
    pub fn broadcast(&self, frame: &Bytes) {
        let peers = self.peers.read().unwrap();
        for peer in peers.values() {
            peer.enqueue(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn peer(id: &str, addr: &str) -> Arc<Peer> {
        let (peer, _rx) = Peer::new(id.to_string(), addr.parse().unwrap(), CancellationToken::new());
        peer
    }

    #[test]
    fn test_admission_and_removal() {
        let reg = PeerRegistry::new(vec![], vec![], 5);
        reg.insert(peer("a", "10.0.0.1:1000")).unwrap();
        assert_eq!(reg.len(), 1);
        reg.remove("a");
        reg.remove("a"); // idempotent
        assert!(reg.is_empty());
    }

    #[test]
    fn test_banned_id_rejected() {
        let reg = PeerRegistry::new(vec!["bad".to_string()], vec![], 5);
        assert_eq!(
            reg.check_admissible("bad", "10.0.0.1"),
            Err(RejectionReason::BannedId)
        );
        assert_eq!(
            reg.insert(peer("bad", "10.0.0.1:1000")),
            Err(RejectionReason::BannedId)
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn test_banned_host_rejected() {
        let reg = PeerRegistry::new(vec![], vec!["10.0.0.9".to_string()], 5);
        assert_eq!(
            reg.insert(peer("x", "10.0.0.9:1000")),
            Err(RejectionReason::BannedHost)
        );
    }

    #[test]
    fn test_child_limit() {
        let reg = PeerRegistry::new(vec![], vec![], 2);
        reg.insert(peer("a", "10.0.0.1:1000")).unwrap();
        reg.insert(peer("b", "10.0.0.2:1000")).unwrap();
        assert_eq!(
            reg.insert(peer("c", "10.0.0.3:1000")),
            Err(RejectionReason::ChildLimitReached)
        );
        assert_eq!(reg.len(), 2);

        // A disconnect frees a slot, but only for future admissions.
        reg.remove("a");
        reg.insert(peer("c", "10.0.0.3:1000")).unwrap();
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_child_limit_ignores_non_local_peers() {
        let reg = PeerRegistry::new(vec![], vec![], 1);
        let remote_child = peer("far", "10.0.0.7:1000");
        remote_child.set_topology("some-other-node", 0, 0);
        reg.insert_unchecked(remote_child);

        // One slot is still free: the non-local peer does not count.
        reg.insert(peer("near", "10.0.0.8:1000")).unwrap();
        assert_eq!(
            reg.insert(peer("late", "10.0.0.9:1000")),
            Err(RejectionReason::ChildLimitReached)
        );
    }

    #[test]
    fn test_ban_appends_once_and_severs() {
        let reg = PeerRegistry::new(vec![], vec![], 5);
        let p = peer("victim", "1.2.3.4:5678");
        reg.insert(p.clone()).unwrap();

        reg.ban("victim", "1.2.3.4");
        reg.ban("victim", "1.2.3.4");
        assert_eq!(reg.banned_ids(), vec!["victim"]);
        assert_eq!(reg.banned_hosts(), vec!["1.2.3.4"]);
        assert!(p.cancel.is_cancelled());
    }

    #[test]
    fn test_broadcast_reaches_all_queues() {
        let reg = PeerRegistry::new(vec![], vec![], 5);
        let (pa, mut rx_a) = Peer::new(
            "a".to_string(),
            "10.0.0.1:1000".parse().unwrap(),
            CancellationToken::new(),
        );
        let (pb, mut rx_b) = Peer::new(
            "b".to_string(),
            "10.0.0.2:1000".parse().unwrap(),
            CancellationToken::new(),
        );
        reg.insert(pa).unwrap();
        reg.insert(pb).unwrap();

        reg.broadcast(&Bytes::from_static(&[0x01]));
        assert_eq!(&rx_a.try_recv().unwrap()[..], &[0x01]);
        assert_eq!(&rx_b.try_recv().unwrap()[..], &[0x01]);
    }
}
