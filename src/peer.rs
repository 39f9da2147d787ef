use crate::stats::PeerRecord;
use crate::wire::{self, WireError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Frames buffered per peer before broadcast starts dropping for that peer.
pub const EGRESS_QUEUE: usize = 1000;

/// Parent id of peers attached directly to this node.
pub const LOCAL_PARENT: &str = "Local";

/// One connected peer. Traffic counters are atomics so the two link streams
/// and stats readers never contend; the rest sits behind a short-lived lock.
pub struct Peer {
    pub id: String,
    pub remote: SocketAddr,
    pub connected_at: SystemTime,
    pub cancel: CancellationToken,
    egress: mpsc::Sender<Bytes>,

    sent_bytes: AtomicU64,
    recv_bytes: AtomicU64,
    sent_pkts: AtomicU64,
    recv_pkts: AtomicU64,
    errors: AtomicU64,
    queue_drops: AtomicU64,

    info: Mutex<PeerInfo>,
}

struct PeerInfo {
    last_seen: SystemTime,
    hostname: String,
    parent_id: String,
    num_children: usize,
    max_children: usize,
    country: String,
    city: String,
    lat: f64,
    lon: f64,
    whois: String,
}

impl Peer {
    pub fn new(
        id: String,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (egress, egress_rx) = mpsc::channel(EGRESS_QUEUE);
        let peer = Arc::new(Self {
            id,
            remote,
            connected_at: SystemTime::now(),
            cancel,
            egress,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
            sent_pkts: AtomicU64::new(0),
            recv_pkts: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            info: Mutex::new(PeerInfo {
                last_seen: SystemTime::now(),
                hostname: String::new(),
                parent_id: LOCAL_PARENT.to_string(),
                num_children: 0,
                max_children: 0,
                country: String::new(),
                city: String::new(),
                lat: 0.0,
                lon: 0.0,
                whois: String::new(),
            }),
        });
        (peer, egress_rx)
    }

    /// Non-blocking handoff to the send stream. A full queue loses the frame
    /// for this peer only.
    pub fn enqueue(&self, frame: Bytes) -> bool {
        match self.egress.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.queue_drops.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn bump_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parent_id(&self) -> String {
        self.info.lock().unwrap().parent_id.clone()
    }

    pub fn is_local_child(&self) -> bool {
        self.info.lock().unwrap().parent_id == LOCAL_PARENT
    }

    pub fn set_topology(&self, parent_id: &str, num_children: usize, max_children: usize) {
        let mut info = self.info.lock().unwrap();
        info.parent_id = parent_id.to_string();
        info.num_children = num_children;
        info.max_children = max_children;
    }

    pub fn set_child_count(&self, num_children: usize, max_children: usize) {
        let mut info = self.info.lock().unwrap();
        info.num_children = num_children;
        info.max_children = max_children;
    }

    /// Called by the enrichment collaborator once GeoIP/rDNS results land.
    pub fn apply_enrichment(
        &self,
        country: &str,
        city: &str,
        lat: f64,
        lon: f64,
        hostname: &str,
        whois: &str,
    ) {
        let mut info = self.info.lock().unwrap();
        info.country = country.to_string();
        info.city = city.to_string();
        info.lat = lat;
        info.lon = lon;
        info.hostname = hostname.to_string();
        info.whois = whois.to_string();
    }

    fn touch(&self) {
        self.info.lock().unwrap().last_seen = SystemTime::now();
    }

    /// Synthetic traffic for demo mode.
    pub fn bump_demo(&self, seed: u64) {
        self.sent_bytes.fetch_add(500 + seed % 1000, Ordering::Relaxed);
        self.recv_bytes.fetch_add(400 + seed % 1000, Ordering::Relaxed);
        self.sent_pkts.fetch_add(1 + seed % 5, Ordering::Relaxed);
        self.recv_pkts.fetch_add(1 + seed % 5, Ordering::Relaxed);
        self.touch();
    }

    /// Deep copy for the stats snapshot.
    pub fn record(&self) -> PeerRecord {
        let info = self.info.lock().unwrap();
        PeerRecord {
            id: self.id.clone(),
            ip: self.remote.ip(),
            connected_at: self.connected_at,
            last_seen: info.last_seen,
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            sent_pkts: self.sent_pkts.load(Ordering::Relaxed),
            recv_pkts: self.recv_pkts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            hostname: info.hostname.clone(),
            parent_id: info.parent_id.clone(),
            num_children: info.num_children,
            max_children: info.max_children,
            country: info.country.clone(),
            city: info.city.clone(),
            lat: info.lat,
            lon: info.lon,
            whois: info.whois.clone(),
        }
    }
}

/// Drives an admitted link to termination: a send stream consuming the
/// egress queue and a receive stream feeding the relay's peer-ingress
/// channel. Either side failing, EOF, or cancellation tears down both; the
/// socket closes when the halves drop.
pub async fn run_link<S>(
    stream: S,
    peer: Arc<Peer>,
    mut egress_rx: mpsc::Receiver<Bytes>,
    ingress: mpsc::Sender<Bytes>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(stream);
    let cancel = peer.cancel.clone();

    let send_peer = peer.clone();
    let send_cancel = cancel.clone();
    let sender = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = send_cancel.cancelled() => break,
                maybe = egress_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    // The write itself stays cancellable: a wedged socket
                    // must not stall disconnects or bans.
                    let written = tokio::select! {
                        _ = send_cancel.cancelled() => break,
                        res = wire::write_frame(&mut wr, &frame) => res,
                    };
                    if let Err(e) = written {
                        error!("peer {} send error: {}", send_peer.id, e);
                        send_peer.bump_error();
                        break;
                    }
                    send_peer.sent_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    send_peer.sent_pkts.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        // Unblock the receive stream if we broke first.
        send_cancel.cancel();
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = wire::read_frame(&mut rd) => match res {
                Ok(frame) => {
                    peer.recv_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
                    peer.recv_pkts.fetch_add(1, Ordering::Relaxed);
                    peer.touch();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = ingress.send(frame) => if sent.is_err() { break },
                    }
                }
                Err(e) if e.is_eof() => {
                    debug!("peer {} disconnected", peer.id);
                    break;
                }
                Err(WireError::FrameTooLarge(len)) => {
                    error!("peer {} sent oversized frame ({} bytes)", peer.id, len);
                    peer.bump_error();
                    break;
                }
                Err(e) => {
                    error!("peer {} recv error: {}", peer.id, e);
                    peer.bump_error();
                    break;
                }
            }
        }
    }

    cancel.cancel();
    if sender.await.is_err() {
        error!("peer {} send stream panicked", peer.id);
    }
    info!("peer {} link closed", peer.id);
}
