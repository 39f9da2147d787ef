use crate::capture::Capture;
use crate::config::{Config, ConfigError};
use crate::dedup::DedupStore;
use crate::logbuf::LogBuffer;
use crate::peer::{self, Peer, LOCAL_PARENT};
use crate::registry::PeerRegistry;
use crate::stats::{self, DemoProps, Stats, StatsInputs};
use crate::transport::{self, PeerStream, TransportError, VerifyPolicy};
use crate::wire;
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Depth of the capture-ingress and peer-ingress channels.
const CHANNEL_DEPTH: usize = 1000;

/// Backoff between outbound dial attempts.
const REDIAL_DELAY: Duration = Duration::from_secs(5);

const DEMO_TICK: Duration = Duration::from_secs(1);
const DEMO_PEER_PREFIX: &str = "demo-node-";

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("TLS setup: {0}")]
    Transport(#[from] TransportError),
}

/// The relay data plane: owns the dedup store, the ingress channels and the
/// aggregate counters, and orchestrates the listener, the outbound dialers
/// and the per-peer links.
pub struct RelayEngine {
    cfg: Mutex<Config>,
    config_path: Option<PathBuf>,
    registry: Arc<PeerRegistry>,
    capture: Arc<dyn Capture>,
    dedup: DedupStore,
    logs: Arc<LogBuffer>,
    cancel: CancellationToken,
    started_at: Instant,

    total_received: AtomicU64,
    total_forwarded: AtomicU64,
    total_dropped: AtomicU64,
    total_errors: AtomicU64,

    capture_error: Mutex<String>,
    bound_addr: Mutex<Option<SocketAddr>>,

    demo_mode: AtomicBool,
    demo: Mutex<DemoProps>,

    ingress_tx: mpsc::Sender<Bytes>,
    ingress_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl RelayEngine {
    pub fn new(
        cfg: Config,
        config_path: Option<PathBuf>,
        capture: Arc<dyn Capture>,
        logs: Arc<LogBuffer>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ConfigError> {
        let dedup = DedupStore::new(
            cfg.dedup_cache_size,
            Duration::from_secs(cfg.dedup_cache_ttl),
        )?;
        let registry = Arc::new(PeerRegistry::new(
            cfg.banned_ids.clone(),
            cfg.banned_hosts.clone(),
            cfg.max_children,
        ));
        let (ingress_tx, ingress_rx) = mpsc::channel(CHANNEL_DEPTH);

        Ok(Arc::new(Self {
            cfg: Mutex::new(cfg),
            config_path,
            registry,
            capture,
            dedup,
            logs,
            cancel,
            started_at: Instant::now(),
            total_received: AtomicU64::new(0),
            total_forwarded: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            capture_error: Mutex::new(String::new()),
            bound_addr: Mutex::new(None),
            demo_mode: AtomicBool::new(false),
            demo: Mutex::new(DemoProps::default()),
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
        }))
    }

    /// Launches the data plane: capture reader, listener, one dialer per
    /// configured peer, and the fan-out loop. In demo mode only the demo
    /// driver runs.
    pub async fn start(self: Arc<Self>) -> Result<(), StartError> {
        if self.demo_mode.load(Ordering::Relaxed) {
            tokio::spawn(run_demo(self.clone()));
            return Ok(());
        }

        let (capture_tx, capture_rx) = mpsc::channel(CHANNEL_DEPTH);
        match self.capture.start(self.cancel.child_token(), capture_tx) {
            Ok(()) => self.capture_error.lock().unwrap().clear(),
            Err(e) => {
                // The relay stays up for peer-to-peer traffic either way.
                error!("capture error: {}", e);
                *self.capture_error.lock().unwrap() = e.to_string();
            }
        }

        let (listen_addr, disable_ssl, cert_path, key_path, peers) = {
            let cfg = self.cfg.lock().unwrap();
            (
                cfg.listen_addr.clone(),
                cfg.disable_ssl,
                cfg.tls_cert_path.clone(),
                cfg.tls_key_path.clone(),
                cfg.peers.clone(),
            )
        };

        let acceptor = if disable_ssl {
            warn!("TLS disabled; accepting plaintext peer links");
            None
        } else {
            if cert_path.is_empty() || key_path.is_empty() {
                return Err(ConfigError::MissingTlsMaterial.into());
            }
            Some(transport::build_acceptor(&cert_path, &key_path)?)
        };

        match TcpListener::bind(&listen_addr).await {
            Ok(listener) => {
                if let Ok(addr) = listener.local_addr() {
                    info!("listening for peers on {}", addr);
                    *self.bound_addr.lock().unwrap() = Some(addr);
                }
                tokio::spawn(accept_loop(self.clone(), listener, acceptor));
            }
            Err(e) => error!("failed to listen on {}: {}", listen_addr, e),
        }

        for addr in peers {
            tokio::spawn(dial_loop(self.clone(), addr));
        }

        tokio::spawn(fanout_loop(self.clone(), capture_rx));
        Ok(())
    }

    /// The address the listener actually bound, once it has.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    pub fn collect_stats(&self) -> Stats {
        let (sort_field, sort_reverse, listen_addr, max_children) = {
            let cfg = self.cfg.lock().unwrap();
            (
                cfg.sort_field.clone(),
                cfg.sort_reverse,
                cfg.listen_addr.clone(),
                cfg.max_children,
            )
        };
        let demo = self.demo_mode.load(Ordering::Relaxed);
        let mut capture_error = self.capture_error.lock().unwrap().clone();
        if demo && capture_error.is_empty() {
            capture_error = "[DEMO MODE ACTIVE]".to_string();
        }

        stats::assemble(StatsInputs {
            total_received: self.total_received.load(Ordering::Relaxed),
            total_forwarded: self.total_forwarded.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
            peers: self.registry.snapshot(),
            capture_error,
            sort_field,
            sort_reverse,
            listen_addr,
            max_children,
            logs: self.logs.snapshot(),
            demo_props: if demo {
                Some(*self.demo.lock().unwrap())
            } else {
                None
            },
        })
    }

    pub fn set_sort_field(&self, field: &str) {
        self.cfg.lock().unwrap().sort_field = field.to_string();
        self.persist_config();
    }

    pub fn set_sort_reverse(&self, reverse: bool) {
        self.cfg.lock().unwrap().sort_reverse = reverse;
        self.persist_config();
    }

    /// Admin-facing settings update. Empty strings leave the stored value
    /// untouched; a zero max_children is ignored.
    pub fn update_config(
        &self,
        admin_pass: &str,
        max_children: usize,
        network_key: &str,
        rebalance_enabled: bool,
        rebalance_interval: u64,
    ) {
        {
            let mut cfg = self.cfg.lock().unwrap();
            if !admin_pass.is_empty() {
                cfg.admin_pass = admin_pass.to_string();
            }
            if max_children > 0 {
                cfg.max_children = max_children;
                self.registry.set_max_children(max_children);
            }
            if !network_key.is_empty() {
                cfg.network_key = network_key.to_string();
            }
            cfg.rebalance_enabled = rebalance_enabled;
            if rebalance_interval > 0 {
                cfg.rebalance_interval = rebalance_interval;
            }
        }
        self.persist_config();
    }

    pub fn set_demo_mode(&self, enabled: bool) {
        self.demo_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn update_demo_props(
        &self,
        packet_rate: u64,
        drop_rate: u64,
        error_rate: u64,
        num_peers: usize,
    ) {
        *self.demo.lock().unwrap() = DemoProps {
            packet_rate,
            drop_rate,
            error_rate,
            num_peers,
        };
    }

    /// Bans the id and host, severs any matching live link, and persists the
    /// updated deny lists.
    pub fn ban_peer(&self, id: &str, host: &str) {
        self.registry.ban(id, host);
        {
            let mut cfg = self.cfg.lock().unwrap();
            cfg.banned_ids = self.registry.banned_ids();
            cfg.banned_hosts = self.registry.banned_hosts();
        }
        self.persist_config();
    }

    pub fn disconnect_peer(&self, id: &str) {
        self.registry.disconnect(id);
    }

    /// Adds a peer address to the configuration (normalizing a missing port)
    /// and, outside demo mode, starts dialing it.
    pub fn add_peer(self: Arc<Self>, addr: &str) {
        let addr = normalize_peer_addr(addr);
        {
            let mut cfg = self.cfg.lock().unwrap();
            if cfg.peers.iter().any(|p| p == &addr) {
                info!("peer {} already in configuration", addr);
                return;
            }
            cfg.peers.push(addr.clone());
        }
        self.persist_config();

        if !self.demo_mode.load(Ordering::Relaxed) {
            tokio::spawn(dial_loop(self.clone(), addr.clone()));
        }
        info!("manually added peer: {}", addr);
    }

    pub fn list_interfaces(&self) -> Vec<String> {
        self.capture.list_interfaces().unwrap_or_default()
    }

    fn persist_config(&self) {
        if let Some(path) = &self.config_path {
            let cfg = self.cfg.lock().unwrap().clone();
            if let Err(e) = cfg.save(path) {
                error!("failed to save config: {}", e);
            }
        }
    }

    fn resolve_verify_policy(&self) -> Option<VerifyPolicy> {
        let cfg = self.cfg.lock().unwrap();
        if cfg.disable_ssl {
            return None;
        }
        if !cfg.insecure_no_verify && !cfg.tls_ca_path.is_empty() {
            return Some(VerifyPolicy::TrustStore(cfg.tls_ca_path.clone()));
        }
        Some(VerifyPolicy::SkipVerify)
    }
}

/// Runs the handshake, admits the peer, and drives the link until it
/// terminates. Used by both the listener and the dialers; the id is the
/// remote endpoint string on accept and the dialed address outbound.
async fn run_peer(engine: Arc<RelayEngine>, mut stream: PeerStream, id: String, remote: SocketAddr) {
    let key = engine.cfg.lock().unwrap().network_key.clone();
    let handshake = tokio::select! {
        _ = engine.cancel.cancelled() => return,
        res = wire::handshake(&mut stream, &key) => res,
    };
    if let Err(e) = handshake {
        warn!("peer {}: handshake failed: {}", id, e);
        return;
    }
    if !key.is_empty() {
        info!("peer {}: authenticated", id);
    }

    let (peer, egress_rx) = Peer::new(id.clone(), remote, engine.cancel.child_token());
    if let Err(reason) = engine.registry.insert(peer.clone()) {
        info!("rejecting peer {}: {}", id, reason);
        return;
    }

    peer::run_link(stream, peer, egress_rx, engine.ingress_tx.clone()).await;
    engine.registry.remove(&id);
}

/// The heart of the relay: a single task that owns both ingress sides and
/// the dedup decision, so a total order exists over frames.
async fn fanout_loop(engine: Arc<RelayEngine>, mut capture_rx: mpsc::Receiver<Bytes>) {
    let Some(mut ingress_rx) = engine.ingress_rx.lock().unwrap().take() else {
        error!("relay fan-out already running");
        return;
    };

    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => return,
            maybe = capture_rx.recv() => {
                let Some(frame) = maybe else { return };
                engine.total_received.fetch_add(1, Ordering::Relaxed);
                if engine.dedup.test_and_insert(&frame) {
                    engine.total_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                engine.registry.broadcast(&frame);
                engine.total_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            maybe = ingress_rx.recv() => {
                let Some(frame) = maybe else { return };
                // Already seen means it came from us or already made the
                // rounds; dropping here is what breaks relay loops.
                if engine.dedup.test_and_insert(&frame) {
                    continue;
                }
                if let Err(e) = engine.capture.inject(&frame) {
                    error!("failed to inject packet: {}", e);
                    engine.total_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

async fn accept_loop(
    engine: Arc<RelayEngine>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
) {
    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (conn, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept error: {}", e);
                        continue;
                    }
                };
                let engine = engine.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let id = addr.to_string();
                    let host = addr.ip().to_string();
                    // Deny-listed or over-limit connections are dropped here,
                    // before a single handshake byte goes out.
                    if let Err(reason) = engine.registry.check_admissible(&id, &host) {
                        info!("rejecting peer {}: {}", id, reason);
                        return;
                    }
                    let stream = match &acceptor {
                        None => PeerStream::Plain(conn),
                        Some(acceptor) => match acceptor.accept(conn).await {
                            Ok(tls) => PeerStream::Tls(Box::new(TlsStream::Server(tls))),
                            Err(e) => {
                                warn!("TLS accept from {} failed: {}", addr, e);
                                return;
                            }
                        },
                    };
                    run_peer(engine, stream, id, addr).await;
                });
            }
        }
    }
}

/// One per configured remote: dial, run the link to termination, back off,
/// repeat until shutdown.
async fn dial_loop(engine: Arc<RelayEngine>, addr: String) {
    loop {
        if engine.cancel.is_cancelled() {
            return;
        }

        let connector = match engine.resolve_verify_policy() {
            None => Ok(None),
            Some(policy) => {
                if matches!(policy, VerifyPolicy::SkipVerify) {
                    warn!(
                        "dialing {} without certificate verification; set tls_ca_path to pin a trust anchor",
                        addr
                    );
                }
                transport::build_connector(&policy).map(Some)
            }
        };

        let stream = match connector {
            Ok(tls) => transport::dial(&addr, tls.as_ref()).await,
            Err(e) => Err(e),
        };

        match stream {
            Ok(stream) => match stream.remote_endpoint() {
                Ok(remote) => run_peer(engine.clone(), stream, addr.clone(), remote).await,
                Err(e) => error!("peer {}: {}", addr, e),
            },
            Err(e) => error!("failed to connect to peer {}: {}, retrying...", addr, e),
        }

        tokio::select! {
            _ = engine.cancel.cancelled() => return,
            _ = tokio::time::sleep(REDIAL_DELAY) => {}
        }
    }
}

/// Appends the default peer port when the address has none. Handles bare
/// IPv4/hostnames and bracketed IPv6 literals.
pub fn normalize_peer_addr(addr: &str) -> String {
    if let Some(end) = addr.rfind(']') {
        if addr[end + 1..].contains(':') {
            addr.to_string()
        } else {
            format!("{}:{}", addr, wire::DEFAULT_PEER_PORT)
        }
    } else if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, wire::DEFAULT_PEER_PORT)
    }
}

/// Synthesizes a shifting set of mock peers and plausible counter movement
/// for demos and UI work. Purely presentational.
async fn run_demo(engine: Arc<RelayEngine>) {
    let mut ticker = tokio::time::interval(DEMO_TICK);
    loop {
        tokio::select! {
            _ = engine.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let props = *engine.demo.lock().unwrap();
        let max_children = engine.cfg.lock().unwrap().max_children;
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        reconcile_demo_peers(&engine, props.num_peers, max_children);

        engine.total_received.fetch_add(
            props.packet_rate + seed % (props.packet_rate / 2 + 1),
            Ordering::Relaxed,
        );
        engine.total_forwarded.fetch_add(
            props.packet_rate.saturating_sub(props.drop_rate) + seed % (props.packet_rate / 2 + 1),
            Ordering::Relaxed,
        );
        engine
            .total_dropped
            .fetch_add(seed % (props.drop_rate + 1), Ordering::Relaxed);
        if props.error_rate > 0 && seed % props.error_rate == 0 {
            engine.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        for peer in engine.registry.peer_arcs() {
            peer.bump_demo(seed);
        }
    }
}

fn reconcile_demo_peers(engine: &Arc<RelayEngine>, target: usize, max_children: usize) {
    let peers = engine.registry.peer_arcs();

    // Refresh displayed child counts from the reported topology.
    for peer in &peers {
        let children = peers
            .iter()
            .filter(|other| other.parent_id() == peer.id)
            .count();
        peer.set_child_count(children, max_children);
    }

    let current = peers
        .iter()
        .filter(|p| p.id.starts_with(DEMO_PEER_PREFIX))
        .count();

    if current < target {
        for i in current..target {
            let id = format!("{DEMO_PEER_PREFIX}{i}");
            if engine.registry.get(&id).is_some() {
                continue;
            }
            let addr: SocketAddr = demo_peer_addr(i);
            let (peer, _egress_rx) = Peer::new(id, addr, engine.cancel.child_token());
            // Shape a rough tree, three children per node.
            let parent = if i > 0 {
                format!("{DEMO_PEER_PREFIX}{}", i / 3)
            } else {
                LOCAL_PARENT.to_string()
            };
            peer.set_topology(&parent, 0, max_children);
            peer.bump_demo(i as u64);
            engine.registry.insert_unchecked(peer);
        }
    } else if current > target {
        let mut to_remove = current - target;
        for peer in &peers {
            if to_remove == 0 {
                break;
            }
            if !peer.id.starts_with(DEMO_PEER_PREFIX) {
                continue;
            }
            let has_children = peers.iter().any(|other| other.parent_id() == peer.id);
            if !has_children {
                engine.registry.remove(&peer.id);
                to_remove -= 1;
            }
        }
    }
}

fn demo_peer_addr(i: usize) -> SocketAddr {
    // Deterministic, publicly-routable-looking endpoints.
    const OCTETS: [u8; 19] = [
        8, 12, 15, 20, 31, 45, 50, 64, 72, 80, 95, 110, 128, 140, 155, 170, 185, 200, 210,
    ];
    let text = if i % 2 == 0 {
        format!(
            "{}.{}.{}.{}",
            OCTETS[i % OCTETS.len()],
            (i * 7) % 256,
            (i * 13) % 256,
            (i * 17) % 256
        )
    } else {
        format!(
            "2600:{:x}:{:x}:{:x}::{:x}",
            (i * 7) % 65536,
            (i * 13) % 65536,
            (i * 17) % 65536,
            i
        )
    };
    SocketAddr::new(text.parse().expect("demo address literal"), wire::DEFAULT_PEER_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;

    struct NullCapture;

    impl Capture for NullCapture {
        fn start(
            &self,
            _cancel: CancellationToken,
            _out: mpsc::Sender<Bytes>,
        ) -> Result<(), CaptureError> {
            Ok(())
        }

        fn inject(&self, _frame: &[u8]) -> Result<(), CaptureError> {
            Ok(())
        }

        fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
            Ok(vec![])
        }
    }

    fn test_engine(cfg: Config, config_path: Option<PathBuf>) -> Arc<RelayEngine> {
        RelayEngine::new(
            cfg,
            config_path,
            Arc::new(NullCapture),
            LogBuffer::new(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_peer_addr() {
        assert_eq!(normalize_peer_addr("10.0.0.1"), "10.0.0.1:8787");
        assert_eq!(normalize_peer_addr("10.0.0.1:9000"), "10.0.0.1:9000");
        assert_eq!(normalize_peer_addr("relay.example.net"), "relay.example.net:8787");
        assert_eq!(normalize_peer_addr("[2001:db8::1]"), "[2001:db8::1]:8787");
        assert_eq!(normalize_peer_addr("[2001:db8::1]:9000"), "[2001:db8::1]:9000");
    }

    #[test]
    fn test_update_config_semantics() {
        let engine = test_engine(Config::default(), None);

        engine.update_config("new-pass", 10, "new-key", true, 60);
        {
            let cfg = engine.cfg.lock().unwrap();
            assert_eq!(cfg.admin_pass, "new-pass");
            assert_eq!(cfg.max_children, 10);
            assert_eq!(cfg.network_key, "new-key");
            assert!(cfg.rebalance_enabled);
            assert_eq!(cfg.rebalance_interval, 60);
        }
        assert_eq!(engine.registry.max_children(), 10);

        // Empty / zero values leave the previous settings alone.
        engine.update_config("", 0, "", false, 0);
        let cfg = engine.cfg.lock().unwrap();
        assert_eq!(cfg.admin_pass, "new-pass");
        assert_eq!(cfg.max_children, 10);
        assert_eq!(cfg.network_key, "new-key");
        assert!(!cfg.rebalance_enabled);
        assert_eq!(cfg.rebalance_interval, 60);
    }

    #[test]
    fn test_ban_peer_persists_deny_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        Config::default().save(&path).unwrap();

        let engine = test_engine(Config::default(), Some(path.clone()));
        engine.ban_peer("peer-x", "1.2.3.4");

        let saved = Config::load(&path).unwrap();
        assert!(saved.banned_ids.contains(&"peer-x".to_string()));
        assert!(saved.banned_hosts.contains(&"1.2.3.4".to_string()));
    }

    #[tokio::test]
    async fn test_add_peer_normalizes_and_deduplicates() {
        let engine = test_engine(Config::default(), None);
        engine.set_demo_mode(true); // keep add_peer from spawning dialers

        engine.clone().add_peer("10.1.1.1");
        engine.clone().add_peer("10.1.1.1:8787");
        engine.clone().add_peer("[2001:db8::2]");
        let cfg = engine.cfg.lock().unwrap();
        assert_eq!(
            cfg.peers,
            vec!["10.1.1.1:8787".to_string(), "[2001:db8::2]:8787".to_string()]
        );
    }

    #[test]
    fn test_demo_mode_marks_capture_error() {
        let engine = test_engine(Config::default(), None);
        engine.set_demo_mode(true);
        let stats = engine.collect_stats();
        assert_eq!(stats.capture_error, "[DEMO MODE ACTIVE]");
        assert!(stats.demo_props.is_some());
    }

    #[test]
    fn test_demo_reconcile_builds_tree() {
        let engine = test_engine(Config::default(), None);
        reconcile_demo_peers(&engine, 5, 3);
        assert_eq!(engine.registry.len(), 5);

        let records = engine.registry.snapshot();
        let root = records.iter().find(|p| p.id == "demo-node-0").unwrap();
        assert_eq!(root.parent_id, LOCAL_PARENT);
        let leaf = records.iter().find(|p| p.id == "demo-node-4").unwrap();
        assert_eq!(leaf.parent_id, "demo-node-1");

        // Shrinking removes childless nodes only.
        reconcile_demo_peers(&engine, 2, 3);
        assert!(engine.registry.len() >= 2);
        assert!(engine.registry.get("demo-node-0").is_some());
    }
}
