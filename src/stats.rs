use crate::logbuf::LogRecord;
use serde::Serialize;
use std::cmp::Ordering;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

/// Everything the TUI and HTTP dashboard consumers get to see. Built as one
/// immutable value; once returned it is entirely the caller's.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_received: u64,
    pub total_forwarded: u64,
    pub total_dropped: u64,
    pub total_errors: u64,
    pub uptime: Duration,
    pub uptime_str: String,
    pub peers: Vec<PeerRecord>,
    pub capture_error: String,
    pub sort_field: String,
    pub sort_reverse: bool,
    pub listen_addr: String,
    pub max_children: usize,
    pub logs: Vec<LogRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_props: Option<DemoProps>,
}

/// Traffic and health of one peer link.
#[derive(Debug, Clone, Serialize)]
pub struct PeerRecord {
    pub id: String,
    pub ip: IpAddr,
    pub connected_at: SystemTime,
    pub last_seen: SystemTime,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_pkts: u64,
    pub recv_pkts: u64,
    pub errors: u64,
    pub queue_drops: u64,
    pub hostname: String,
    pub parent_id: String,
    pub num_children: usize,
    pub max_children: usize,
    pub country: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
    pub whois: String,
}

impl PeerRecord {
    #[cfg(test)]
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ip: IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            connected_at: SystemTime::UNIX_EPOCH,
            last_seen: SystemTime::UNIX_EPOCH,
            sent_bytes: 0,
            recv_bytes: 0,
            sent_pkts: 0,
            recv_pkts: 0,
            errors: 0,
            queue_drops: 0,
            hostname: String::new(),
            parent_id: "Local".to_string(),
            num_children: 0,
            max_children: 0,
            country: String::new(),
            city: String::new(),
            lat: 0.0,
            lon: 0.0,
            whois: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DemoProps {
    pub packet_rate: u64,
    pub drop_rate: u64,
    pub error_rate: u64,
    pub num_peers: usize,
}

impl Default for DemoProps {
    fn default() -> Self {
        Self {
            packet_rate: 15,
            drop_rate: 3,
            error_rate: 10,
            num_peers: 5,
        }
    }
}

/// Inputs `assemble` composes into a snapshot; gathered by the engine under
/// its own locks so this stays a pure function.
pub struct StatsInputs {
    pub total_received: u64,
    pub total_forwarded: u64,
    pub total_dropped: u64,
    pub total_errors: u64,
    pub uptime: Duration,
    pub peers: Vec<PeerRecord>,
    pub capture_error: String,
    pub sort_field: String,
    pub sort_reverse: bool,
    pub listen_addr: String,
    pub max_children: usize,
    pub logs: Vec<LogRecord>,
    pub demo_props: Option<DemoProps>,
}

pub fn assemble(inputs: StatsInputs) -> Stats {
    let mut peers = inputs.peers;
    sort_peers(&mut peers, &inputs.sort_field, inputs.sort_reverse);

    Stats {
        total_received: inputs.total_received,
        total_forwarded: inputs.total_forwarded,
        total_dropped: inputs.total_dropped,
        total_errors: inputs.total_errors,
        uptime: inputs.uptime,
        uptime_str: format_duration(inputs.uptime),
        peers,
        capture_error: inputs.capture_error,
        sort_field: inputs.sort_field,
        sort_reverse: inputs.sort_reverse,
        listen_addr: inputs.listen_addr,
        max_children: inputs.max_children,
        logs: inputs.logs,
        demo_props: inputs.demo_props,
    }
}

/// Orders the peer list by the configured field. Unknown fields fall back to
/// `id`, and `id` breaks every tie, so the result is a total order and
/// consumers render deterministically.
pub fn sort_peers(peers: &mut [PeerRecord], field: &str, reverse: bool) {
    peers.sort_by(|a, b| {
        let ord = match field {
            "ip" => a.ip.to_string().cmp(&b.ip.to_string()),
            "hostname" => a.hostname.cmp(&b.hostname),
            "connected" => a.connected_at.cmp(&b.connected_at),
            "last_seen" => a.last_seen.cmp(&b.last_seen),
            "children" => a.num_children.cmp(&b.num_children),
            "sent_bytes" => a.sent_bytes.cmp(&b.sent_bytes),
            "recv_bytes" => a.recv_bytes.cmp(&b.recv_bytes),
            "sent_pkts" => a.sent_pkts.cmp(&b.sent_pkts),
            "recv_pkts" => a.recv_pkts.cmp(&b.recv_pkts),
            "errors" => a.errors.cmp(&b.errors),
            // "id" and anything unrecognized
            _ => Ordering::Equal,
        };
        let ord = ord.then_with(|| a.id.cmp(&b.id));
        if reverse {
            ord.reverse()
        } else {
            ord
        }
    });
}

pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<PeerRecord> {
        let mut a = PeerRecord::placeholder("b-peer");
        a.sent_bytes = 10;
        let mut b = PeerRecord::placeholder("a-peer");
        b.sent_bytes = 30;
        let mut c = PeerRecord::placeholder("c-peer");
        c.sent_bytes = 20;
        vec![a, b, c]
    }

    #[test]
    fn test_sort_by_id_default() {
        let mut peers = sample();
        sort_peers(&mut peers, "id", false);
        let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a-peer", "b-peer", "c-peer"]);
    }

    #[test]
    fn test_sort_by_field_and_reverse() {
        let mut peers = sample();
        sort_peers(&mut peers, "sent_bytes", false);
        let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["b-peer", "c-peer", "a-peer"]);

        let mut peers = sample();
        sort_peers(&mut peers, "sent_bytes", true);
        let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a-peer", "c-peer", "b-peer"]);
    }

    #[test]
    fn test_unknown_sort_field_falls_back_to_id() {
        let mut peers = sample();
        sort_peers(&mut peers, "bogus", false);
        let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a-peer", "b-peer", "c-peer"]);
    }

    #[test]
    fn test_sort_is_total_under_equal_keys() {
        // All sent_bytes equal: the id tiebreak fully determines the order.
        let mut peers = sample();
        for p in peers.iter_mut() {
            p.sent_bytes = 7;
        }
        sort_peers(&mut peers, "sent_bytes", false);
        let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["a-peer", "b-peer", "c-peer"]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(62)), "1m 2s");
        assert_eq!(format_duration(Duration::from_secs(3_723)), "1h 2m 3s");
        assert_eq!(
            format_duration(Duration::from_secs(90_061 + 86_400)),
            "2d 1h 1m 1s"
        );
    }
}
