use bytes::Bytes;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// BPF filter matching IPX traffic. 0x8137 is the EtherType Novell
/// registered; 0x8003 shows up on some older stacks.
const IPX_FILTER: &str = "ether proto 0x8137 or ether proto 0x8003";

const SNAPLEN: i32 = 1600;
const READ_TIMEOUT_MS: i32 = 500;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no interface specified")]
    NoInterface,
    #[error("capture not started")]
    NotStarted,
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
}

/// Narrow contract between the relay engine and the capture driver. The
/// engine only ever delivers and receives raw Ethernet frames through this.
pub trait Capture: Send + Sync {
    /// Begins delivering captured frames into `out`. Returns an error if the
    /// device cannot be opened; the engine records it and keeps relaying
    /// peer-to-peer traffic.
    fn start(&self, cancel: CancellationToken, out: mpsc::Sender<Bytes>)
        -> Result<(), CaptureError>;

    /// Writes a frame back onto the local interface.
    fn inject(&self, frame: &[u8]) -> Result<(), CaptureError>;

    fn list_interfaces(&self) -> Result<Vec<String>, CaptureError>;
}

/// Live capture on a named interface via libpcap.
///
/// Two handles are opened on the same device: the reader thread owns one for
/// its blocking next_packet() loop, injection uses the other so the two never
/// contend.
pub struct PcapCapture {
    iface: String,
    inject_handle: Mutex<Option<pcap::Capture<pcap::Active>>>,
}

impl PcapCapture {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            inject_handle: Mutex::new(None),
        }
    }

    fn open(&self, promisc: bool) -> Result<pcap::Capture<pcap::Active>, CaptureError> {
        let cap = pcap::Capture::from_device(self.iface.as_str())?
            .promisc(promisc)
            .snaplen(SNAPLEN)
            .timeout(READ_TIMEOUT_MS)
            .open()?;
        Ok(cap)
    }
}

impl Capture for PcapCapture {
    fn start(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<Bytes>,
    ) -> Result<(), CaptureError> {
        if self.iface.is_empty() {
            return Err(CaptureError::NoInterface);
        }

        let mut reader = self.open(true)?;
        if let Err(e) = reader.filter(IPX_FILTER, true) {
            warn!("failed to set BPF filter on {}: {}", self.iface, e);
        }

        *self.inject_handle.lock().unwrap() = Some(self.open(false)?);

        let iface = self.iface.clone();
        std::thread::Builder::new()
            .name("ipx-capture".to_string())
            .spawn(move || loop {
                if cancel.is_cancelled() {
                    debug!("capture on {} stopped", iface);
                    return;
                }
                match reader.next_packet() {
                    Ok(packet) => {
                        // Blocks when the engine is backed up; the channel is
                        // the capture-ingress bound.
                        if out.blocking_send(Bytes::copy_from_slice(packet.data)).is_err() {
                            return;
                        }
                    }
                    // The read timeout lets the cancellation check run.
                    Err(pcap::Error::TimeoutExpired) => continue,
                    Err(e) => {
                        warn!("capture read on {} failed: {}", iface, e);
                        return;
                    }
                }
            })
            .expect("spawn capture thread");

        Ok(())
    }

    fn inject(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let mut guard = self.inject_handle.lock().unwrap();
        let handle = guard.as_mut().ok_or(CaptureError::NotStarted)?;
        handle.sendpacket(frame)?;
        Ok(())
    }

    fn list_interfaces(&self) -> Result<Vec<String>, CaptureError> {
        let devices = pcap::Device::list()?;
        Ok(devices.into_iter().map(|d| d.name).collect())
    }
}
