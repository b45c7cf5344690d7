// TGD - NOTIFICATION BUS
// Northbound notifications to the management plane. Publishing never blocks
// and never fails: a full or absent subscriber just drops the message.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

use log::debug;

use crate::engine::lock;
use crate::protocol::fw_msg::{BfScanResp, FwInitResp};
use crate::protocol::wire::MacAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    DeviceUp { radio: usize, mac: MacAddr },
    DeviceDown { radio: usize, mac: MacAddr },
    LinkStatus {
        /// None when no link slot holds the peer.
        ifname: Option<String>,
        peer: MacAddr,
        status: u8,
        failure_cause: u8,
        sta_node_type: u8,
        peer_node_type: u8,
    },
    WsecStatus { ifname: String, status: u8 },
    WsecLinkup { ifname: String, peer: MacAddr },
    FwInit(FwInitResp),
    BfScan(BfScanResp),
    /// Raw northbound event, header included.
    Passthrough(Vec<u8>),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::DeviceUp { .. } => "DEVICE_UP",
            Notification::DeviceDown { .. } => "DEVICE_DOWN",
            Notification::LinkStatus { .. } => "LINK_STATUS",
            Notification::WsecStatus { .. } => "WSEC_STATUS",
            Notification::WsecLinkup { .. } => "WSEC_LINKUP",
            Notification::FwInit(_) => "TGINIT",
            Notification::BfScan(_) => "BMFMCONFIG",
            Notification::Passthrough(_) => "PASSTHRU",
        }
    }
}

pub trait NotificationBus: Send + Sync {
    fn publish(&self, n: Notification);
}

/// Discards everything.
pub struct NullBus;

impl NotificationBus for NullBus {
    fn publish(&self, _n: Notification) {}
}

#[derive(Default)]
pub struct NlStats {
    pub sent: AtomicU64,
    pub dropped: AtomicU64,
}

/// Bounded channel to one subscriber.
pub struct ChannelBus {
    tx: SyncSender<Notification>,
    pub stats: NlStats,
}

impl ChannelBus {
    pub fn new(depth: usize) -> (Self, Receiver<Notification>) {
        let (tx, rx) = sync_channel(depth);
        (ChannelBus { tx, stats: NlStats::default() }, rx)
    }
}

impl NotificationBus for ChannelBus {
    fn publish(&self, n: Notification) {
        let kind = n.kind();
        match self.tx.try_send(n) {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("[TGD-FW] notification {} dropped", kind);
            }
        }
    }
}

/// Keeps every notification for later inspection.
#[derive(Default)]
pub struct RecordingBus {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingBus {
    pub fn new() -> Self { Self::default() }
    pub fn take(&self) -> Vec<Notification> { std::mem::take(&mut *lock(&self.seen)) }
    pub fn snapshot(&self) -> Vec<Notification> { lock(&self.seen).clone() }
}

impl NotificationBus for RecordingBus {
    fn publish(&self, n: Notification) { lock(&self.seen).push(n); }
}
