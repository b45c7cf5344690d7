// TGD - BASEBAND PLATFORM CONTRACT
// The vendor radio driver exposes a Baseband; the core registers a BhClient
// to receive data, events and flow-control callbacks. API version must match
// exactly or the radio is refused at probe.

pub mod loopback;

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::frame::Frame;
use crate::protocol::wire::MacAddr;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const TGD_BH_API_VERSION: u32 = (8 << 16) | 0;

/// Transmit queues per link (BK, BE, VI, VO).
pub const BH_MQ_QUEUE_NUM: usize = 4;
/// Host priorities mapped onto those queues.
pub const BH_MQ_PRIO_NUM: usize = 8;

pub const MQ_BK: u8 = 0;
pub const MQ_BE: u8 = 1;
pub const MQ_VI: u8 = 2;
pub const MQ_VO: u8 = 3;

/// Frame lifetime handed to the radio with every transmit.
pub const TX_LIFETIME: u32 = 20_000;

pub const LINK_ID_INVALID: i32 = -1;

/// Default priority -> queue map (802.1d user priority order).
pub const DEFAULT_PRIO_MQ_MAP: [u8; BH_MQ_PRIO_NUM] = [MQ_BE, MQ_BK, MQ_BK, MQ_BE, MQ_VI, MQ_VI, MQ_VO, MQ_VO];

// ============================================================================
// DESCRIPTORS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkInfoDesc {
    pub peer_index: usize,
    pub rx_link: i32,
    pub tx_link: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxDesc {
    pub peer_index: usize,
    pub tx_link: i32,
    pub lifetime: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxDesc {
    pub peer_index: usize,
    pub rx_link: i32,
}

/// Per-peer counters as reported by the radio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BhLinkStats {
    pub bytes_sent: u64,
    pub bytes_sent_pad: u64,
    pub bytes_pending: u64,
    pub pkts_sent: u64,
    pub pkts_pending: u64,
    pub pkts_recved: u64,
    pub bytes_recved: u64,
    pub tx_err: u64,
    pub rx_err: u64,
    pub pkts_enqueued: u64,
    pub bytes_enqueued: u64,
    pub bytes_enqueued_pad: u64,
    pub bytes_enqueue_fail_pad: u64,
    pub bytes_sent_failed: u64,
    pub bytes_sent_failed_pad: u64,
    pub bytes_enqueue_failed: u64,
}

impl BhLinkStats {
    /// Every byte that arrived at the radio queue, accepted or not.
    #[inline(always)]
    pub fn arrived_bytes(&self) -> u64 {
        self.bytes_enqueued
            .wrapping_add(self.bytes_enqueued_pad)
            .wrapping_add(self.bytes_enqueue_failed)
            .wrapping_add(self.bytes_enqueue_fail_pad)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Services the vendor radio driver provides to the core.
pub trait Baseband: Send + Sync {
    fn api_version(&self) -> u32;
    fn mac_addr(&self) -> MacAddr;
    fn prio_queue_map(&self) -> [u8; BH_MQ_PRIO_NUM] { DEFAULT_PRIO_MQ_MAP }
    fn register_client(&self, client: Arc<dyn BhClient>, max_peers: usize) -> Result<()>;
    fn unregister_client(&self) -> Result<()>;
    fn add_link_info(&self, desc: &LinkInfoDesc) -> Result<()>;
    fn delete_link_info(&self, desc: &LinkInfoDesc) -> Result<()>;
    /// Takes the frame unconditionally.
    fn tx_data(&self, frame: Frame, desc: &TxDesc) -> Result<()>;
    fn link_stats(&self, peer_index: usize) -> Result<BhLinkStats>;
    /// Blocking firmware request. Returns the response length written to `resp`.
    fn ioctl(&self, req: &[u8], resp: &mut [u8]) -> Result<usize>;
    fn set_key(&self, peer_index: usize, peer: MacAddr, key: &[u8]) -> Result<()>;
}

/// Callbacks from the radio into the core. Must not block.
pub trait BhClient: Send + Sync {
    fn rx_data(&self, frame: Frame, rxd: &RxDesc);
    fn rx_event(&self, event: &[u8]);
    fn link_resume(&self, peer_index: usize, link: i32, qid: u8);
    fn link_suspend(&self, peer_index: usize, link: i32, qid: u8);
    fn set_mac_addr(&self, mac: MacAddr);
}
