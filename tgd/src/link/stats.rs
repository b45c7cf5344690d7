// TGD - LINK STATISTICS
// Two layers per link slot. LinkStats mirrors the radio's per-peer counters and
// is reset whenever the link is torn down. Counters are the slot's own data-path
// tallies plus the residual totals that survive teardown.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::baseband::BhLinkStats;

// ============================================================================
// DATA-PATH COUNTERS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    RxPackets = 0,
    RxDropPackets,
    RxBytes,
    TxPackets,
    TxBytes,
    RxErrNoMdata,
    TxFromLinux,
    TxFromNss,
    TxErr,
    TxTgdErr,
    LinkSuspend,
    LinkResume,
    TxTgdTxStopped,
    TxFromLnxDataCos,
    TxFromLnxCtrlCos,
    TxFromNssDataCos,
    TxFromNssCtrlCos,
    TxErrWlanBusy,
    TxPacketsCos0,
    TxPacketsCos1,
    TxPacketsCos2,
    TxPacketsCos3,
    RxTgdRxStopped,
}

pub const COUNTER_NUM: usize = Counter::RxTgdRxStopped as usize + 1;

pub const COUNTER_NAMES: [&str; COUNTER_NUM] = [
    "RX_PACKETS", "RX_DROP_PACKETS", "RX_BYTES", "TX_PACKETS", "TX_BYTES",
    "RX_ERR_NO_MDATA", "TX_FROM_LINUX", "TX_FROM_NSS", "TX_ERR", "TX_TGD_ERR",
    "LINK_SUSPEND", "LINK_RESUME", "TX_TGD_TX_STOPPED", "TX_FROM_LNX_DATA_COS",
    "TX_FROM_LNX_CTRL_COS", "TX_FROM_NSS_DATA_COS", "TX_FROM_NSS_CTRL_COS",
    "TX_ERR_WLAN_BUSY", "TX_PACKETS_COS0", "TX_PACKETS_COS1", "TX_PACKETS_COS2",
    "TX_PACKETS_COS3", "RX_TGD_RX_STOPPED",
];

impl Counter {
    pub fn name(self) -> &'static str { COUNTER_NAMES[self as usize] }

    /// Per-queue transmit counter. Out-of-range queues land on queue 0.
    pub fn tx_packets_cos(qid: u8) -> Counter {
        match qid {
            1 => Counter::TxPacketsCos1,
            2 => Counter::TxPacketsCos2,
            3 => Counter::TxPacketsCos3,
            _ => Counter::TxPacketsCos0,
        }
    }
}

/// Atomic counter bank. Writers on any thread, readers see a relaxed snapshot.
pub struct Counters {
    values: [AtomicU64; COUNTER_NUM],
}

impl Default for Counters {
    fn default() -> Self { Counters { values: std::array::from_fn(|_| AtomicU64::new(0)) } }
}

impl Counters {
    #[inline(always)]
    pub fn inc(&self, c: Counter) { self.add(c, 1); }

    #[inline(always)]
    pub fn add(&self, c: Counter, n: u64) { self.values[c as usize].fetch_add(n, Ordering::Relaxed); }

    #[inline(always)]
    pub fn get(&self, c: Counter) -> u64 { self.values[c as usize].load(Ordering::Relaxed) }

    pub fn snapshot(&self) -> [u64; COUNTER_NUM] { std::array::from_fn(|i| self.values[i].load(Ordering::Relaxed)) }

    /// Fold a torn-down link's totals into the residual counters.
    pub fn spill(&self, s: &LinkStats) {
        self.add(Counter::TxErr, s.tx_err);
        self.add(Counter::TxPackets, s.pkts_sent);
        self.add(Counter::TxBytes, s.bytes_sent);
        self.add(Counter::RxPackets, s.pkts_recved);
        self.add(Counter::RxBytes, s.bytes_recved);
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_map().entries(COUNTER_NAMES.iter().zip(snap.iter()).filter(|(_, v)| **v != 0)).finish()
    }
}

// ============================================================================
// LINK STATS
// ============================================================================

/// Last radio snapshot for a bound link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub bytes_pending: u64,
    pub pkts_sent: u64,
    pub pkts_pending: u64,
    pub pkts_recved: u64,
    pub bytes_recved: u64,
    pub tx_err: u64,
    pub pkts_enqueued: u64,
    pub bytes_enqueued: u64,
    pub bytes_sent_failed: u64,
    pub bytes_enqueue_failed: u64,
    pub bytes_sent_pad: u64,
    pub bytes_sent_failed_pad: u64,
    pub bytes_enqueued_pad: u64,
    pub bytes_enqueue_fail_pad: u64,
}

impl LinkStats {
    pub fn refresh(&mut self, cur: &BhLinkStats) {
        self.bytes_sent = cur.bytes_sent;
        self.pkts_sent = cur.pkts_sent;
        self.tx_err = cur.tx_err;
        self.pkts_enqueued = cur.pkts_enqueued;
        self.bytes_enqueued = cur.bytes_enqueued;
        self.pkts_pending = cur.pkts_pending;
        self.bytes_pending = cur.bytes_pending;
        self.bytes_sent_failed = cur.bytes_sent_failed;
        self.bytes_enqueue_failed = cur.bytes_enqueue_failed;
        self.bytes_sent_pad = cur.bytes_sent_pad;
        self.bytes_sent_failed_pad = cur.bytes_sent_failed_pad;
        self.bytes_enqueued_pad = cur.bytes_enqueued_pad;
        self.bytes_enqueue_fail_pad = cur.bytes_enqueue_fail_pad;
        self.bytes_recved = cur.bytes_recved;
        self.pkts_recved = cur.pkts_recved;
    }
}

/// Interface-level view: live link stats plus residuals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
}

impl InterfaceStats {
    pub fn combine(live: &LinkStats, residual: &Counters) -> Self {
        InterfaceStats {
            rx_packets: live.pkts_recved + residual.get(Counter::RxPackets),
            tx_packets: live.pkts_sent + residual.get(Counter::TxPackets),
            rx_bytes: live.bytes_recved + residual.get(Counter::RxBytes),
            tx_bytes: live.bytes_sent + residual.get(Counter::TxBytes),
            tx_errors: live.tx_err + residual.get(Counter::TxErr),
        }
    }
}
