// TGD - LINK SLOT
// One virtual peer interface. A radio pre-allocates a fixed number of these;
// each is reserved for a peer, bound to radio link ids, and cycled through
// Init -> Down <-> Up <-> Pause. Lifecycle changes serialize on `lifecycle`;
// the data path reads the atomics without taking it.

pub mod stats;
pub mod table;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::baseband::{BH_MQ_QUEUE_NUM, LINK_ID_INVALID};
use crate::engine::lock;
use crate::protocol::wire::MacAddr;
use crate::route::BackendPriv;
use crate::security::SecurityGate;

pub use stats::{Counter, Counters, InterfaceStats, LinkStats};
pub use table::{LinkHooks, LinkTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Init = 0,
    Down = 1,
    Up = 2,
    Pause = 3,
}

impl LinkState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(LinkState::Init),
            1 => Some(LinkState::Down),
            2 => Some(LinkState::Up),
            3 => Some(LinkState::Pause),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LinkState::Init => "INIT",
            LinkState::Down => "DOWN",
            LinkState::Up => "UP",
            LinkState::Pause => "PAUSE",
        }
    }
}

pub struct Link {
    index: usize,
    dev_index: usize,
    lifecycle: Mutex<()>,
    changed: Condvar,
    state: AtomicU8,
    peer: AtomicU64,
    tx_link: AtomicI32,
    rx_link: AtomicI32,
    carrier: AtomicBool,
    queues_stopped: [AtomicBool; BH_MQ_QUEUE_NUM],
    offload_port: AtomicI32,
    stats: Mutex<LinkStats>,
    /// Data-path tallies and residual totals kept across teardowns.
    pub counters: Counters,
    pub security: SecurityGate,
    pub backend: Mutex<BackendPriv>,
}

impl Link {
    /// `index` is the slot within its radio (the radio's peer index);
    /// `dev_index` is unique across radios and names the interface.
    pub fn new(index: usize, dev_index: usize) -> Self {
        Link {
            index,
            dev_index,
            lifecycle: Mutex::new(()),
            changed: Condvar::new(),
            state: AtomicU8::new(LinkState::Init as u8),
            peer: AtomicU64::new(0),
            tx_link: AtomicI32::new(LINK_ID_INVALID),
            rx_link: AtomicI32::new(LINK_ID_INVALID),
            carrier: AtomicBool::new(false),
            queues_stopped: std::array::from_fn(|_| AtomicBool::new(true)),
            offload_port: AtomicI32::new(-1),
            stats: Mutex::new(LinkStats::default()),
            counters: Counters::default(),
            security: SecurityGate::new(index),
            backend: Mutex::new(BackendPriv::Unattached),
        }
    }

    #[inline(always)] pub fn index(&self) -> usize { self.index }
    #[inline(always)] pub fn dev_index(&self) -> usize { self.dev_index }
    pub fn ifname(&self) -> String { format!("terra{}", self.dev_index) }

    #[inline(always)]
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(LinkState::Init)
    }

    #[inline(always)] pub fn peer(&self) -> MacAddr { MacAddr::from_u64(self.peer.load(Ordering::Acquire)) }
    #[inline(always)] pub fn tx_link(&self) -> i32 { self.tx_link.load(Ordering::Acquire) }
    #[inline(always)] pub fn rx_link(&self) -> i32 { self.rx_link.load(Ordering::Acquire) }
    #[inline(always)] pub fn is_bound(&self) -> bool { self.tx_link() >= 0 || self.rx_link() >= 0 }
    #[inline(always)] pub fn carrier_ok(&self) -> bool { self.carrier.load(Ordering::Acquire) }

    /// Engine port inbound aggregates are tagged with; -1 when none is programmed.
    /// Read on the receive path without taking the backend lock.
    #[inline(always)] pub fn offload_port(&self) -> i32 { self.offload_port.load(Ordering::Acquire) }
    pub fn set_offload_port(&self, port: i32) { self.offload_port.store(port, Ordering::Release); }

    // ========================================================================
    // QUEUES
    // ========================================================================

    #[inline(always)]
    pub fn queue_stopped(&self, qid: u8) -> bool {
        self.queues_stopped.get(qid as usize).map_or(true, |q| q.load(Ordering::Acquire))
    }

    /// True when this call moved the queue from running to stopped.
    pub fn stop_queue(&self, qid: u8) -> bool {
        self.queues_stopped.get(qid as usize).map_or(false, |q| !q.swap(true, Ordering::AcqRel))
    }

    /// True when this call moved the queue from stopped to running.
    pub fn wake_queue(&self, qid: u8) -> bool {
        self.queues_stopped.get(qid as usize).map_or(false, |q| q.swap(false, Ordering::AcqRel))
    }

    pub fn stop_all_queues(&self) {
        for q in &self.queues_stopped { q.store(true, Ordering::Release); }
    }

    pub fn wake_all_queues(&self) {
        for q in &self.queues_stopped { q.store(false, Ordering::Release); }
    }

    // ========================================================================
    // STATS
    // ========================================================================

    pub fn stats(&self) -> LinkStats { *lock(&self.stats) }

    pub fn with_stats<R>(&self, f: impl FnOnce(&mut LinkStats) -> R) -> R { f(&mut lock(&self.stats)) }

    pub fn interface_stats(&self) -> InterfaceStats { InterfaceStats::combine(&self.stats(), &self.counters) }

    // ========================================================================
    // LIFECYCLE (callers hold the guard from `lock_lifecycle`)
    // ========================================================================

    pub(crate) fn lock_lifecycle(&self) -> MutexGuard<'_, ()> { lock(&self.lifecycle) }

    pub(crate) fn set_state(&self, s: LinkState) {
        self.state.store(s as u8, Ordering::Release);
        self.changed.notify_all();
    }

    pub(crate) fn set_peer(&self, peer: MacAddr) { self.peer.store(peer.to_u64(), Ordering::Release); }

    pub(crate) fn set_link_ids(&self, rx: i32, tx: i32) {
        self.rx_link.store(rx, Ordering::Release);
        self.tx_link.store(tx, Ordering::Release);
    }

    pub(crate) fn set_carrier(&self, on: bool) { self.carrier.store(on, Ordering::Release); }

    /// Block until the link leaves Up or `timeout` passes. True when it left.
    pub fn wait_while_up(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock_lifecycle();
        while self.state() == LinkState::Up {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = match self.changed.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(p) => p.into_inner().0,
            };
        }
        true
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("ifname", &self.ifname())
            .field("state", &self.state())
            .field("peer", &self.peer())
            .field("tx_link", &self.tx_link())
            .field("rx_link", &self.rx_link())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fresh_slot_is_idle() {
        let l = Link::new(1, 5);
        assert_eq!(l.state(), LinkState::Init);
        assert_eq!(l.ifname(), "terra5");
        assert!(l.peer().is_zero());
        assert!(!l.is_bound());
        assert!(!l.carrier_ok());
        assert!(l.queue_stopped(0));
    }

    #[test]
    fn queue_toggles_report_transitions_once() {
        let l = Link::new(0, 0);
        l.wake_all_queues();
        assert!(l.stop_queue(2));
        assert!(!l.stop_queue(2));
        assert!(l.wake_queue(2));
        assert!(!l.wake_queue(2));
        assert!(!l.stop_queue(9));
        assert!(l.queue_stopped(9));
    }

    #[test]
    fn wait_while_up_wakes_on_change() {
        let l = Arc::new(Link::new(0, 0));
        {
            let _g = l.lock_lifecycle();
            l.set_state(LinkState::Up);
        }
        assert!(!l.wait_while_up(Duration::from_millis(5)));
        let l2 = l.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            let _g = l2.lock_lifecycle();
            l2.set_state(LinkState::Down);
        });
        assert!(l.wait_while_up(Duration::from_secs(2)));
        t.join().unwrap();
    }
}
