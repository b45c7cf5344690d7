// TGD - LINK TABLE
// Fixed array of link slots for one radio, in interface order.
// Reservation prefers the slot last used by the same peer, then a never-used
// slot, then any idle slot. Radio link ids are unique across the table.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::baseband::{BhLinkStats, LINK_ID_INVALID};
use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::link::{Link, LinkState};
use crate::protocol::wire::MacAddr;

/// Side effects of lifecycle transitions, provided by the owning radio.
pub trait LinkHooks {
    /// Register the link's ids with the radio. Failure leaves the slot idle.
    fn add_link_info(&self, link: &Link) -> Result<()>;
    fn delete_link_info(&self, link: &Link);
    /// Current radio counters for a bound link.
    fn fetch_stats(&self, link: &Link) -> Option<BhLinkStats>;
    /// Called after the lifecycle guard is released with the resulting state.
    fn link_state_changed(&self, link: &Link, state: LinkState);
}

pub struct LinkTable {
    links: Vec<Link>,
    reserve: Mutex<()>,
    active: AtomicI32,
}

impl LinkTable {
    pub fn new(count: usize, first_dev_index: usize) -> Self {
        LinkTable {
            links: (0..count).map(|i| Link::new(i, first_dev_index + i)).collect(),
            reserve: Mutex::new(()),
            active: AtomicI32::new(0),
        }
    }

    #[inline(always)] pub fn len(&self) -> usize { self.links.len() }
    #[inline(always)] pub fn is_empty(&self) -> bool { self.links.is_empty() }
    #[inline(always)] pub fn get(&self, index: usize) -> Option<&Link> { self.links.get(index) }
    pub fn iter(&self) -> std::slice::Iter<'_, Link> { self.links.iter() }

    /// Links currently Up or Pause.
    pub fn active_count(&self) -> i32 { self.active.load(Ordering::Acquire) }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    pub fn find_by_mac(&self, peer: MacAddr) -> Option<&Link> {
        self.links.iter().find(|l| l.peer() == peer)
    }

    /// Matches either direction's id.
    pub fn find_by_link_id(&self, id: i32) -> Option<&Link> {
        if id == LINK_ID_INVALID {
            return None;
        }
        self.links.iter().find(|l| l.tx_link() == id || l.rx_link() == id)
    }

    // ========================================================================
    // RESERVE + BIND
    // ========================================================================

    /// Claim an Init slot for `peer`. Only the peer address is assigned.
    pub fn reserve(&self, peer: MacAddr) -> Result<&Link> {
        let _g = lock(&self.reserve);
        self.reserve_locked(peer)
    }

    /// Preference: the idle slot last used by `peer`, then a never-used slot,
    /// then the first idle slot.
    fn reserve_locked(&self, peer: MacAddr) -> Result<&Link> {
        let idle = || self.links.iter().filter(|l| l.state() == LinkState::Init);
        let link = idle()
            .find(|l| l.peer() == peer)
            .or_else(|| idle().find(|l| l.peer().is_zero()))
            .or_else(|| idle().next())
            .ok_or(TgdError::NoFreeLink(peer))?;
        link.set_peer(peer);
        info!("[TGD-LINK] {} reserved for {}", link.ifname(), peer);
        Ok(link)
    }

    /// Reserve (or reuse the Down slot already holding `peer`) and register
    /// the radio link ids. The slot ends in Down, or Init when the radio refuses.
    pub fn bind(&self, hooks: &dyn LinkHooks, peer: MacAddr, rx_link: i32, tx_link: i32) -> Result<&Link> {
        let _g = lock(&self.reserve);
        let link = match self.links.iter().find(|l| l.peer() == peer && l.state() == LinkState::Down) {
            Some(l) => l,
            None => self.reserve_locked(peer)?,
        };
        for other in self.links.iter().filter(|o| o.index() != link.index()) {
            if tx_link != LINK_ID_INVALID && other.tx_link() == tx_link {
                return Err(TgdError::LinkIdInUse(tx_link));
            }
            if rx_link != LINK_ID_INVALID && other.rx_link() == rx_link {
                return Err(TgdError::LinkIdInUse(rx_link));
            }
        }

        let _lc = link.lock_lifecycle();
        debug!("[TGD-LINK] {} add link [old rx {}, tx {}] -> [rx {}, tx {}]",
            link.ifname(), link.rx_link(), link.tx_link(), rx_link, tx_link);
        link.set_link_ids(rx_link, tx_link);
        link.set_state(LinkState::Down);
        if let Err(e) = hooks.add_link_info(link) {
            warn!("[TGD-LINK] {}: radio refused link info for {}: {}", link.ifname(), peer, e);
            link.set_link_ids(LINK_ID_INVALID, LINK_ID_INVALID);
            link.set_state(LinkState::Init);
            return Err(e);
        }
        Ok(link)
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    pub fn set_status(&self, hooks: &dyn LinkHooks, peer: MacAddr, state: LinkState) -> Result<LinkState> {
        let link = self.find_by_mac(peer).ok_or(TgdError::UnknownPeer(peer))?;
        Ok(self.apply_status(hooks, link, state))
    }

    /// Drive one status event. Returns the state the link ends in.
    pub fn apply_status(&self, hooks: &dyn LinkHooks, link: &Link, state: LinkState) -> LinkState {
        let result = {
            let _lc = link.lock_lifecycle();
            let prev = link.state();
            debug!("[TGD-LINK] {} status {} -> {}", link.ifname(), prev.name(), state.name());
            match state {
                LinkState::Up if prev == LinkState::Init => {
                    warn!("[TGD-LINK] {}: link up for unbound slot ignored", link.ifname());
                }
                LinkState::Up => {
                    link.set_carrier(true);
                    link.wake_all_queues();
                    if prev == LinkState::Down {
                        self.active.fetch_add(1, Ordering::AcqRel);
                    }
                    link.set_state(LinkState::Up);
                }
                LinkState::Pause => {
                    if matches!(prev, LinkState::Up | LinkState::Pause) {
                        link.set_state(LinkState::Pause);
                    }
                    link.set_carrier(false);
                    link.stop_all_queues();
                }
                LinkState::Down => {
                    link.set_carrier(false);
                    link.stop_all_queues();
                    if prev != LinkState::Init {
                        if matches!(prev, LinkState::Up | LinkState::Pause) {
                            self.active.fetch_sub(1, Ordering::AcqRel);
                        }
                        link.set_state(LinkState::Down);
                    }
                }
                LinkState::Init => {}
            }
            link.state()
        };
        hooks.link_state_changed(link, result);
        result
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Return the slot to Init: unbind from the radio, spill stats into the
    /// residual counters, reset security. The peer address is kept for reuse.
    pub fn teardown(&self, hooks: &dyn LinkHooks, link: &Link) {
        let was_active = {
            let _lc = link.lock_lifecycle();
            let prev = link.state();

            if link.tx_link() >= 0 {
                if let Some(cur) = hooks.fetch_stats(link) {
                    link.with_stats(|s| s.refresh(&cur));
                }
            }
            if link.is_bound() {
                hooks.delete_link_info(link);
            }

            let was_active = matches!(prev, LinkState::Up | LinkState::Pause);
            if was_active {
                self.active.fetch_sub(1, Ordering::AcqRel);
            }
            link.set_carrier(false);
            link.stop_all_queues();
            link.set_link_ids(LINK_ID_INVALID, LINK_ID_INVALID);
            link.set_state(LinkState::Init);

            link.with_stats(|s| {
                link.counters.spill(s);
                *s = Default::default();
            });
            link.security.reset();
            info!("[TGD-LINK] {} torn down (peer {}, was {})", link.ifname(), link.peer(), prev.name());
            was_active
        };
        if was_active {
            hooks.link_state_changed(link, LinkState::Init);
        }
    }

    pub fn teardown_peer(&self, hooks: &dyn LinkHooks, peer: MacAddr) -> Result<()> {
        let link = self.find_by_mac(peer).ok_or(TgdError::UnknownPeer(peer))?;
        self.teardown(hooks, link);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{Counter, LinkStats};
    use std::sync::atomic::AtomicBool;

    const AA: MacAddr = MacAddr([0xAA; 6]);
    const BB: MacAddr = MacAddr([0xBB; 6]);
    const CC: MacAddr = MacAddr([0xCC; 6]);

    #[derive(Default)]
    struct Recorder {
        refuse: AtomicBool,
        added: Mutex<Vec<(usize, i32, i32)>>,
        deleted: Mutex<Vec<usize>>,
        changes: Mutex<Vec<(usize, LinkState)>>,
        radio: Mutex<BhLinkStats>,
    }

    impl LinkHooks for Recorder {
        fn add_link_info(&self, link: &Link) -> Result<()> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(TgdError::Baseband(-5));
            }
            self.added.lock().unwrap().push((link.index(), link.rx_link(), link.tx_link()));
            Ok(())
        }
        fn delete_link_info(&self, link: &Link) { self.deleted.lock().unwrap().push(link.index()); }
        fn fetch_stats(&self, _link: &Link) -> Option<BhLinkStats> { Some(*self.radio.lock().unwrap()) }
        fn link_state_changed(&self, link: &Link, state: LinkState) {
            self.changes.lock().unwrap().push((link.index(), state));
        }
    }

    #[test]
    fn reserve_prefers_same_peer_then_unused_then_first_idle() {
        let t = LinkTable::new(3, 0);
        let h = Recorder::default();
        // slot 0 -> AA, slot 1 -> BB, both torn down again
        t.bind(&h, AA, 0, 0).unwrap();
        t.bind(&h, BB, 1, 1).unwrap();
        t.teardown(&h, t.get(0).unwrap());
        t.teardown(&h, t.get(1).unwrap());

        assert_eq!(t.reserve(BB).unwrap().index(), 1);
        // CC: slot 0 holds AA, slot 1 holds BB, slot 2 never used
        assert_eq!(t.reserve(CC).unwrap().index(), 2);

        let t = LinkTable::new(2, 0);
        t.bind(&h, AA, 0, 0).unwrap();
        t.bind(&h, BB, 1, 1).unwrap();
        t.teardown(&h, t.get(0).unwrap());
        t.teardown(&h, t.get(1).unwrap());
        // no match and nothing unused: first idle in order
        assert_eq!(t.reserve(CC).unwrap().index(), 0);
    }

    #[test]
    fn previous_slot_beats_earlier_unused_slot() {
        let t = LinkTable::new(3, 0);
        let h = Recorder::default();
        t.bind(&h, CC, 0, 0).unwrap();
        t.bind(&h, AA, 1, 1).unwrap();
        t.teardown(&h, t.get(0).unwrap());
        t.teardown(&h, t.get(1).unwrap());
        t.get(0).unwrap().set_peer(MacAddr::ZERO);

        // slot 0 never used, slot 1 last held AA
        assert_eq!(t.reserve(AA).unwrap().index(), 1);
        assert_eq!(t.reserve(BB).unwrap().index(), 0);
    }

    #[test]
    fn reserve_fails_without_idle_slot() {
        let t = LinkTable::new(1, 0);
        let h = Recorder::default();
        t.bind(&h, AA, 0, 0).unwrap();
        assert!(matches!(t.reserve(BB), Err(TgdError::NoFreeLink(m)) if m == BB));
    }

    #[test]
    fn bind_rejects_duplicate_ids() {
        let t = LinkTable::new(2, 0);
        let h = Recorder::default();
        t.bind(&h, AA, 3, 4).unwrap();
        assert!(matches!(t.bind(&h, BB, 5, 4), Err(TgdError::LinkIdInUse(4))));
        assert!(matches!(t.bind(&h, BB, 3, 6), Err(TgdError::LinkIdInUse(3))));
        assert_eq!(t.get(1).unwrap().state(), LinkState::Init);
    }

    #[test]
    fn refused_bind_returns_to_init() {
        let t = LinkTable::new(1, 0);
        let h = Recorder::default();
        h.refuse.store(true, Ordering::Relaxed);
        assert!(t.bind(&h, AA, 0, 0).is_err());
        let l = t.get(0).unwrap();
        assert_eq!(l.state(), LinkState::Init);
        assert!(!l.is_bound());
    }

    #[test]
    fn status_transitions_track_active_count() {
        let t = LinkTable::new(1, 0);
        let h = Recorder::default();
        t.bind(&h, AA, 0, 0).unwrap();
        assert_eq!(t.set_status(&h, AA, LinkState::Up).unwrap(), LinkState::Up);
        assert_eq!(t.active_count(), 1);
        assert!(t.get(0).unwrap().carrier_ok());

        assert_eq!(t.set_status(&h, AA, LinkState::Pause).unwrap(), LinkState::Pause);
        assert_eq!(t.active_count(), 1);
        assert!(!t.get(0).unwrap().carrier_ok());
        assert!(t.get(0).unwrap().queue_stopped(1));

        assert_eq!(t.set_status(&h, AA, LinkState::Up).unwrap(), LinkState::Up);
        assert_eq!(t.active_count(), 1);

        assert_eq!(t.set_status(&h, AA, LinkState::Down).unwrap(), LinkState::Down);
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.set_status(&h, AA, LinkState::Down).unwrap(), LinkState::Down);
        assert_eq!(t.active_count(), 0);

        assert!(matches!(t.set_status(&h, BB, LinkState::Up), Err(TgdError::UnknownPeer(_))));
        let changes = h.changes.lock().unwrap();
        assert_eq!(changes.last(), Some(&(0, LinkState::Down)));
    }

    #[test]
    fn down_on_idle_slot_stays_init() {
        let t = LinkTable::new(1, 0);
        let h = Recorder::default();
        t.reserve(AA).unwrap();
        assert_eq!(t.set_status(&h, AA, LinkState::Down).unwrap(), LinkState::Init);
        assert_eq!(t.set_status(&h, AA, LinkState::Up).unwrap(), LinkState::Init);
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn teardown_spills_stats_and_unbinds() {
        let t = LinkTable::new(1, 0);
        let h = Recorder::default();
        let l = t.bind(&h, AA, 2, 3).unwrap();
        t.set_status(&h, AA, LinkState::Up).unwrap();
        *h.radio.lock().unwrap() = BhLinkStats {
            pkts_sent: 7, bytes_sent: 700, pkts_recved: 2, bytes_recved: 200, tx_err: 1,
            ..Default::default()
        };
        let before = l.counters.snapshot();
        t.teardown(&h, l);

        assert_eq!(l.state(), LinkState::Init);
        assert_eq!(l.tx_link(), LINK_ID_INVALID);
        assert_eq!(l.rx_link(), LINK_ID_INVALID);
        assert_eq!(l.stats(), LinkStats::default());
        assert_eq!(l.peer(), AA);
        assert_eq!(t.active_count(), 0);
        let after = l.counters.snapshot();
        assert_eq!(after[Counter::TxPackets as usize] - before[Counter::TxPackets as usize], 7);
        assert_eq!(after[Counter::TxBytes as usize] - before[Counter::TxBytes as usize], 700);
        assert_eq!(after[Counter::RxPackets as usize] - before[Counter::RxPackets as usize], 2);
        assert_eq!(after[Counter::RxBytes as usize] - before[Counter::RxBytes as usize], 200);
        assert_eq!(after[Counter::TxErr as usize] - before[Counter::TxErr as usize], 1);
        assert_eq!(*h.deleted.lock().unwrap(), vec![0]);
        assert_eq!(h.changes.lock().unwrap().last(), Some(&(0, LinkState::Init)));
    }

    #[test]
    fn lookup_by_either_id() {
        let t = LinkTable::new(2, 0);
        let h = Recorder::default();
        t.bind(&h, AA, 1, 2).unwrap();
        assert_eq!(t.find_by_link_id(1).unwrap().peer(), AA);
        assert_eq!(t.find_by_link_id(2).unwrap().peer(), AA);
        assert!(t.find_by_link_id(LINK_ID_INVALID).is_none());
        assert!(t.find_by_link_id(9).is_none());
    }
}
