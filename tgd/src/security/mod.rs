// TGD - SECURITY GATE
// Per-link 802.1X port and pairwise-key sequencing.
//
// A secure link comes up with the port closed: only EAPOL passes until the
// supplicant authorizes it. On the supplicant side the data-plane key must not
// reach the radio before handshake message 4 has left the queue, or the peer
// would see M4 encrypted with a key it has not installed yet. The key is parked
// and a deferred worker installs it once M4 is out and the link queue drains,
// or after M4_MAX_DELAY_CNT ticks regardless.

pub mod eapol;
pub mod key;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::protocol::fw_msg::WsecAuth;
use crate::protocol::wire::{is_eapol, MacAddr};

pub use eapol::is_4way_m4;
pub use key::{KeyCipher, PairwiseKey};

/// Deferred key worker tick.
pub const M4_DELAY: Duration = Duration::from_millis(2);
/// Worker runs before the key is installed with packets still pending.
pub const M4_MAX_DELAY_CNT: u32 = 13;

/// Radio services the gate needs. Implemented by the owning device.
pub trait KeyInstaller: Send + Sync {
    fn install_key(&self, link_index: usize, peer: MacAddr, key: &[u8]) -> Result<()>;
    /// Frames still queued at the radio for this link. None when the link has no tx id.
    fn pkts_pending(&self, link_index: usize) -> Option<u64>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyDisposition {
    /// Group/non-pairwise keys are not used on the backhaul.
    Ignored,
    Installed,
    Deferred,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GateInfo {
    pub ap_started: bool,
    pub connected: bool,
    pub peer: MacAddr,
    pub wsec: WsecAuth,
    pub m4_sent: bool,
    pub m4_pending: bool,
    pub authorized: bool,
    pub key_stored: bool,
}

#[derive(Default)]
struct GateState {
    ap_started: bool,
    connected: bool,
    peer: MacAddr,
    wsec: WsecAuth,
    m4_sent: bool,
    key: Option<PairwiseKey>,
    delay_cnt: u32,
    scheduled: bool,
    /// Bumped to cancel an outstanding worker.
    generation: u64,
}

struct GateShared {
    link_index: usize,
    state: Mutex<GateState>,
    pae_closed: AtomicBool,
    m4_pending: AtomicBool,
    installer: Mutex<Option<Weak<dyn KeyInstaller>>>,
}

impl GateShared {
    fn installer(&self) -> Option<Arc<dyn KeyInstaller>> {
        lock(&self.installer).as_ref().and_then(Weak::upgrade)
    }

    fn pkts_pending(&self) -> bool {
        match self.installer() {
            Some(i) => i.pkts_pending(self.link_index).map_or(true, |n| n != 0),
            None => true,
        }
    }

    fn set_authorized(&self, authorized: bool) {
        let was_closed = self.pae_closed.swap(!authorized, Ordering::AcqRel);
        if was_closed == authorized {
            info!("[TGD-SEC] link {}: port {}", self.link_index, if authorized { "authorized" } else { "closed" });
        }
    }

    /// Caller holds `state`.
    fn install(&self, st: &GateState, key: &[u8]) -> Result<()> {
        let installer = self.installer().ok_or(TgdError::InvalidArgument("key installer detached"))?;
        debug!("[TGD-SEC] link {}: install key len {} for {}", self.link_index, key.len(), st.peer);
        installer.install_key(self.link_index, st.peer, key)
    }
}

pub struct SecurityGate {
    shared: Arc<GateShared>,
}

impl SecurityGate {
    pub fn new(link_index: usize) -> Self {
        SecurityGate {
            shared: Arc::new(GateShared {
                link_index,
                state: Mutex::new(GateState::default()),
                pae_closed: AtomicBool::new(false),
                m4_pending: AtomicBool::new(false),
                installer: Mutex::new(None),
            }),
        }
    }

    pub fn attach(&self, installer: Weak<dyn KeyInstaller>) {
        *lock(&self.shared.installer) = Some(installer);
    }

    // ========================================================================
    // DATA PATH
    // ========================================================================

    #[inline(always)]
    pub fn pae_closed(&self) -> bool { self.shared.pae_closed.load(Ordering::Acquire) }

    #[inline(always)]
    pub fn m4_pending(&self) -> bool { self.shared.m4_pending.load(Ordering::Acquire) }

    /// Port check for either direction. EAPOL always passes.
    #[inline(always)]
    pub fn admits(&self, frame: &[u8]) -> bool { !self.pae_closed() || is_eapol(frame) }

    /// Outbound hook: spot M4 while it is awaited, then apply the port.
    pub fn observe_tx(&self, frame: &[u8]) -> bool {
        if self.m4_pending() && is_eapol(frame) && is_4way_m4(frame) {
            self.m4_sent();
        }
        self.admits(frame)
    }

    // ========================================================================
    // ROLE + CONNECTION
    // ========================================================================

    /// Become the authenticator for this link.
    pub fn start_ap(&self) {
        let mut st = lock(&self.shared.state);
        if st.connected {
            warn!("[TGD-SEC] link {}: start_ap while connected to {}", self.shared.link_index, st.peer);
        }
        st.ap_started = true;
    }

    pub fn stop_ap(&self) { lock(&self.shared.state).ap_started = false; }

    pub fn connect(&self, peer: MacAddr, wsec: WsecAuth) {
        let mut st = lock(&self.shared.state);
        if st.connected {
            if st.wsec == wsec && st.peer == peer {
                return;
            }
            error!("[TGD-SEC] link {}: rsn cfg changed while connected", self.shared.link_index);
            self.disconnect_locked(&mut st);
        }
        st.peer = peer;
        st.wsec = wsec;
        st.connected = true;
        if wsec != WsecAuth::Disabled {
            self.shared.set_authorized(false);
            if !st.ap_started {
                self.shared.m4_pending.store(true, Ordering::Release);
            }
        } else {
            self.shared.set_authorized(true);
            info!("[TGD-SEC] link {}: connect {} with wsec off", self.shared.link_index, peer);
        }
    }

    pub fn disconnect(&self) {
        let mut st = lock(&self.shared.state);
        self.disconnect_locked(&mut st);
    }

    fn disconnect_locked(&self, st: &mut GateState) {
        if !st.connected {
            return;
        }
        st.connected = false;
        if st.wsec != WsecAuth::Disabled {
            self.shared.set_authorized(false);
            st.m4_sent = false;
            st.wsec = WsecAuth::Disabled;
        }
    }

    pub fn set_authorized(&self, authorized: bool) { self.shared.set_authorized(authorized); }

    /// Station flags from the authenticator/supplicant. True when the port opened.
    pub fn change_station(&self, authorized: bool) -> bool {
        if authorized {
            self.shared.set_authorized(true);
        }
        authorized
    }

    /// Close the port. Returns the connected peer, if any, to disassociate.
    pub fn del_station(&self) -> Option<MacAddr> {
        let st = lock(&self.shared.state);
        self.shared.set_authorized(false);
        st.connected.then_some(st.peer)
    }

    /// Transmit path saw M4 leave.
    pub fn m4_sent(&self) {
        let mut st = lock(&self.shared.state);
        if !st.connected || st.ap_started {
            return;
        }
        debug!("[TGD-SEC] link {}: m4 sent to {}", self.shared.link_index, st.peer);
        self.shared.m4_pending.store(false, Ordering::Release);
        st.m4_sent = true;
        if st.key.is_some() {
            if let Err(e) = self.schedule_locked(&mut st) {
                error!("[TGD-SEC] link {}: cannot schedule key install: {}", self.shared.link_index, e);
            }
        }
    }

    // ========================================================================
    // KEYS
    // ========================================================================

    pub fn add_key(&self, pairwise: bool, peer: MacAddr, index: u8, suite: u32, material: &[u8]) -> Result<KeyDisposition> {
        if !pairwise {
            return Ok(KeyDisposition::Ignored);
        }
        if index > key::MAX_KEY_INDEX {
            return Err(TgdError::InvalidKey("key index out of range"));
        }
        KeyCipher::from_suite(suite)?;

        let mut st = lock(&self.shared.state);
        if !st.connected || st.peer != peer {
            warn!("[TGD-SEC] link {}: add_key for {} while connected={} to {}",
                self.shared.link_index, peer, st.connected, st.peer);
            return Err(TgdError::NotConnected(peer));
        }
        let key = PairwiseKey::new(index, suite, material)?;

        if !st.ap_started {
            st.key = Some(key.clone());
            st.delay_cnt = 0;
            if !st.m4_sent || self.shared.pkts_pending() {
                debug!("[TGD-SEC] link {}: defer key, m4_sent={}", self.shared.link_index, st.m4_sent);
                self.schedule_locked(&mut st)?;
                return Ok(KeyDisposition::Deferred);
            }
        }
        self.shared.install(&st, key.material())?;
        Ok(KeyDisposition::Installed)
    }

    /// Pairwise key removal: drop the parked key, cancel the worker, clear
    /// the radio key and close the port.
    pub fn del_key(&self, pairwise: bool) {
        if !pairwise {
            return;
        }
        let mut st = lock(&self.shared.state);
        st.m4_sent = false;
        self.shared.m4_pending.store(false, Ordering::Release);
        if !st.ap_started {
            st.key = None;
            st.generation = st.generation.wrapping_add(1);
            st.scheduled = false;
            if let Err(e) = self.shared.install(&st, &[]) {
                warn!("[TGD-SEC] link {}: clearing key failed: {}", self.shared.link_index, e);
            }
        }
        self.shared.set_authorized(false);
    }

    fn schedule_locked(&self, st: &mut GateState) -> Result<()> {
        if st.scheduled {
            return Ok(());
        }
        let shared = self.shared.clone();
        let generation = st.generation;
        std::thread::Builder::new()
            .name(format!("tgd-key{}", shared.link_index))
            .spawn(move || key_worker(shared, generation))?;
        st.scheduled = true;
        Ok(())
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Forget everything but the role. Cancels any deferred install.
    pub fn reset(&self) {
        let mut st = lock(&self.shared.state);
        let ap_started = st.ap_started;
        let generation = st.generation.wrapping_add(1);
        *st = GateState { ap_started, generation, ..GateState::default() };
        self.shared.m4_pending.store(false, Ordering::Release);
        self.shared.pae_closed.store(false, Ordering::Release);
    }

    pub fn info(&self) -> GateInfo {
        let st = lock(&self.shared.state);
        GateInfo {
            ap_started: st.ap_started,
            connected: st.connected,
            peer: st.peer,
            wsec: st.wsec,
            m4_sent: st.m4_sent,
            m4_pending: self.m4_pending(),
            authorized: !self.pae_closed(),
            key_stored: st.key.is_some(),
        }
    }
}

fn key_worker(shared: Arc<GateShared>, generation: u64) {
    loop {
        std::thread::sleep(M4_DELAY);
        let mut st = lock(&shared.state);
        if st.generation != generation {
            return;
        }
        st.delay_cnt += 1;
        let waiting = !st.m4_sent || shared.pkts_pending();
        if waiting && st.delay_cnt < M4_MAX_DELAY_CNT {
            continue;
        }
        if waiting {
            warn!("[TGD-SEC] link {}: installing key after {} ticks, m4_sent={}",
                shared.link_index, st.delay_cnt, st.m4_sent);
        }
        st.scheduled = false;
        shared.m4_pending.store(false, Ordering::Release);
        if let Some(key) = st.key.clone() {
            if let Err(e) = shared.install(&st, key.material()) {
                error!("[TGD-SEC] link {}: set key err {}", shared.link_index, e);
            }
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::{EAPOL_KEY_RSN, WPA_KEY_MIC, WPA_KEY_PAIR};
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    const PEER: MacAddr = MacAddr([0xAA; 6]);

    #[derive(Default)]
    struct Radio {
        installed: Mutex<Vec<Vec<u8>>>,
        pending: AtomicU64,
        no_tx_link: AtomicBool,
    }

    impl KeyInstaller for Radio {
        fn install_key(&self, _link_index: usize, peer: MacAddr, key: &[u8]) -> Result<()> {
            assert_eq!(peer, PEER);
            self.installed.lock().unwrap().push(key.to_vec());
            Ok(())
        }
        fn pkts_pending(&self, _link_index: usize) -> Option<u64> {
            if self.no_tx_link.load(Ordering::Relaxed) { None } else { Some(self.pending.load(Ordering::Relaxed)) }
        }
    }

    fn gate() -> (SecurityGate, Arc<Radio>) {
        let g = SecurityGate::new(0);
        let r = Arc::new(Radio::default());
        let weak: Weak<Radio> = Arc::downgrade(&r);
        g.attach(weak);
        (g, r)
    }

    fn m4() -> Vec<u8> { eapol::build_eapol_key(PEER.0, [2; 6], EAPOL_KEY_RSN, eapol::M4_KEY_INFO) }

    fn data() -> Vec<u8> {
        let mut f = vec![0u8; 60];
        f[12] = 0x08;
        f
    }

    fn wait_installed(r: &Radio, n: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if r.installed.lock().unwrap().len() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn open_link_authorizes_immediately() {
        let (g, _) = gate();
        g.connect(PEER, WsecAuth::Disabled);
        assert!(!g.pae_closed());
        assert!(!g.m4_pending());
        assert!(g.observe_tx(&data()));
    }

    #[test]
    fn secure_link_gates_until_authorized() {
        let (g, _) = gate();
        g.connect(PEER, WsecAuth::Psk);
        assert!(g.pae_closed());
        assert!(g.m4_pending());
        assert!(!g.admits(&data()));
        assert!(g.admits(&m4()));
        g.change_station(true);
        assert!(g.admits(&data()));
    }

    #[test]
    fn non_m4_eapol_leaves_pending_and_m4_flips_once() {
        let (g, _) = gate();
        g.connect(PEER, WsecAuth::Psk);
        let m2 = eapol::build_eapol_key(PEER.0, [2; 6], EAPOL_KEY_RSN, WPA_KEY_PAIR | WPA_KEY_MIC);
        assert!(g.observe_tx(&m2));
        assert!(g.m4_pending());
        assert!(!g.info().m4_sent);
        assert!(g.observe_tx(&m4()));
        assert!(!g.m4_pending());
        assert!(g.info().m4_sent);
        g.observe_tx(&m4());
        assert!(g.info().m4_sent);
    }

    #[test]
    fn authenticator_never_waits_for_m4() {
        let (g, r) = gate();
        g.start_ap();
        g.connect(PEER, WsecAuth::Psk);
        assert!(!g.m4_pending());
        let d = g.add_key(true, PEER, 0, key::WLAN_CIPHER_SUITE_GCMP, &[1; 16]).unwrap();
        assert_eq!(d, KeyDisposition::Installed);
        assert_eq!(r.installed.lock().unwrap().len(), 1);
    }

    #[test]
    fn key_checks() {
        let (g, _) = gate();
        assert_eq!(g.add_key(false, PEER, 0, 0, &[]).unwrap(), KeyDisposition::Ignored);
        assert!(matches!(
            g.add_key(true, PEER, 0, key::WLAN_CIPHER_SUITE_GCMP, &[1; 16]),
            Err(TgdError::NotConnected(_))
        ));
        g.connect(PEER, WsecAuth::Psk);
        assert!(matches!(g.add_key(true, PEER, 0, 0x000F_AC04, &[1; 16]), Err(TgdError::InvalidKey(_))));
        assert!(matches!(g.add_key(true, PEER, 5, key::WLAN_CIPHER_SUITE_GCMP, &[1; 16]), Err(TgdError::InvalidKey(_))));
        assert!(matches!(
            g.add_key(true, MacAddr([0xBB; 6]), 0, key::WLAN_CIPHER_SUITE_GCMP, &[1; 16]),
            Err(TgdError::NotConnected(_))
        ));
    }

    #[test]
    fn supplicant_key_waits_for_m4_then_installs() {
        let (g, r) = gate();
        g.connect(PEER, WsecAuth::Psk);
        // no M4 yet, nothing pending: still deferred until M4 or deadline
        r.pending.store(5, Ordering::Relaxed);
        let d = g.add_key(true, PEER, 0, key::WLAN_CIPHER_SUITE_GCMP_256, &[3; 32]).unwrap();
        assert_eq!(d, KeyDisposition::Deferred);
        assert!(g.info().key_stored);
        g.observe_tx(&m4());
        r.pending.store(0, Ordering::Relaxed);
        assert!(wait_installed(&r, 1));
        assert_eq!(r.installed.lock().unwrap()[0], vec![3; 32]);
        assert!(!g.m4_pending());
    }

    #[test]
    fn soft_deadline_installs_with_packets_pending() {
        let (g, r) = gate();
        g.connect(PEER, WsecAuth::Psk);
        g.observe_tx(&m4());
        r.no_tx_link.store(true, Ordering::Relaxed);
        let start = Instant::now();
        assert_eq!(g.add_key(true, PEER, 1, key::WLAN_CIPHER_SUITE_GCMP, &[4; 16]).unwrap(), KeyDisposition::Deferred);
        assert!(wait_installed(&r, 1));
        assert!(start.elapsed() >= M4_DELAY * (M4_MAX_DELAY_CNT - 1));
    }

    #[test]
    fn m4_sent_and_idle_installs_now() {
        let (g, r) = gate();
        g.connect(PEER, WsecAuth::Psk);
        g.observe_tx(&m4());
        assert_eq!(g.add_key(true, PEER, 0, key::WLAN_CIPHER_SUITE_GCMP, &[5; 16]).unwrap(), KeyDisposition::Installed);
        assert_eq!(r.installed.lock().unwrap().len(), 1);
    }

    #[test]
    fn del_key_cancels_deferred_install() {
        let (g, r) = gate();
        g.connect(PEER, WsecAuth::Psk);
        g.add_key(true, PEER, 0, key::WLAN_CIPHER_SUITE_GCMP, &[6; 16]).unwrap();
        g.del_key(true);
        std::thread::sleep(M4_DELAY * (M4_MAX_DELAY_CNT + 10));
        let installed = r.installed.lock().unwrap();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].is_empty());
        assert!(g.pae_closed());
        assert!(!g.info().key_stored);
    }

    #[test]
    fn disconnect_and_reset() {
        let (g, _) = gate();
        g.connect(PEER, WsecAuth::Eap);
        g.observe_tx(&m4());
        g.change_station(true);
        g.disconnect();
        let i = g.info();
        assert!(!i.connected);
        assert!(!i.m4_sent);
        assert_eq!(i.wsec, WsecAuth::Disabled);
        assert!(g.pae_closed());

        g.start_ap();
        g.connect(PEER, WsecAuth::Psk);
        g.reset();
        let i = g.info();
        assert!(i.ap_started);
        assert!(!i.connected);
        assert!(!g.pae_closed());
        g.stop_ap();
        assert!(!g.info().ap_started);
    }

    #[test]
    fn reconnect_with_new_config_replaces_old() {
        let (g, _) = gate();
        g.connect(PEER, WsecAuth::Disabled);
        g.connect(PEER, WsecAuth::Psk);
        let i = g.info();
        assert!(i.connected);
        assert_eq!(i.wsec, WsecAuth::Psk);
        assert!(g.pae_closed());
        assert_eq!(g.del_station(), Some(PEER));
    }
}
