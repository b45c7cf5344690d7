// TGD - LOOPBACK BASEBAND
// In-memory radio. Records every call the core makes and lets the caller play
// firmware: inject events, received frames and flow-control callbacks.
// Used by the daemon when no vendor radio is attached, and by the test suite.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::baseband::{Baseband, BhClient, BhLinkStats, LinkInfoDesc, RxDesc, TxDesc, TGD_BH_API_VERSION};
use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::link::LinkState;
use crate::protocol::frame::Frame;
use crate::protocol::fw_msg::{self, FwEventType, LinkUpdate, WsecAuth};
use crate::protocol::wire::MacAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledKey {
    pub peer_index: usize,
    pub peer: MacAddr,
    pub key: Vec<u8>,
}

pub struct LoopbackBaseband {
    mac: MacAddr,
    api_version: AtomicU32,
    client: Mutex<Option<Arc<dyn BhClient>>>,
    max_peers: Mutex<usize>,
    links: Mutex<Vec<LinkInfoDesc>>,
    stats: Mutex<Vec<BhLinkStats>>,
    tx_log: Mutex<Vec<(TxDesc, Vec<u8>)>>,
    ioctl_log: Mutex<Vec<Vec<u8>>>,
    keys: Mutex<Vec<InstalledKey>>,
    ioctl_err: AtomicU8,
    pub fail_add_link: AtomicBool,
    pub fail_tx: AtomicBool,
    /// Answer a disassociation request with a link-down event, like firmware does.
    pub auto_disassoc: AtomicBool,
}

impl LoopbackBaseband {
    pub fn new(mac: MacAddr) -> Self {
        LoopbackBaseband {
            mac,
            api_version: AtomicU32::new(TGD_BH_API_VERSION),
            client: Mutex::new(None),
            max_peers: Mutex::new(0),
            links: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
            tx_log: Mutex::new(Vec::new()),
            ioctl_log: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
            ioctl_err: AtomicU8::new(0),
            fail_add_link: AtomicBool::new(false),
            fail_tx: AtomicBool::new(false),
            auto_disassoc: AtomicBool::new(true),
        }
    }

    pub fn with_api_version(self, v: u32) -> Self {
        self.api_version.store(v, Ordering::Relaxed);
        self
    }

    fn client(&self) -> Option<Arc<dyn BhClient>> { lock(&self.client).clone() }

    // ========================================================================
    // FIRMWARE SIDE
    // ========================================================================

    pub fn inject_event(&self, event: &[u8]) -> bool {
        match self.client() {
            Some(c) => { c.rx_event(event); true }
            None => false,
        }
    }

    pub fn inject_rx(&self, frame: Frame, rxd: RxDesc) -> bool {
        match self.client() {
            Some(c) => { c.rx_data(frame, &rxd); true }
            None => false,
        }
    }

    pub fn suspend(&self, peer_index: usize, link: i32, qid: u8) {
        if let Some(c) = self.client() { c.link_suspend(peer_index, link, qid); }
    }

    pub fn resume(&self, peer_index: usize, link: i32, qid: u8) {
        if let Some(c) = self.client() { c.link_resume(peer_index, link, qid); }
    }

    pub fn announce_mac(&self, mac: MacAddr) {
        if let Some(c) = self.client() { c.set_mac_addr(mac); }
    }

    /// Firmware link bring-up as seen by the core: link info, then link-up.
    pub fn bring_up_peer(&self, peer: MacAddr, rx_link: u8, tx_link: u8, wsec: WsecAuth) {
        self.inject_event(&fw_msg::encode_link_info(peer, rx_link, tx_link));
        self.inject_event(&fw_msg::encode_link_status(&LinkUpdate {
            status: LinkState::Up as u8,
            peer,
            failure_cause: 0,
            sta_node_type: 0,
            peer_node_type: 0,
            wsec_auth: wsec,
            assoc_req_ies: Vec::new(),
            assoc_resp_ies: Vec::new(),
        }));
    }

    pub fn set_ioctl_err(&self, code: u8) { self.ioctl_err.store(code, Ordering::Relaxed); }

    pub fn update_link_stats(&self, peer_index: usize, f: impl FnOnce(&mut BhLinkStats)) {
        let mut all = lock(&self.stats);
        if all.len() <= peer_index {
            all.resize(peer_index + 1, BhLinkStats::default());
        }
        f(&mut all[peer_index]);
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn is_registered(&self) -> bool { lock(&self.client).is_some() }
    pub fn max_peers(&self) -> usize { *lock(&self.max_peers) }
    pub fn links(&self) -> Vec<LinkInfoDesc> { lock(&self.links).clone() }
    pub fn transmitted(&self) -> Vec<(TxDesc, Vec<u8>)> { lock(&self.tx_log).clone() }
    pub fn ioctls(&self) -> Vec<Vec<u8>> { lock(&self.ioctl_log).clone() }
    pub fn keys(&self) -> Vec<InstalledKey> { lock(&self.keys).clone() }

    /// Requests of one southbound type, in send order.
    pub fn ioctls_of(&self, t: FwEventType) -> Vec<Vec<u8>> {
        lock(&self.ioctl_log).iter().filter(|r| r.first() == Some(&(t as u8))).cloned().collect()
    }
}

impl Baseband for LoopbackBaseband {
    fn api_version(&self) -> u32 { self.api_version.load(Ordering::Relaxed) }

    fn mac_addr(&self) -> MacAddr { self.mac }

    fn register_client(&self, client: Arc<dyn BhClient>, max_peers: usize) -> Result<()> {
        let mut slot = lock(&self.client);
        if slot.is_some() {
            return Err(TgdError::AlreadyRegistered);
        }
        *slot = Some(client);
        *lock(&self.max_peers) = max_peers;
        info!("[TGD-BH] loopback {}: client registered, {} peers", self.mac, max_peers);
        Ok(())
    }

    fn unregister_client(&self) -> Result<()> {
        lock(&self.client).take().map(|_| ()).ok_or(TgdError::InvalidArgument("no client registered"))
    }

    fn add_link_info(&self, desc: &LinkInfoDesc) -> Result<()> {
        if self.fail_add_link.load(Ordering::Relaxed) {
            return Err(TgdError::Baseband(-libc::EIO));
        }
        let mut links = lock(&self.links);
        links.retain(|l| l.peer_index != desc.peer_index);
        links.push(*desc);
        Ok(())
    }

    fn delete_link_info(&self, desc: &LinkInfoDesc) -> Result<()> {
        lock(&self.links).retain(|l| l.peer_index != desc.peer_index);
        Ok(())
    }

    fn tx_data(&self, frame: Frame, desc: &TxDesc) -> Result<()> {
        if self.fail_tx.load(Ordering::Relaxed) {
            return Err(TgdError::Baseband(-libc::EBUSY));
        }
        let len = frame.len() as u64;
        self.update_link_stats(desc.peer_index, |s| {
            s.pkts_sent += 1;
            s.bytes_sent += len;
            s.pkts_enqueued += 1;
            s.bytes_enqueued += len;
        });
        lock(&self.tx_log).push((*desc, frame.into_vec()));
        Ok(())
    }

    fn link_stats(&self, peer_index: usize) -> Result<BhLinkStats> {
        Ok(lock(&self.stats).get(peer_index).copied().unwrap_or_default())
    }

    fn ioctl(&self, req: &[u8], resp: &mut [u8]) -> Result<usize> {
        lock(&self.ioctl_log).push(req.to_vec());
        let answer = fw_msg::encode_ioctl_resp(self.ioctl_err.load(Ordering::Relaxed));
        let n = answer.len().min(resp.len());
        resp[..n].copy_from_slice(&answer[..n]);

        if req.first() == Some(&(FwEventType::SbDisassocReq as u8)) && self.auto_disassoc.load(Ordering::Relaxed) {
            if let Some(peer) = req.get(fw_msg::FW_HDR_LEN..).and_then(MacAddr::from_slice) {
                debug!("[TGD-BH] loopback: disassoc {} -> link down", peer);
                self.inject_event(&fw_msg::encode_link_status(&LinkUpdate {
                    status: LinkState::Down as u8,
                    peer,
                    failure_cause: 0,
                    sta_node_type: 0,
                    peer_node_type: 0,
                    wsec_auth: WsecAuth::Disabled,
                    assoc_req_ies: Vec::new(),
                    assoc_resp_ies: Vec::new(),
                }));
            }
        }
        Ok(n)
    }

    fn set_key(&self, peer_index: usize, peer: MacAddr, key: &[u8]) -> Result<()> {
        lock(&self.keys).push(InstalledKey { peer_index, peer, key: key.to_vec() });
        Ok(())
    }
}
