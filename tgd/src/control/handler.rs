// TGD - FIRMWARE MESSAGE HANDLER
// Southbound senders (one ioctl each, returning the firmware errCode) and the
// dispatcher the event worker runs for every northbound event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

use crate::baseband::Baseband;
use crate::device::Device;
use crate::engine::lock;
use crate::error::{Result, TgdError};
use crate::link::LinkState;
use crate::protocol::fw_msg::{
    self, BfRole, FwEventType, FwMessage, GpsPos, GpsTime, HtsfInfo, LinkUpdate, QueueStatsEntry, WsecAuth,
    LOCAL_IOCTL_BUF_SIZE, RESPONSE_BUF_SIZE, VENDOR_IOCTL_MAX_SIZE,
};
use crate::protocol::wire::MacAddr;

use super::notify::Notification;

// ============================================================================
// COUNTERS
// ============================================================================

const FW_TYPE_BASE: u8 = FwEventType::SbInitReq as u8;
const FW_TYPE_NUM: usize = (FwEventType::NbHtsfInfo as u8 - FW_TYPE_BASE) as usize + 1;

/// Received-event tallies, total and per message type.
#[derive(Default)]
pub struct NlCounters {
    pub events: AtomicU64,
    pub unknown: AtomicU64,
    pub malformed: AtomicU64,
    by_type: [AtomicU64; FW_TYPE_NUM],
}

impl NlCounters {
    fn record(&self, msg_type: u8) {
        self.events.fetch_add(1, Ordering::Relaxed);
        match msg_type.checked_sub(FW_TYPE_BASE).filter(|i| (*i as usize) < FW_TYPE_NUM) {
            Some(i) => {
                self.by_type[i as usize].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn of(&self, t: FwEventType) -> u64 {
        self.by_type[(t as u8 - FW_TYPE_BASE) as usize].load(Ordering::Relaxed)
    }
}

// ============================================================================
// HOOKS
// ============================================================================

/// Local GPS receiver, when the platform has one.
pub trait GpsHook: Send + Sync {
    /// Firmware asks for (or stops wanting) GPS time pushes.
    fn set_time_acquisition(&self, radio: usize, enable: bool);
    fn self_position(&self, radio: usize) -> Option<GpsPos>;
}

/// Timing-sync consumer of firmware HTSF reports.
pub trait HtsfHandler: Send + Sync {
    fn htsf_info(&self, radio: usize, mac: u64, info: HtsfInfo);
}

/// At most one HTSF handler at a time.
#[derive(Default)]
pub struct HtsfRegistry {
    slot: Mutex<Option<Arc<dyn HtsfHandler>>>,
}

impl HtsfRegistry {
    pub fn register(&self, handler: Arc<dyn HtsfHandler>) -> Result<()> {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            return Err(TgdError::AlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Only the handler currently registered can be removed.
    pub fn unregister(&self, handler: &Arc<dyn HtsfHandler>) -> Result<()> {
        let mut slot = lock(&self.slot);
        match slot.as_ref() {
            Some(cur) if Arc::ptr_eq(cur, handler) => {
                *slot = None;
                Ok(())
            }
            _ => Err(TgdError::InvalidArgument("htsf handler not registered")),
        }
    }

    fn current(&self) -> Option<Arc<dyn HtsfHandler>> { lock(&self.slot).clone() }
}

// ============================================================================
// SOUTHBOUND
// ============================================================================

fn fw_ioctl(bb: &dyn Baseband, req: &[u8], max: usize) -> Result<u8> {
    if req.len() > max {
        return Err(TgdError::PayloadTooLarge { len: req.len(), max });
    }
    let mut resp = [0u8; RESPONSE_BUF_SIZE];
    let n = bb.ioctl(req, &mut resp)?;
    let err = fw_msg::response_err_code(&resp[..n])?;
    if err != 0 {
        warn!("[TGD-FW] request type {} answered with error {}", req[0], err);
    }
    Ok(err)
}

pub fn send_fw_init(bb: &dyn Baseband, var: &[u8]) -> Result<u8> {
    fw_ioctl(bb, &fw_msg::encode_init_req(var), LOCAL_IOCTL_BUF_SIZE)
}

/// Returns Ok(0) without calling firmware when there is nothing to report.
pub fn send_queue_stats(bb: &dyn Baseband, entries: &[QueueStatsEntry]) -> Result<u8> {
    if entries.is_empty() {
        return Ok(0);
    }
    fw_ioctl(bb, &fw_msg::encode_queue_stats(entries), LOCAL_IOCTL_BUF_SIZE)
}

pub fn send_disassoc_req(bb: &dyn Baseband, peer: MacAddr) -> Result<u8> {
    debug!("[TGD-FW] disassoc {}", peer);
    fw_ioctl(bb, &fw_msg::encode_disassoc_req(peer), LOCAL_IOCTL_BUF_SIZE)
}

pub fn send_bf_scan_req(bb: &dyn Baseband, peer: MacAddr, role: BfRole, var: &[u8]) -> Result<u8> {
    fw_ioctl(bb, &fw_msg::encode_bf_scan_req(peer, role, var), LOCAL_IOCTL_BUF_SIZE)
}

pub fn send_link_del_resp(bb: &dyn Baseband, peer: MacAddr, err_code: u8) -> Result<u8> {
    fw_ioctl(bb, &fw_msg::encode_del_link_resp(peer, err_code), LOCAL_IOCTL_BUF_SIZE)
}

pub fn send_gps_time(bb: &dyn Baseband, t: GpsTime) -> Result<u8> {
    fw_ioctl(bb, &fw_msg::encode_gps_time(t), LOCAL_IOCTL_BUF_SIZE)
}

pub fn send_gps_pos(bb: &dyn Baseband, p: GpsPos) -> Result<u8> {
    fw_ioctl(bb, &fw_msg::encode_gps_pos(p), LOCAL_IOCTL_BUF_SIZE)
}

pub fn send_passthrough(bb: &dyn Baseband, var: &[u8]) -> Result<u8> {
    fw_ioctl(bb, &fw_msg::encode_passthrough(var), VENDOR_IOCTL_MAX_SIZE)
}

pub fn send_fw_shutdown(bb: &dyn Baseband) -> Result<u8> {
    info!("[TGD-FW] sending firmware shutdown");
    fw_ioctl(bb, &fw_msg::encode_shutdown(), LOCAL_IOCTL_BUF_SIZE)
}

// ============================================================================
// DISPATCH
// ============================================================================

/// Process one northbound event. Errors are logged, never returned.
pub fn dispatch(dev: &Device, event: &[u8]) {
    let Some(&msg_type) = event.first() else { return };
    dev.nl().record(msg_type);

    let msg = match fw_msg::decode(event) {
        Ok(m) => m,
        Err(TgdError::UnknownMessage(t)) => {
            error!("[TGD-FW] unexpected event {}", t);
            return;
        }
        Err(e) => {
            dev.nl().malformed.fetch_add(1, Ordering::Relaxed);
            warn!("[TGD-FW] dropping event type {}: {}", msg_type, e);
            return;
        }
    };

    match msg {
        FwMessage::InitResp(r) => {
            info!("[TGD-FW] firmware init: err {} mac {} version {:#x} vendor {}", r.err_code, r.mac, r.version, r.vendor);
            dev.bus().publish(Notification::FwInit(r));
        }
        FwMessage::BfScanResp(r) => dev.bus().publish(Notification::BfScan(r)),
        FwMessage::UpdateLink(u) => update_link(dev, u),
        FwMessage::LinkInfo { peer, rx_link, tx_link } => dev.set_link_mac_addr(peer, rx_link, tx_link),
        FwMessage::DelLink { peer } => {
            if let Err(e) = dev.del_link_info(peer) {
                info!("[TGD-FW] del link for {}: {}", peer, e);
            }
            if let Err(e) = send_link_del_resp(dev.baseband(), peer, 0) {
                error!("[TGD-FW] del link response for {} failed: {}", peer, e);
            }
        }
        FwMessage::Passthru(_) => {
            debug!("[TGD-FW] passthrough of {} bytes", event.len());
            dev.bus().publish(Notification::Passthrough(event.to_vec()));
        }
        FwMessage::GpsStartTimeAcquisition => gps_time_acquisition(dev, true),
        FwMessage::GpsStopTimeAcquisition => gps_time_acquisition(dev, false),
        FwMessage::GpsGetSelfPos => {
            let Some(pos) = dev.gps().and_then(|g| g.self_position(dev.radio())) else {
                error!("[TGD-FW] unable to get self GPS location");
                return;
            };
            if let Err(e) = send_gps_pos(dev.baseband(), pos) {
                error!("[TGD-FW] GPS position push failed: {}", e);
            }
        }
        FwMessage::HtsfInfo(h) => {
            debug!("[TGD-FW] HTSF txRxDiffNs {} delayEstNs {} rxStartUs {}",
                { h.tx_rx_diff_ns }, { h.delay_est_ns }, { h.rx_start_us });
            if let Some(handler) = dev.htsf().current() {
                handler.htsf_info(dev.radio(), dev.mac().to_u64(), h);
            }
        }
        FwMessage::IoctlResp { err_code } => debug!("[TGD-FW] stray ioctl response, err {}", err_code),
        FwMessage::Southbound(t) => error!("[TGD-FW] unexpected event {:?}", t),
    }
}

fn gps_time_acquisition(dev: &Device, start: bool) {
    match dev.gps() {
        Some(g) => g.set_time_acquisition(dev.radio(), start),
        None => info!("[TGD-FW] no GPS: time acquisition {} ignored", if start { "start" } else { "stop" }),
    }
}

fn update_link(dev: &Device, u: LinkUpdate) {
    let link = dev.links().find_by_mac(u.peer);
    if let Some(l) = link {
        match LinkState::from_u8(u.status) {
            Some(state) => {
                dev.links().apply_status(dev, l, state);
            }
            None => warn!("[TGD-FW] {}: unknown link status {}", l.ifname(), u.status),
        }
    }

    dev.bus().publish(Notification::LinkStatus {
        ifname: link.map(|l| l.ifname()),
        peer: u.peer,
        status: u.status,
        failure_cause: u.failure_cause,
        sta_node_type: u.sta_node_type,
        peer_node_type: u.peer_node_type,
    });

    let Some(l) = link else {
        error!("[TGD-FW] dev not found for {}", u.peer);
        return;
    };
    if u.status == LinkState::Up as u8 {
        l.security.connect(u.peer, u.wsec_auth);
        if u.wsec_auth == WsecAuth::Disabled {
            dev.bus().publish(Notification::WsecStatus { ifname: l.ifname(), status: u.wsec_auth as u8 });
        }
    } else if u.status == LinkState::Down as u8 {
        l.security.disconnect();
    }
}
