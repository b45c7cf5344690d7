// TGD - FIRMWARE MESSAGE ENVELOPE
// Driver <-> firmware ioctl/event framing: {type u8, pad[3], payload}.
// Payload structs are #[repr(C, packed)] and little-endian, matching the
// firmware's native layout. Variable data is {len u32, bytes[len]}.
//
// Southbound (driver -> fw) requests are built here and handed to the baseband
// ioctl; the response's first payload byte is the firmware error code.
// Northbound (fw -> driver) events are decoded into FwMessage.

use std::mem;

use bytemuck::{Pod, Zeroable};
use log::warn;

use crate::error::{Result, TgdError};
use crate::protocol::wire::MacAddr;

// ============================================================================
// LIMITS
// ============================================================================

pub const FW_HDR_LEN: usize = 4;
pub const VAR_DATA_HDR_LEN: usize = 4;
pub const MAX_VAR_DATA_LEN: usize = 512;
pub const LOCAL_IOCTL_BUF_SIZE: usize = 512;
pub const RESPONSE_BUF_SIZE: usize = 128;
pub const VENDOR_IOCTL_MAX_SIZE: usize = 1024;
pub const QUEUE_STATS_MAX_LINKS: usize = 16;

// ============================================================================
// MESSAGE TYPES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FwEventType {
    SbInitReq = 100,
    NbInitResp = 101,
    NbLinkInfo = 102,
    NbUpdateLinkReq = 103,
    NbDelLinkReq = 104,
    SbDelLinkResp = 105,
    NbPassthru = 106,
    SbPassthru = 107,
    NbIoctlResp = 108,
    NbGpsStartTimeAcquisition = 109,
    NbGpsStopTimeAcquisition = 110,
    SbGpsTime = 111,
    SbStartBfScanReq = 112,
    NbStartBfScanResp = 113,
    SbDisassocReq = 114,
    SbQueueStats = 115,
    SbShutdownReq = 116,
    NbGpsGetSelfPos = 117,
    SbGpsSetSelfPos = 118,
    NbHtsfInfo = 119,
}

impl FwEventType {
    const ALL: [FwEventType; 20] = [
        FwEventType::SbInitReq, FwEventType::NbInitResp, FwEventType::NbLinkInfo,
        FwEventType::NbUpdateLinkReq, FwEventType::NbDelLinkReq, FwEventType::SbDelLinkResp,
        FwEventType::NbPassthru, FwEventType::SbPassthru, FwEventType::NbIoctlResp,
        FwEventType::NbGpsStartTimeAcquisition, FwEventType::NbGpsStopTimeAcquisition,
        FwEventType::SbGpsTime, FwEventType::SbStartBfScanReq, FwEventType::NbStartBfScanResp,
        FwEventType::SbDisassocReq, FwEventType::SbQueueStats, FwEventType::SbShutdownReq,
        FwEventType::NbGpsGetSelfPos, FwEventType::SbGpsSetSelfPos, FwEventType::NbHtsfInfo,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        let idx = v.checked_sub(FwEventType::SbInitReq as u8)? as usize;
        FwEventType::ALL.get(idx).copied()
    }
}

/// Link security mode reported with link-up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum WsecAuth {
    #[default]
    Disabled = 0,
    Psk = 1,
    Eap = 2,
}

impl WsecAuth {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => WsecAuth::Psk,
            2 => WsecAuth::Eap,
            _ => WsecAuth::Disabled,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BfRole {
    Initiator = 0,
    Responder = 1,
}

// ============================================================================
// PAYLOAD LAYOUTS
// ============================================================================

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FwHeader {
    pub msg_type: u8,
    pub pad: [u8; 3],
}
const _: () = assert!(mem::size_of::<FwHeader>() == FW_HDR_LEN);

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FwInitRspRaw {
    pub err_code: u8,
    pub mac: [u8; 6],
    pub version: u32,
    pub chip_id: u32,
    pub vendor: [u8; 16],
}
const _: () = assert!(mem::size_of::<FwInitRspRaw>() == 31);

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BfAcqReqRaw {
    pub addr: [u8; 6],
    pub role: u8,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct BfAcqRspRaw {
    pub addr: [u8; 6],
    pub role: u8,
    pub err_code: u8,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct LinkStatusRaw {
    pub link_status: u8,
    pub addr: [u8; 6],
    pub failure_cause: u8,
    pub sta_node_type: u8,
    pub peer_node_type: u8,
    pub assoc_req_ie_len: u8,
    pub assoc_resp_ie_len: u8,
    pub wsec_auth: u8,
}
const _: () = assert!(mem::size_of::<LinkStatusRaw>() == 13);

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct LinkInfoRaw {
    pub addr: [u8; 6],
    pub rx_link: u8,
    pub tx_link: u8,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct DelLinkRspRaw {
    pub err_code: u8,
    pub addr: [u8; 6],
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, Default, PartialEq, Eq)]
pub struct GpsTime {
    pub seconds_lo: u32,
    pub seconds_hi: u32,
    pub nanoseconds: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, Default, PartialEq, Eq)]
pub struct GpsPos {
    pub latitude: i32,
    pub longitude: i32,
    pub height: i32,
    pub accuracy: i32,
}

/// One per-link congestion sample pushed southbound every sampler tick.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, Default, PartialEq, Eq)]
pub struct QueueStatsEntry {
    pub bytes_pending: u32,
    /// bytes per millisecond
    pub arrival_rate: u32,
    pub dst_mac: [u8; 6],
}
const _: () = assert!(mem::size_of::<QueueStatsEntry>() == 14);

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, Default, PartialEq, Eq)]
pub struct HtsfInfo {
    pub tx_rx_diff_ns: i32,
    pub delay_est_ns: i32,
    pub rx_start_us: u32,
}

// ============================================================================
// DECODED NORTHBOUND MESSAGES
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FwInitResp {
    pub err_code: u8,
    pub mac: MacAddr,
    pub version: u32,
    pub chip_id: u32,
    pub vendor: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkUpdate {
    pub status: u8,
    pub peer: MacAddr,
    pub failure_cause: u8,
    pub sta_node_type: u8,
    pub peer_node_type: u8,
    pub wsec_auth: WsecAuth,
    pub assoc_req_ies: Vec<u8>,
    pub assoc_resp_ies: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BfScanResp {
    pub peer: MacAddr,
    pub role: u8,
    pub err_code: u8,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FwMessage {
    InitResp(FwInitResp),
    LinkInfo { peer: MacAddr, rx_link: u8, tx_link: u8 },
    UpdateLink(LinkUpdate),
    DelLink { peer: MacAddr },
    Passthru(Vec<u8>),
    IoctlResp { err_code: u8 },
    GpsStartTimeAcquisition,
    GpsStopTimeAcquisition,
    GpsGetSelfPos,
    BfScanResp(BfScanResp),
    HtsfInfo(HtsfInfo),
    /// A southbound type echoed back. Never expected from firmware.
    Southbound(FwEventType),
}

// ============================================================================
// HELPERS
// ============================================================================

fn read<T: Pod>(payload: &[u8]) -> Result<T> {
    let n = mem::size_of::<T>();
    if payload.len() < n {
        return Err(TgdError::MalformedMessage("payload shorter than message layout"));
    }
    Ok(bytemuck::pod_read_unaligned(&payload[..n]))
}

fn read_var_data(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < VAR_DATA_HDR_LEN {
        return Err(TgdError::MalformedMessage("missing variable data header"));
    }
    let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let body = &payload[VAR_DATA_HDR_LEN..];
    if len > body.len() || len > MAX_VAR_DATA_LEN.max(VENDOR_IOCTL_MAX_SIZE) {
        return Err(TgdError::MalformedMessage("variable data length exceeds message"));
    }
    Ok(body[..len].to_vec())
}

fn header(t: FwEventType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LOCAL_IOCTL_BUF_SIZE);
    buf.extend_from_slice(bytemuck::bytes_of(&FwHeader { msg_type: t as u8, pad: [0; 3] }));
    buf
}

/// Append {len, data}. When the total would exceed `max`, only an empty
/// variable-data header is appended and the request still goes out.
fn push_var_data(buf: &mut Vec<u8>, data: &[u8], max: usize) {
    let hdr_size = buf.len() + VAR_DATA_HDR_LEN;
    if hdr_size + data.len() > max {
        warn!("[TGD-FW] var data len {} exceeds {}: sending base message only", hdr_size + data.len(), max);
        buf.extend_from_slice(&0u32.to_le_bytes());
        return;
    }
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

// ============================================================================
// SOUTHBOUND ENCODERS
// ============================================================================

pub fn encode_init_req(var: &[u8]) -> Vec<u8> {
    let mut buf = header(FwEventType::SbInitReq);
    push_var_data(&mut buf, var, LOCAL_IOCTL_BUF_SIZE);
    buf
}

/// At most QUEUE_STATS_MAX_LINKS entries are carried.
pub fn encode_queue_stats(entries: &[QueueStatsEntry]) -> Vec<u8> {
    let n = entries.len().min(QUEUE_STATS_MAX_LINKS);
    let mut buf = header(FwEventType::SbQueueStats);
    buf.extend_from_slice(bytemuck::cast_slice(&entries[..n]));
    buf
}

pub fn encode_disassoc_req(peer: MacAddr) -> Vec<u8> {
    let mut buf = header(FwEventType::SbDisassocReq);
    buf.extend_from_slice(&peer.0);
    buf
}

pub fn encode_bf_scan_req(peer: MacAddr, role: BfRole, var: &[u8]) -> Vec<u8> {
    let mut buf = header(FwEventType::SbStartBfScanReq);
    buf.extend_from_slice(bytemuck::bytes_of(&BfAcqReqRaw { addr: peer.0, role: role as u8 }));
    push_var_data(&mut buf, var, LOCAL_IOCTL_BUF_SIZE);
    buf
}

pub fn encode_del_link_resp(peer: MacAddr, err_code: u8) -> Vec<u8> {
    let mut buf = header(FwEventType::SbDelLinkResp);
    buf.extend_from_slice(bytemuck::bytes_of(&DelLinkRspRaw { err_code, addr: peer.0 }));
    buf
}

pub fn encode_gps_time(t: GpsTime) -> Vec<u8> {
    let mut buf = header(FwEventType::SbGpsTime);
    let le = GpsTime {
        seconds_lo: t.seconds_lo.to_le(),
        seconds_hi: t.seconds_hi.to_le(),
        nanoseconds: t.nanoseconds.to_le(),
    };
    buf.extend_from_slice(bytemuck::bytes_of(&le));
    buf
}

pub fn encode_gps_pos(p: GpsPos) -> Vec<u8> {
    let mut buf = header(FwEventType::SbGpsSetSelfPos);
    let le = GpsPos {
        latitude: p.latitude.to_le(),
        longitude: p.longitude.to_le(),
        height: p.height.to_le(),
        accuracy: p.accuracy.to_le(),
    };
    buf.extend_from_slice(bytemuck::bytes_of(&le));
    buf
}

pub fn encode_passthrough(var: &[u8]) -> Vec<u8> {
    let mut buf = header(FwEventType::SbPassthru);
    push_var_data(&mut buf, var, VENDOR_IOCTL_MAX_SIZE);
    buf
}

pub fn encode_shutdown() -> Vec<u8> { header(FwEventType::SbShutdownReq) }

/// Generic ioctl response: header + errCode.
pub fn encode_ioctl_resp(err_code: u8) -> Vec<u8> {
    let mut buf = header(FwEventType::NbIoctlResp);
    buf.push(err_code);
    buf
}

/// Firmware error code carried by an ioctl response buffer.
pub fn response_err_code(resp: &[u8]) -> Result<u8> {
    resp.get(FW_HDR_LEN).copied().ok_or(TgdError::MalformedMessage("ioctl response too short"))
}

// ============================================================================
// NORTHBOUND ENCODERS (firmware side, used by the loopback radio)
// ============================================================================

pub fn encode_init_resp(r: &FwInitResp) -> Vec<u8> {
    let mut vendor = [0u8; 16];
    let n = r.vendor.len().min(15);
    vendor[..n].copy_from_slice(&r.vendor.as_bytes()[..n]);
    let mut buf = header(FwEventType::NbInitResp);
    buf.extend_from_slice(bytemuck::bytes_of(&FwInitRspRaw {
        err_code: r.err_code,
        mac: r.mac.0,
        version: r.version.to_le(),
        chip_id: r.chip_id.to_le(),
        vendor,
    }));
    buf
}

pub fn encode_link_info(peer: MacAddr, rx_link: u8, tx_link: u8) -> Vec<u8> {
    let mut buf = header(FwEventType::NbLinkInfo);
    buf.extend_from_slice(bytemuck::bytes_of(&LinkInfoRaw { addr: peer.0, rx_link, tx_link }));
    buf
}

pub fn encode_link_status(u: &LinkUpdate) -> Vec<u8> {
    let mut buf = header(FwEventType::NbUpdateLinkReq);
    buf.extend_from_slice(bytemuck::bytes_of(&LinkStatusRaw {
        link_status: u.status,
        addr: u.peer.0,
        failure_cause: u.failure_cause,
        sta_node_type: u.sta_node_type,
        peer_node_type: u.peer_node_type,
        assoc_req_ie_len: u.assoc_req_ies.len().min(u8::MAX as usize) as u8,
        assoc_resp_ie_len: u.assoc_resp_ies.len().min(u8::MAX as usize) as u8,
        wsec_auth: u.wsec_auth as u8,
    }));
    buf.extend_from_slice(&u.assoc_req_ies[..u.assoc_req_ies.len().min(u8::MAX as usize)]);
    buf.extend_from_slice(&u.assoc_resp_ies[..u.assoc_resp_ies.len().min(u8::MAX as usize)]);
    buf
}

pub fn encode_del_link_req(peer: MacAddr) -> Vec<u8> {
    let mut buf = header(FwEventType::NbDelLinkReq);
    buf.extend_from_slice(&peer.0);
    buf
}

pub fn encode_nb_passthru(var: &[u8]) -> Vec<u8> {
    let mut buf = header(FwEventType::NbPassthru);
    push_var_data(&mut buf, var, VENDOR_IOCTL_MAX_SIZE);
    buf
}

pub fn encode_bf_scan_resp(r: &BfScanResp) -> Vec<u8> {
    let mut buf = header(FwEventType::NbStartBfScanResp);
    buf.extend_from_slice(bytemuck::bytes_of(&BfAcqRspRaw { addr: r.peer.0, role: r.role, err_code: r.err_code }));
    push_var_data(&mut buf, &r.data, LOCAL_IOCTL_BUF_SIZE);
    buf
}

pub fn encode_htsf_info(h: HtsfInfo) -> Vec<u8> {
    let mut buf = header(FwEventType::NbHtsfInfo);
    let le = HtsfInfo {
        tx_rx_diff_ns: h.tx_rx_diff_ns.to_le(),
        delay_est_ns: h.delay_est_ns.to_le(),
        rx_start_us: h.rx_start_us.to_le(),
    };
    buf.extend_from_slice(bytemuck::bytes_of(&le));
    buf
}

pub fn encode_simple(t: FwEventType) -> Vec<u8> { header(t) }

// ============================================================================
// DECODER
// ============================================================================

pub fn decode(buf: &[u8]) -> Result<FwMessage> {
    if buf.len() < FW_HDR_LEN {
        return Err(TgdError::MalformedMessage("event shorter than header"));
    }
    let t = FwEventType::from_u8(buf[0]).ok_or(TgdError::UnknownMessage(buf[0]))?;
    let p = &buf[FW_HDR_LEN..];
    let msg = match t {
        FwEventType::NbInitResp => {
            let r: FwInitRspRaw = read(p)?;
            let end = r.vendor.iter().position(|b| *b == 0).unwrap_or(r.vendor.len());
            FwMessage::InitResp(FwInitResp {
                err_code: r.err_code,
                mac: MacAddr(r.mac),
                version: u32::from_le(r.version),
                chip_id: u32::from_le(r.chip_id),
                vendor: String::from_utf8_lossy(&r.vendor[..end]).into_owned(),
            })
        }
        FwEventType::NbLinkInfo => {
            let r: LinkInfoRaw = read(p)?;
            FwMessage::LinkInfo { peer: MacAddr(r.addr), rx_link: r.rx_link, tx_link: r.tx_link }
        }
        FwEventType::NbUpdateLinkReq => {
            let r: LinkStatusRaw = read(p)?;
            let tlvs = &p[mem::size_of::<LinkStatusRaw>()..];
            let req_len = r.assoc_req_ie_len as usize;
            let resp_len = r.assoc_resp_ie_len as usize;
            if tlvs.len() < req_len + resp_len {
                return Err(TgdError::MalformedMessage("link status IEs exceed message"));
            }
            FwMessage::UpdateLink(LinkUpdate {
                status: r.link_status,
                peer: MacAddr(r.addr),
                failure_cause: r.failure_cause,
                sta_node_type: r.sta_node_type,
                peer_node_type: r.peer_node_type,
                wsec_auth: WsecAuth::from_u8(r.wsec_auth),
                assoc_req_ies: tlvs[..req_len].to_vec(),
                assoc_resp_ies: tlvs[req_len..req_len + resp_len].to_vec(),
            })
        }
        FwEventType::NbDelLinkReq => {
            let addr: [u8; 6] = read(p)?;
            FwMessage::DelLink { peer: MacAddr(addr) }
        }
        FwEventType::NbPassthru => FwMessage::Passthru(read_var_data(p)?),
        FwEventType::NbIoctlResp => {
            let err_code: u8 = read(p)?;
            FwMessage::IoctlResp { err_code }
        }
        FwEventType::NbGpsStartTimeAcquisition => FwMessage::GpsStartTimeAcquisition,
        FwEventType::NbGpsStopTimeAcquisition => FwMessage::GpsStopTimeAcquisition,
        FwEventType::NbGpsGetSelfPos => FwMessage::GpsGetSelfPos,
        FwEventType::NbStartBfScanResp => {
            let r: BfAcqRspRaw = read(p)?;
            let data = read_var_data(&p[mem::size_of::<BfAcqRspRaw>()..])?;
            FwMessage::BfScanResp(BfScanResp { peer: MacAddr(r.addr), role: r.role, err_code: r.err_code, data })
        }
        FwEventType::NbHtsfInfo => {
            let r: HtsfInfo = read(p)?;
            FwMessage::HtsfInfo(HtsfInfo {
                tx_rx_diff_ns: i32::from_le(r.tx_rx_diff_ns),
                delay_est_ns: i32::from_le(r.delay_est_ns),
                rx_start_us: u32::from_le(r.rx_start_us),
            })
        }
        sb => FwMessage::Southbound(sb),
    };
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_mapping() {
        assert_eq!(FwEventType::from_u8(100), Some(FwEventType::SbInitReq));
        assert_eq!(FwEventType::from_u8(119), Some(FwEventType::NbHtsfInfo));
        assert_eq!(FwEventType::from_u8(99), None);
        assert_eq!(FwEventType::from_u8(120), None);
    }

    #[test]
    fn oversized_var_data_sends_base_only() {
        let big = vec![0xAB; LOCAL_IOCTL_BUF_SIZE];
        let req = encode_init_req(&big);
        assert_eq!(req.len(), FW_HDR_LEN + VAR_DATA_HDR_LEN);
        assert_eq!(&req[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn queue_stats_capped() {
        let entries = vec![QueueStatsEntry::default(); QUEUE_STATS_MAX_LINKS + 4];
        let req = encode_queue_stats(&entries);
        assert_eq!(req.len(), FW_HDR_LEN + QUEUE_STATS_MAX_LINKS * 14);
        assert_eq!(req[0], FwEventType::SbQueueStats as u8);
    }

    #[test]
    fn link_status_with_ies_decodes() {
        let u = LinkUpdate {
            status: 2,
            peer: MacAddr([0xAA; 6]),
            failure_cause: 0,
            sta_node_type: 1,
            peer_node_type: 2,
            wsec_auth: WsecAuth::Psk,
            assoc_req_ies: vec![0x30, 1, 9],
            assoc_resp_ies: vec![0x30, 0],
        };
        assert_eq!(decode(&encode_link_status(&u)).unwrap(), FwMessage::UpdateLink(u));
    }

    #[test]
    fn truncated_ies_rejected() {
        let mut raw = encode_link_status(&LinkUpdate {
            status: 2,
            peer: MacAddr([1; 6]),
            failure_cause: 0,
            sta_node_type: 0,
            peer_node_type: 0,
            wsec_auth: WsecAuth::Disabled,
            assoc_req_ies: vec![1, 2, 3, 4],
            assoc_resp_ies: vec![],
        });
        raw.truncate(raw.len() - 2);
        assert!(matches!(decode(&raw), Err(TgdError::MalformedMessage(_))));
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(matches!(decode(&[42, 0, 0, 0]), Err(TgdError::UnknownMessage(42))));
    }

    #[test]
    fn response_code() {
        assert_eq!(response_err_code(&encode_ioctl_resp(7)).unwrap(), 7);
        assert!(response_err_code(&[108, 0, 0]).is_err());
    }
}
