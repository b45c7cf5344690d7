// TGD - A-MSDU CODEC
// Software Terragraph A-MSDU framing. Stateless.
//
// Aggregate layout:
//   DA(6) SA(6) ETH_P_TGAMSDU(2) | AmsduSubHeader(6) | len[count-1] (BE u16) | sub-frames
// Each sub-frame starts with the inner ethertype. The last sub-frame length is
// implicit (remaining bytes). A de-aggregated sub-frame gets DA+SA put back in front.

use std::collections::VecDeque;
use std::mem;

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::error::{Result, TgdError};
use crate::protocol::frame::Frame;
use crate::protocol::wire::{ethertype_of, ETH_ADDRS_LEN, ETH_HLEN, ETH_P_PAE, ETH_P_TGAMSDU, ETH_P_TGSTDAMSDU};

// ============================================================================
// HEADER
// ============================================================================

pub const AMSDU_TYPE_SHORT: u8 = 0;
pub const AMSDU_TYPE_STD: u8 = 1;
/// Offload header context id used for software-built aggregates.
pub const AMSDU_SW_CONTEXT: u8 = 6;
pub const AMSDU_MIN_SUBFRAME: usize = 2;

#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, PartialEq, Eq)]
pub struct AmsduSubHeader {
    pub agg_type: u8,
    pub agg_ctx: u8,
    pub agg_cnt: u8,
    pub reserved: [u8; 3],
}
pub const AMSDU_SUBHDR_LEN: usize = 6;
const _: () = assert!(mem::size_of::<AmsduSubHeader>() == AMSDU_SUBHDR_LEN);

/// Bytes pushed in front of a frame by `encapsulate`: new ethertype + sub-header.
pub const AMSDU_PREFIX_LEN: usize = 2 + AMSDU_SUBHDR_LEN;

impl AmsduSubHeader {
    pub const SINGLE: AmsduSubHeader = AmsduSubHeader {
        agg_type: AMSDU_TYPE_SHORT,
        agg_ctx: AMSDU_SW_CONTEXT,
        agg_cnt: 1,
        reserved: [0; 3],
    };
}

/// Aggregation frame format of a radio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameFormat {
    #[default]
    Short,
    StdShort,
}

impl FrameFormat {
    pub fn ethertype(self) -> u16 {
        match self {
            FrameFormat::Short => ETH_P_TGAMSDU,
            FrameFormat::StdShort => ETH_P_TGSTDAMSDU,
        }
    }
}

/// True when the frame carries either Terragraph aggregate ethertype.
#[inline(always)]
pub fn is_aggregate(frame: &[u8]) -> bool {
    matches!(ethertype_of(frame), Some(ETH_P_TGAMSDU) | Some(ETH_P_TGSTDAMSDU))
}

// ============================================================================
// ENCODE
// ============================================================================

/// Wrap a single Ethernet frame into a one-sub-frame aggregate.
/// EAPOL frames (and runts with no ethertype) come back untouched.
pub fn encapsulate(mut frame: Frame) -> Frame {
    match ethertype_of(frame.data()) {
        None | Some(ETH_P_PAE) => return frame,
        Some(_) => {}
    }
    let mut addrs = [0u8; ETH_ADDRS_LEN];
    addrs.copy_from_slice(&frame.data()[..ETH_ADDRS_LEN]);

    frame.push_front(AMSDU_PREFIX_LEN);
    let d = frame.data_mut();
    d[..ETH_ADDRS_LEN].copy_from_slice(&addrs);
    d[ETH_ADDRS_LEN..ETH_HLEN].copy_from_slice(&ETH_P_TGAMSDU.to_be_bytes());
    d[ETH_HLEN..ETH_HLEN + AMSDU_SUBHDR_LEN].copy_from_slice(bytemuck::bytes_of(&AmsduSubHeader::SINGLE));
    frame
}

/// Build a multi-sub-frame aggregate. Each payload begins with its inner ethertype.
pub fn aggregate(dst: [u8; 6], src: [u8; 6], subframes: &[&[u8]]) -> Result<Frame> {
    if subframes.is_empty() || subframes.len() > u8::MAX as usize {
        return Err(TgdError::InvalidArgument("sub-frame count"));
    }
    let table = (subframes.len() - 1) * 2;
    let body: usize = subframes.iter().map(|s| s.len()).sum();
    let mut out = Vec::with_capacity(ETH_HLEN + AMSDU_SUBHDR_LEN + table + body);
    out.extend_from_slice(&dst);
    out.extend_from_slice(&src);
    out.extend_from_slice(&ETH_P_TGAMSDU.to_be_bytes());
    let hdr = AmsduSubHeader { agg_cnt: subframes.len() as u8, ..AmsduSubHeader::SINGLE };
    out.extend_from_slice(bytemuck::bytes_of(&hdr));
    for sub in &subframes[..subframes.len() - 1] {
        let len = u16::try_from(sub.len()).map_err(|_| TgdError::PayloadTooLarge { len: sub.len(), max: u16::MAX as usize })?;
        out.extend_from_slice(&len.to_be_bytes());
    }
    for sub in subframes {
        out.extend_from_slice(sub);
    }
    Ok(Frame::new(&out))
}

// ============================================================================
// DECODE
// ============================================================================

/// Split an aggregate into its sub-frames, in transmission order.
/// Any bad length fails the whole batch: no sub-frame is returned and the
/// input is consumed.
pub fn decapsulate(frame: Frame) -> Result<VecDeque<Frame>> {
    let data = frame.data();
    let fixed = ETH_HLEN + AMSDU_SUBHDR_LEN;
    if data.len() < fixed {
        return Err(TgdError::Truncated { need: fixed, have: data.len() });
    }
    let hdr: AmsduSubHeader = bytemuck::pod_read_unaligned(&data[ETH_HLEN..fixed]);
    let count = hdr.agg_cnt as usize;
    if count == 0 {
        return Err(TgdError::MalformedAmsdu("zero sub-frame count"));
    }
    let table_end = fixed + (count - 1) * 2;
    if data.len() < table_end {
        return Err(TgdError::Truncated { need: table_end, have: data.len() });
    }

    let mut addrs = [0u8; ETH_ADDRS_LEN];
    addrs.copy_from_slice(&data[..ETH_ADDRS_LEN]);
    let table = &data[fixed..table_end];

    let mut out = VecDeque::with_capacity(count);
    let mut off = table_end;
    for i in 0..count {
        let remaining = data.len() - off;
        let len = if i + 1 < count {
            u16::from_be_bytes([table[2 * i], table[2 * i + 1]]) as usize
        } else {
            remaining
        };
        if len < AMSDU_MIN_SUBFRAME || len > remaining {
            debug!("[TGD-AMSDU] sub-frame {}/{} len {} remaining {}: batch dropped", i + 1, count, len, remaining);
            return Err(TgdError::MalformedAmsdu("sub-frame length out of range"));
        }
        let mut sub = frame.clone_region(off, off + len);
        sub.push_front(ETH_ADDRS_LEN).copy_from_slice(&addrs);
        out.push_back(sub);
        off += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth(ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x02, 0, 0, 0, 0, 0xAA, 0x02, 0, 0, 0, 0, 0xBB];
        v.extend_from_slice(&ethertype.to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn encapsulate_grows_by_prefix() {
        let raw = eth(0x0800, &[1, 2, 3, 4]);
        let f = encapsulate(Frame::new(&raw));
        assert_eq!(f.len(), raw.len() + AMSDU_PREFIX_LEN);
        assert_eq!(ethertype_of(f.data()), Some(ETH_P_TGAMSDU));
        assert_eq!(&f.data()[..12], &raw[..12]);
        assert_eq!(&f.data()[14..20], &[0, 6, 1, 0, 0, 0]);
        assert_eq!(&f.data()[20..], &raw[12..]);
    }

    #[test]
    fn eapol_is_not_aggregated() {
        let raw = eth(ETH_P_PAE, &[1, 3, 0, 0]);
        let f = encapsulate(Frame::new(&raw));
        assert_eq!(f.data(), &raw[..]);
    }

    #[test]
    fn zero_count_is_malformed() {
        let mut raw = eth(ETH_P_TGAMSDU, &[0, 6, 0, 0, 0, 0]);
        raw.extend_from_slice(&[0x08, 0x00, 1, 2]);
        assert!(matches!(decapsulate(Frame::new(&raw)), Err(TgdError::MalformedAmsdu(_))));
    }

    #[test]
    fn short_table_is_truncated() {
        let mut raw = eth(ETH_P_TGAMSDU, &[0, 6, 4, 0, 0, 0]);
        raw.extend_from_slice(&[0x00, 0x04]);
        assert!(matches!(decapsulate(Frame::new(&raw)), Err(TgdError::Truncated { .. })));
    }

    #[test]
    fn sub_frames_keep_priority() {
        let agg = aggregate([1; 6], [2; 6], &[&[0x08, 0x00, 9], &[0x86, 0xDD, 7, 7]])
            .unwrap()
            .with_priority(5);
        let subs = decapsulate(agg).unwrap();
        assert_eq!(subs.len(), 2);
        assert!(subs.iter().all(|s| s.priority == 5));
    }
}
