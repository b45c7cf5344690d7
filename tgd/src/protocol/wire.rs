// TGD - WIRE DEFINITIONS
// Ethernet and EAPOL header layouts seen on the backhaul data path.
// All header structs are #[repr(C, packed)] for zero-copy cast from frame bytes.
// Multi-byte fields are kept as big-endian byte arrays; accessors convert.

use std::fmt;
use std::mem;

use bytemuck::{Pod, Zeroable};

// ============================================================================
// WIRE CONSTANTS
// ============================================================================

pub const ETH_ALEN: usize = 6;

/// IEEE 802.1X port access entity (EAPOL). Never aggregated, always passes the port gate.
pub const ETH_P_PAE: u16 = 0x888E;
/// Terragraph short-format A-MSDU ethertype.
pub const ETH_P_TGAMSDU: u16 = 0x88B6;
/// Terragraph standard-short A-MSDU ethertype (DPAA2 classification only).
pub const ETH_P_TGSTDAMSDU: u16 = 0x88B5;

// EAPOL packet types
pub const EAPOL_KEY: u8 = 3;

// EAPOL-Key descriptor types
pub const EAPOL_KEY_WPA: u8 = 254;
pub const EAPOL_KEY_RSN: u8 = 2;

// EAPOL-Key key_info bits
pub const WPA_KEY_PAIR: u16 = 0x0008;
pub const WPA_KEY_INSTALL: u16 = 0x0040;
pub const WPA_KEY_ACK: u16 = 0x0080;
pub const WPA_KEY_MIC: u16 = 0x0100;
pub const WPA_KEY_SECURE: u16 = 0x0200;
pub const WPA_KEY_ERR: u16 = 0x0400;
pub const WPA_KEY_REQ: u16 = 0x0800;

// ============================================================================
// MAC ADDRESS
// ============================================================================

/// 48-bit station address. All-zero means "never used".
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct MacAddr(pub [u8; ETH_ALEN]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; ETH_ALEN]);
    pub const BROADCAST: MacAddr = MacAddr([0xFF; ETH_ALEN]);

    #[inline(always)]
    pub fn is_zero(&self) -> bool { self.0 == [0; ETH_ALEN] }

    /// Big-endian packing into the low 48 bits, the form firmware hooks expect.
    #[inline(always)]
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }

    #[inline(always)]
    pub fn from_u64(v: u64) -> Self {
        let b = v.to_be_bytes();
        MacAddr([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        let arr: [u8; ETH_ALEN] = s.get(..ETH_ALEN)?.try_into().ok()?;
        Some(MacAddr(arr))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

impl std::str::FromStr for MacAddr {
    type Err = crate::TgdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; ETH_ALEN];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(crate::TgdError::InvalidArgument("mac address"))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| crate::TgdError::InvalidArgument("mac address"))?;
        }
        if parts.next().is_some() {
            return Err(crate::TgdError::InvalidArgument("mac address"));
        }
        Ok(MacAddr(out))
    }
}

// ============================================================================
// WIRE HEADERS
// ============================================================================

/// IEEE 802.3 Ethernet header. 14 bytes on wire: dst(6) + src(6) + ethertype(2).
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct EthernetHeader {
    pub dst: [u8; ETH_ALEN],
    pub src: [u8; ETH_ALEN],
    pub ethertype: [u8; 2],
}
const _: () = assert!(mem::size_of::<EthernetHeader>() == 14);

impl EthernetHeader {
    #[inline(always)]
    pub fn ethertype(&self) -> u16 { u16::from_be_bytes(self.ethertype) }
}

/// 802.1X EAPOL header. 4 bytes.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct EapolHeader {
    pub version: u8,
    pub packet_type: u8,
    pub length: [u8; 2],
}
const _: () = assert!(mem::size_of::<EapolHeader>() == 4);

/// Leading fields of an EAPOL-Key descriptor. The rest is not needed to spot M4.
#[repr(C, packed)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct EapolKeyHeader {
    pub descriptor: u8,
    pub key_info: [u8; 2],
    pub key_len: [u8; 2],
}
const _: () = assert!(mem::size_of::<EapolKeyHeader>() == 5);

impl EapolKeyHeader {
    #[inline(always)]
    pub fn key_info(&self) -> u16 { u16::from_be_bytes(self.key_info) }
}

// ============================================================================
// DERIVED CONSTANTS
// ============================================================================

pub const ETH_HLEN: usize = mem::size_of::<EthernetHeader>();
pub const EAPOL_HDR_LEN: usize = mem::size_of::<EapolHeader>();
pub const EAPOL_KEY_HDR_LEN: usize = mem::size_of::<EapolKeyHeader>();
/// Offset of the ethertype inside the Ethernet header (DA + SA).
pub const ETH_ADDRS_LEN: usize = 2 * ETH_ALEN;

/// Ethertype of a raw Ethernet frame, if it is long enough to carry one.
#[inline(always)]
pub fn ethertype_of(frame: &[u8]) -> Option<u16> {
    frame.get(ETH_ADDRS_LEN..ETH_HLEN).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

#[inline(always)]
pub fn is_eapol(frame: &[u8]) -> bool { ethertype_of(frame) == Some(ETH_P_PAE) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_u64_conversion() {
        let mac = MacAddr([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(mac.to_u64(), 0x0211_2233_4455);
        assert_eq!(MacAddr::from_u64(0x0211_2233_4455), mac);
    }

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:00:11:22");
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:00:11:22:33".parse::<MacAddr>().is_err());
    }

    #[test]
    fn ethertype_extraction() {
        let mut frame = [0u8; 20];
        frame[12] = 0x88;
        frame[13] = 0x8E;
        assert!(is_eapol(&frame));
        assert_eq!(ethertype_of(&frame[..13]), None);
    }
}
