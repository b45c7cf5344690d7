// TGD - EAPOL 4-WAY M4 DETECTION
// Outbound frame inspection for the supplicant's last handshake message.
// M4 is the only EAPOL-Key frame with pairwise+MIC+secure set and
// ack+request+error clear.

use crate::protocol::wire::{
    EapolHeader, EapolKeyHeader, ETH_HLEN, EAPOL_HDR_LEN, EAPOL_KEY, EAPOL_KEY_HDR_LEN, EAPOL_KEY_RSN,
    EAPOL_KEY_WPA, WPA_KEY_ACK, WPA_KEY_ERR, WPA_KEY_MIC, WPA_KEY_PAIR, WPA_KEY_REQ, WPA_KEY_SECURE,
};

pub const M4_KEY_INFO_MASK: u16 =
    WPA_KEY_PAIR | WPA_KEY_ACK | WPA_KEY_MIC | WPA_KEY_SECURE | WPA_KEY_ERR | WPA_KEY_REQ;
pub const M4_KEY_INFO: u16 = WPA_KEY_PAIR | WPA_KEY_MIC | WPA_KEY_SECURE;

/// `frame` is a full Ethernet frame already known to be EAPOL.
pub fn is_4way_m4(frame: &[u8]) -> bool {
    if frame.len() < ETH_HLEN + EAPOL_HDR_LEN + EAPOL_KEY_HDR_LEN {
        return false;
    }
    let eapol: EapolHeader = bytemuck::pod_read_unaligned(&frame[ETH_HLEN..ETH_HLEN + EAPOL_HDR_LEN]);
    if eapol.packet_type != EAPOL_KEY {
        return false;
    }
    let at = ETH_HLEN + EAPOL_HDR_LEN;
    let key: EapolKeyHeader = bytemuck::pod_read_unaligned(&frame[at..at + EAPOL_KEY_HDR_LEN]);
    if key.descriptor != EAPOL_KEY_RSN && key.descriptor != EAPOL_KEY_WPA {
        return false;
    }
    key.key_info() & M4_KEY_INFO_MASK == M4_KEY_INFO
}

/// Test and loopback helper: a minimal EAPOL-Key frame with the given key info.
pub fn build_eapol_key(dst: [u8; 6], src: [u8; 6], descriptor: u8, key_info: u16) -> Vec<u8> {
    let mut f = Vec::with_capacity(ETH_HLEN + EAPOL_HDR_LEN + EAPOL_KEY_HDR_LEN);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&src);
    f.extend_from_slice(&crate::protocol::wire::ETH_P_PAE.to_be_bytes());
    f.extend_from_slice(&[2, EAPOL_KEY]);
    f.extend_from_slice(&(EAPOL_KEY_HDR_LEN as u16).to_be_bytes());
    f.push(descriptor);
    f.extend_from_slice(&key_info.to_be_bytes());
    f.extend_from_slice(&16u16.to_be_bytes());
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::WPA_KEY_INSTALL;

    const M3: u16 = WPA_KEY_PAIR | WPA_KEY_INSTALL | WPA_KEY_ACK | WPA_KEY_MIC | WPA_KEY_SECURE;

    #[test]
    fn m4_pattern_matches() {
        let f = build_eapol_key([1; 6], [2; 6], EAPOL_KEY_RSN, M4_KEY_INFO);
        assert!(is_4way_m4(&f));
        let f = build_eapol_key([1; 6], [2; 6], EAPOL_KEY_WPA, M4_KEY_INFO | 0x0002);
        assert!(is_4way_m4(&f));
    }

    #[test]
    fn other_handshake_messages_do_not_match() {
        // M2: pairwise + MIC, not yet secure
        let m2 = build_eapol_key([1; 6], [2; 6], EAPOL_KEY_RSN, WPA_KEY_PAIR | WPA_KEY_MIC);
        assert!(!is_4way_m4(&m2));
        assert!(!is_4way_m4(&build_eapol_key([1; 6], [2; 6], EAPOL_KEY_RSN, M3)));
        assert!(!is_4way_m4(&build_eapol_key([1; 6], [2; 6], EAPOL_KEY_RSN, M4_KEY_INFO | WPA_KEY_REQ)));
        assert!(!is_4way_m4(&build_eapol_key([1; 6], [2; 6], 7, M4_KEY_INFO)));
    }

    #[test]
    fn non_key_and_short_frames_rejected() {
        let mut f = build_eapol_key([1; 6], [2; 6], EAPOL_KEY_RSN, M4_KEY_INFO);
        f[ETH_HLEN + 1] = 0; // EAP packet
        assert!(!is_4way_m4(&f));
        let f = build_eapol_key([1; 6], [2; 6], EAPOL_KEY_RSN, M4_KEY_INFO);
        assert!(!is_4way_m4(&f[..f.len() - 1]));
    }
}
