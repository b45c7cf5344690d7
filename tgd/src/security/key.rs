// TGD - PAIRWISE KEY
// Data-plane keys handed to the radio. Only GCMP suites are accepted; the key
// material is validated against the matching AES-GCM key length before the
// radio ever sees it.

use ring::aead;

use crate::error::{Result, TgdError};

pub const WLAN_CIPHER_SUITE_GCMP: u32 = 0x000F_AC08;
pub const WLAN_CIPHER_SUITE_GCMP_256: u32 = 0x000F_AC09;

pub const MAX_KEY_LEN: usize = 64;
pub const MAX_KEY_INDEX: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyCipher {
    Gcmp128,
    Gcmp256,
}

impl KeyCipher {
    pub fn from_suite(suite: u32) -> Result<Self> {
        match suite {
            WLAN_CIPHER_SUITE_GCMP => Ok(KeyCipher::Gcmp128),
            WLAN_CIPHER_SUITE_GCMP_256 => Ok(KeyCipher::Gcmp256),
            _ => Err(TgdError::InvalidKey("cipher suite not supported")),
        }
    }

    pub fn suite(self) -> u32 {
        match self {
            KeyCipher::Gcmp128 => WLAN_CIPHER_SUITE_GCMP,
            KeyCipher::Gcmp256 => WLAN_CIPHER_SUITE_GCMP_256,
        }
    }

    fn algorithm(self) -> &'static aead::Algorithm {
        match self {
            KeyCipher::Gcmp128 => &aead::AES_128_GCM,
            KeyCipher::Gcmp256 => &aead::AES_256_GCM,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct PairwiseKey {
    pub index: u8,
    pub cipher: KeyCipher,
    material: Vec<u8>,
}

impl PairwiseKey {
    pub fn new(index: u8, suite: u32, material: &[u8]) -> Result<Self> {
        if index > MAX_KEY_INDEX {
            return Err(TgdError::InvalidKey("key index out of range"));
        }
        let cipher = KeyCipher::from_suite(suite)?;
        if material.len() > MAX_KEY_LEN {
            return Err(TgdError::InvalidKey("key too long"));
        }
        aead::UnboundKey::new(cipher.algorithm(), material)
            .map_err(|_| TgdError::InvalidKey("key length does not match cipher"))?;
        Ok(PairwiseKey { index, cipher, material: material.to_vec() })
    }

    pub fn material(&self) -> &[u8] { &self.material }
}

// Key bytes stay out of logs.
impl std::fmt::Debug for PairwiseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairwiseKey")
            .field("index", &self.index)
            .field("cipher", &self.cipher)
            .field("len", &self.material.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcmp_keys_accepted() {
        let k = PairwiseKey::new(0, WLAN_CIPHER_SUITE_GCMP, &[7; 16]).unwrap();
        assert_eq!(k.cipher, KeyCipher::Gcmp128);
        let k = PairwiseKey::new(4, WLAN_CIPHER_SUITE_GCMP_256, &[7; 32]).unwrap();
        assert_eq!(k.material().len(), 32);
        assert!(!format!("{:?}", k).contains("7, 7"));
    }

    #[test]
    fn bad_keys_rejected() {
        // CCMP
        assert!(matches!(PairwiseKey::new(0, 0x000F_AC04, &[0; 16]), Err(TgdError::InvalidKey(_))));
        assert!(PairwiseKey::new(5, WLAN_CIPHER_SUITE_GCMP, &[0; 16]).is_err());
        assert!(PairwiseKey::new(0, WLAN_CIPHER_SUITE_GCMP, &[0; 32]).is_err());
        assert!(PairwiseKey::new(0, WLAN_CIPHER_SUITE_GCMP_256, &[0; 65]).is_err());
    }
}
