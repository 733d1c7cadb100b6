// MIT License - Copyright (c) 2026 Peter Wright

use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};

use crate::constants::CRC_TABLE;
use crate::error::{BridgeError, Result};

/// Compute the CRC-16/ARC of a frame body (reflected 0xA001, init 0x0000).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[((crc ^ byte as u16) & 0xFF) as usize];
    }
    crc
}

/// CRC-16 as the 4-character uppercase hex string used on the wire.
pub fn crc16_hex(data: &[u8]) -> String {
    format!("{:04X}", crc16(data))
}

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-CBC engine for encrypted DC-09 data blocks.
///
/// The configured key is a string of 16 or 32 hex characters whose ASCII
/// bytes are used directly as the AES-128/AES-256 key. The IV is all
/// zeros; each data block is an independent CBC stream. With no key
/// configured the engine is inert and encrypted frames are refused.
pub struct SiaCrypt {
    key: Option<Vec<u8>>,
}

impl SiaCrypt {
    /// Build an engine from an optional key string, validating its shape.
    pub fn new(key: Option<&str>) -> Result<Self> {
        let key = match key {
            None => None,
            Some(k) => {
                if !(k.len() == 16 || k.len() == 32) {
                    return Err(BridgeError::config(format!(
                        "encryption key must be 16 or 32 hex characters, got {}",
                        k.len()
                    )));
                }
                if !k.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(BridgeError::config(
                        "encryption key must contain only hex characters",
                    ));
                }
                Some(k.as_bytes().to_vec())
            }
        };
        Ok(Self { key })
    }

    /// Whether an encryption key is configured.
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Decrypt a raw ciphertext block. Fails if no key is configured or
    /// the ciphertext is not a whole number of AES blocks.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key.as_deref().ok_or_else(|| BridgeError::Decrypt {
            details: "received encrypted frame but no encryption key is configured".into(),
        })?;

        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(BridgeError::Decrypt {
                details: format!("ciphertext length {} is not a block multiple", ciphertext.len()),
            });
        }

        let iv = [0u8; 16];
        let plaintext = match key.len() {
            16 => Aes128CbcDec::new_from_slices(key, &iv)
                .map_err(|e| BridgeError::Decrypt { details: e.to_string() })?
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
            _ => Aes256CbcDec::new_from_slices(key, &iv)
                .map_err(|e| BridgeError::Decrypt { details: e.to_string() })?
                .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
        }
        .map_err(|e| BridgeError::Decrypt { details: e.to_string() })?;

        Ok(plaintext)
    }

    /// Encrypt a plaintext block, zero-padding it up to a block multiple.
    /// The padding lands before the `|` content marker so the decoder
    /// skips it.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key.as_deref().ok_or_else(|| BridgeError::Decrypt {
            details: "no encryption key configured".into(),
        })?;

        let mut padded = vec![b'0'; (16 - plaintext.len() % 16) % 16];
        padded.extend_from_slice(plaintext);

        let iv = [0u8; 16];
        let ciphertext = match key.len() {
            16 => Aes128CbcEnc::new_from_slices(key, &iv)
                .map_err(|e| BridgeError::Decrypt { details: e.to_string() })?
                .encrypt_padded_vec_mut::<NoPadding>(&padded),
            _ => Aes256CbcEnc::new_from_slices(key, &iv)
                .map_err(|e| BridgeError::Decrypt { details: e.to_string() })?
                .encrypt_padded_vec_mut::<NoPadding>(&padded),
        };

        Ok(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // Standard CRC-16/ARC check value
        assert_eq!(crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn test_crc_empty() {
        assert_eq!(crc16(b""), 0);
        assert_eq!(crc16_hex(b""), "0000");
    }

    #[test]
    fn test_crc_matches_bitwise_reference() {
        fn bitwise(data: &[u8]) -> u16 {
            let mut crc: u16 = 0;
            for &byte in data {
                let mut temp = byte as u16;
                for _ in 0..8 {
                    temp ^= crc & 1;
                    crc >>= 1;
                    if temp & 1 != 0 {
                        crc ^= 0xA001;
                    }
                    temp >>= 1;
                }
            }
            crc
        }

        for sample in [
            &b"\"SIA-DCS\"0001R0L0#000[|Nri1/CL1]"[..],
            b"ACK",
            b"\x00\xFF\x10\x02",
        ] {
            assert_eq!(crc16(sample), bitwise(sample));
        }
    }

    #[test]
    fn test_crc_hex_zero_padded() {
        // Hex form must always be 4 characters
        assert_eq!(crc16_hex(b"").len(), 4);
        assert!(crc16_hex(b"123456789").chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_validation() {
        assert!(SiaCrypt::new(None).is_ok());
        assert!(SiaCrypt::new(Some("AAAABBBBCCCCDDDD")).is_ok());
        assert!(SiaCrypt::new(Some("AAAABBBBCCCCDDDDAAAABBBBCCCCDDDD")).is_ok());
        assert!(SiaCrypt::new(Some("short")).is_err());
        assert!(SiaCrypt::new(Some("GGGGGGGGGGGGGGGG")).is_err());
        assert!(SiaCrypt::new(Some("AAAABBBBCCCCDDD")).is_err());
    }

    #[test]
    fn test_roundtrip_aes128() {
        let crypt = SiaCrypt::new(Some("0123456789ABCDEF")).unwrap();
        let plaintext = b"|Nri1/CL1]_09:13:02,08-05-2026";
        let ciphertext = crypt.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len() % 16, 0);
        let decrypted = crypt.decrypt(&ciphertext).unwrap();
        assert!(decrypted.ends_with(plaintext));
    }

    #[test]
    fn test_roundtrip_aes256() {
        let crypt = SiaCrypt::new(Some("0123456789ABCDEF0123456789ABCDEF")).unwrap();
        let plaintext = b"|Nri5/OP7]";
        let decrypted = crypt.decrypt(&crypt.encrypt(plaintext).unwrap()).unwrap();
        assert!(decrypted.ends_with(plaintext));
    }

    #[test]
    fn test_wrong_key_scrambles() {
        let enc = SiaCrypt::new(Some("0123456789ABCDEF")).unwrap();
        let dec = SiaCrypt::new(Some("FEDCBA9876543210")).unwrap();
        let plaintext = b"|Nri1/CL1]";
        let decrypted = dec.decrypt(&enc.encrypt(plaintext).unwrap()).unwrap();
        assert!(!decrypted.ends_with(plaintext));
    }

    #[test]
    fn test_decrypt_rejects_partial_block() {
        let crypt = SiaCrypt::new(Some("0123456789ABCDEF")).unwrap();
        assert!(matches!(
            crypt.decrypt(&[0u8; 15]),
            Err(BridgeError::Decrypt { .. })
        ));
        assert!(matches!(crypt.decrypt(&[]), Err(BridgeError::Decrypt { .. })));
    }

    #[test]
    fn test_decrypt_without_key_refused() {
        let crypt = SiaCrypt::new(None).unwrap();
        assert!(matches!(
            crypt.decrypt(&[0u8; 16]),
            Err(BridgeError::Decrypt { .. })
        ));
    }
}
