//! 附件密钥处理
//!
//! 密钥为 64 字节原始数据：前 32 字节是 AES-256 密钥，后 32 字节是 HMAC-SHA256 密钥。
//! 各 stage 只通过 `KeyMaterial` 借用这两半，密钥本身留在调用方。

use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroizing;

use crate::error::{AttachmentError, Result};

pub const AES_KEY_LEN: usize = 32;
pub const MAC_KEY_LEN: usize = 32;
pub const KEY_SET_LEN: usize = AES_KEY_LEN + MAC_KEY_LEN;

/// 密钥的借用视图，拆分为 AES 与 MAC 两半
#[derive(Clone, Copy)]
pub struct KeyMaterial<'a> {
    aes_key: &'a [u8; AES_KEY_LEN],
    mac_key: &'a [u8; MAC_KEY_LEN],
}

impl<'a> KeyMaterial<'a> {
    /// 拆分 64 字节密钥，两半都是 `keys` 的视图而非拷贝
    pub fn split(keys: &'a [u8]) -> Result<Self> {
        if keys.len() != KEY_SET_LEN {
            return Err(AttachmentError::InvalidKeyLength {
                expected: KEY_SET_LEN,
                actual: keys.len(),
            });
        }

        let (aes_key, mac_key) = keys.split_at(AES_KEY_LEN);
        Self::from_parts(aes_key, mac_key)
    }

    /// 由分开存放的两半构建视图
    pub fn from_parts(aes_key: &'a [u8], mac_key: &'a [u8]) -> Result<Self> {
        let aes_key = <&[u8; AES_KEY_LEN]>::try_from(aes_key).map_err(|_| {
            AttachmentError::InvalidKeyLength {
                expected: AES_KEY_LEN,
                actual: aes_key.len(),
            }
        })?;
        let mac_key = <&[u8; MAC_KEY_LEN]>::try_from(mac_key).map_err(|_| {
            AttachmentError::InvalidKeyLength {
                expected: MAC_KEY_LEN,
                actual: mac_key.len(),
            }
        })?;

        Ok(Self { aes_key, mac_key })
    }

    pub fn aes_key(&self) -> &'a [u8; AES_KEY_LEN] {
        self.aes_key
    }

    pub fn mac_key(&self) -> &'a [u8; MAC_KEY_LEN] {
        self.mac_key
    }
}

impl std::fmt::Debug for KeyMaterial<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// 持有所有权的密钥，drop 时清零
///
/// 按两半存放，构建 `KeyMaterial` 视图时无需可能失败的转换。
#[derive(Clone)]
pub struct AttachmentKeys(Zeroizing<[[u8; AES_KEY_LEN]; 2]>);

impl AttachmentKeys {
    /// 来自系统 CSPRNG 的 64 个新随机字节
    pub fn generate() -> Self {
        let mut keys = Zeroizing::new([[0u8; AES_KEY_LEN]; 2]);
        OsRng.fill_bytes(keys.as_flattened_mut());
        Self(keys)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SET_LEN {
            return Err(AttachmentError::InvalidKeyLength {
                expected: KEY_SET_LEN,
                actual: bytes.len(),
            });
        }

        let mut keys = Zeroizing::new([[0u8; AES_KEY_LEN]; 2]);
        keys.as_flattened_mut().copy_from_slice(bytes);
        Ok(Self(keys))
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| AttachmentError::InvalidConfig(format!("keys are not hex: {e}")))?,
        );
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// 原始 64 字节密钥
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_flattened()
    }

    pub fn material(&self) -> KeyMaterial<'_> {
        KeyMaterial {
            aes_key: &self.0[0],
            mac_key: &self.0[1],
        }
    }
}

impl std::fmt::Debug for AttachmentKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AttachmentKeys(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_returns_views_into_the_blob() {
        let blob: Vec<u8> = (0..64).collect();
        let keys = KeyMaterial::split(&blob).unwrap();

        assert_eq!(keys.aes_key()[..], blob[..32]);
        assert_eq!(keys.mac_key()[..], blob[32..]);
        assert!(std::ptr::eq(keys.aes_key().as_ptr(), blob.as_ptr()));
        assert!(std::ptr::eq(keys.mac_key().as_ptr(), blob[32..].as_ptr()));
    }

    #[test]
    fn split_rejects_wrong_length() {
        for len in [0, 32, 63, 65] {
            let blob = vec![0u8; len];
            match KeyMaterial::split(&blob) {
                Err(AttachmentError::InvalidKeyLength { expected, actual }) => {
                    assert_eq!(expected, 64);
                    assert_eq!(actual, len);
                }
                other => panic!("expected InvalidKeyLength, got {other:?}"),
            }
        }
    }

    #[test]
    fn from_parts_checks_each_half() {
        let aes = [1u8; 32];
        let short_mac = [2u8; 31];
        assert!(matches!(
            KeyMaterial::from_parts(&aes, &short_mac),
            Err(AttachmentError::InvalidKeyLength { expected: 32, actual: 31 })
        ));
    }

    #[test]
    fn hex_roundtrip() {
        let keys = AttachmentKeys::generate();
        let back = AttachmentKeys::from_hex(&keys.to_hex()).unwrap();
        assert_eq!(keys.as_bytes(), back.as_bytes());
        assert_eq!(keys.material().mac_key()[..], keys.as_bytes()[32..]);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(
            AttachmentKeys::from_hex("zz"),
            Err(AttachmentError::InvalidConfig(_))
        ));
        assert!(matches!(
            AttachmentKeys::from_hex("abcd"),
            Err(AttachmentError::InvalidKeyLength { actual: 2, .. })
        ));
    }
}
