//! 附件流水线使用的密码学原语
//!
//! - `keys`：64 字节密钥及其 AES / MAC 两半
//! - `cbc`：与 chunk 大小无关的增量式 AES-256-CBC
//!
//! 这里全部是同步代码；流式组合位于 `crate::stream`。

pub mod cbc;
pub mod keys;

use hmac::Hmac;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{AttachmentError, Result};
use crate::format::{IV_LEN, Iv};

use self::keys::MAC_KEY_LEN;

pub type HmacSha256 = Hmac<Sha256>;

/// 以附件 MAC 密钥初始化的 HMAC-SHA256
pub fn new_hmac(mac_key: &[u8; MAC_KEY_LEN]) -> Result<HmacSha256> {
    <HmacSha256 as hmac::Mac>::new_from_slice(mac_key)
        .map_err(|_| AttachmentError::Internal("HMAC rejected a 32-byte key"))
}

/// 来自系统 CSPRNG 的新随机 IV
pub fn generate_iv() -> Iv {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// 常数时间比较，长度不同视为不相等
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    left.ct_eq(right).into()
}
