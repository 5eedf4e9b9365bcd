//! AES-256-CBC 相关 stage

use super::frame::IvCollector;
use super::{Flush, Stage};
use crate::crypto::cbc::{CbcDecryptor, CbcEncryptor};
use crate::crypto::keys::AES_KEY_LEN;
use crate::error::{AttachmentError, Result};
use crate::format::Iv;

/// 输入明文，输出裸 CBC 密文（不含 IV 与 MAC）
pub struct EncryptStage {
    cipher: CbcEncryptor,
}

impl EncryptStage {
    pub fn new(aes_key: &[u8; AES_KEY_LEN], iv: &Iv) -> Self {
        Self {
            cipher: CbcEncryptor::new(aes_key, iv),
        }
    }
}

impl Stage for EncryptStage {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.cipher.update(chunk, out)
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Flush> {
        self.cipher.finalize(out)?;
        Ok(Flush::Done)
    }
}

/// 输入 `IV || 密文`，输出明文
///
/// 前 `IV_LEN` 字节用于初始化解密器，之后的字节到达即解密。
/// 给出 `iv_slot` 时通过它上报 IV。
pub struct DecryptStage<'a> {
    iv: IvCollector,
    cipher: CbcDecryptor,
    iv_slot: Option<&'a mut Option<Iv>>,
}

impl<'a> DecryptStage<'a> {
    pub fn new(aes_key: &[u8; AES_KEY_LEN]) -> Self {
        Self {
            iv: IvCollector::new(),
            cipher: CbcDecryptor::new(aes_key),
            iv_slot: None,
        }
    }

    pub fn reporting_iv(mut self, slot: &'a mut Option<Iv>) -> Self {
        self.iv_slot = Some(slot);
        self
    }
}

impl Stage for DecryptStage<'_> {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let (iv, rest) = self.iv.feed(chunk);
        if let Some(iv) = iv {
            self.cipher.init_with_iv(&iv)?;
            if let Some(slot) = self.iv_slot.as_deref_mut() {
                *slot = Some(iv);
            }
        }

        if rest.is_empty() {
            return Ok(());
        }
        if !self.cipher.is_initialized() {
            return Err(AttachmentError::Internal("ciphertext arrived before the IV"));
        }
        self.cipher.update(rest, out)
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Flush> {
        self.iv.ensure_complete()?;
        self.cipher.finalize(out)?;
        Ok(Flush::Done)
    }
}
