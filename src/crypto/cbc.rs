//! 增量式 AES-256-CBC（PKCS#7 填充）
//!
//! 输入可按任意大小分段到达，不足一块的部分缓存到下一次调用；
//! `finalize` 对最后一块加上（加密）或校验并去除（解密）PKCS#7 填充。
//!
//! 解密器始终扣留最近一块明文：输入结束前无法知道哪一块带有填充。

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256Dec, Aes256Enc, Block};

use crate::crypto::keys::AES_KEY_LEN;
use crate::error::{AttachmentError, Result};
use crate::format::{BLOCK_SIZE, Iv};

type BlockBytes = [u8; BLOCK_SIZE];

/// 跨调用把字节凑成整块
#[derive(Default)]
struct BlockBuffer {
    partial: Vec<u8>,
}

impl BlockBuffer {
    /// 对缓存字节加 `input` 组成的每个完整块调用 `op`，余下部分留到下次
    fn update<F>(&mut self, mut input: &[u8], mut op: F)
    where
        F: FnMut(&BlockBytes),
    {
        if !self.partial.is_empty() {
            let take = (BLOCK_SIZE - self.partial.len()).min(input.len());
            self.partial.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.partial.len() < BLOCK_SIZE {
                return;
            }

            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(&self.partial);
            self.partial.clear();
            op(&block);
        }

        let mut blocks = input.chunks_exact(BLOCK_SIZE);
        for chunk in &mut blocks {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            op(&block);
        }

        self.partial.extend_from_slice(blocks.remainder());
    }

    fn pending(&self) -> &[u8] {
        &self.partial
    }
}

fn xor_into(block: &mut BlockBytes, other: &BlockBytes) {
    for (byte, mask) in block.iter_mut().zip(other) {
        *byte ^= mask;
    }
}

/// 流式 CBC 加密器
pub struct CbcEncryptor {
    cipher: Aes256Enc,
    previous: BlockBytes,
    buffer: BlockBuffer,
    finalized: bool,
}

impl CbcEncryptor {
    pub fn new(aes_key: &[u8; AES_KEY_LEN], iv: &Iv) -> Self {
        Self {
            cipher: Aes256Enc::new(aes_key.into()),
            previous: *iv,
            buffer: BlockBuffer::default(),
            finalized: false,
        }
    }

    /// 加密所有已凑齐的块，密文追加到 `out`
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.finalized {
            return Err(AttachmentError::Internal("cipher used after finalize"));
        }

        let Self {
            cipher,
            previous,
            buffer,
            ..
        } = self;

        buffer.update(input, |block| {
            encrypt_block(cipher, previous, block, out);
        });

        Ok(())
    }

    /// 填充末尾不完整的块并输出最后一块密文
    pub fn finalize(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.finalized {
            return Err(AttachmentError::Internal("cipher finalized twice"));
        }
        self.finalized = true;

        let pending = self.buffer.pending();
        let pad = (BLOCK_SIZE - pending.len()) as u8;
        let mut block = [pad; BLOCK_SIZE];
        block[..pending.len()].copy_from_slice(pending);

        encrypt_block(&self.cipher, &mut self.previous, &block, out);
        Ok(())
    }
}

fn encrypt_block(cipher: &Aes256Enc, previous: &mut BlockBytes, plain: &BlockBytes, out: &mut Vec<u8>) {
    let mut mixed = *plain;
    xor_into(&mut mixed, previous);

    let mut block = Block::from(mixed);
    cipher.encrypt_block(&mut block);

    previous.copy_from_slice(&block);
    out.extend_from_slice(&block);
}

/// 流式 CBC 解密器
///
/// 第一次 `update` 之前必须且只能调用一次 `init_with_iv`。
pub struct CbcDecryptor {
    cipher: Aes256Dec,
    previous: Option<BlockBytes>,
    buffer: BlockBuffer,
    held: Option<BlockBytes>,
    finalized: bool,
}

impl CbcDecryptor {
    pub fn new(aes_key: &[u8; AES_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Dec::new(aes_key.into()),
            previous: None,
            buffer: BlockBuffer::default(),
            held: None,
            finalized: false,
        }
    }

    pub fn init_with_iv(&mut self, iv: &Iv) -> Result<()> {
        if self.previous.is_some() {
            return Err(AttachmentError::Internal("decipher initialized twice"));
        }
        self.previous = Some(*iv);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.previous.is_some()
    }

    /// 解密完整的块，明文比输入落后一块
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.finalized {
            return Err(AttachmentError::Internal("decipher used after finalize"));
        }

        let Self {
            cipher,
            previous,
            buffer,
            held,
            ..
        } = self;
        let previous = previous
            .as_mut()
            .ok_or(AttachmentError::Internal("decipher used before its IV arrived"))?;

        buffer.update(input, |block| {
            let mut decrypted = Block::from(*block);
            cipher.decrypt_block(&mut decrypted);

            let mut plain = [0u8; BLOCK_SIZE];
            plain.copy_from_slice(&decrypted);
            xor_into(&mut plain, previous);
            *previous = *block;

            if let Some(ready) = held.replace(plain) {
                out.extend_from_slice(&ready);
            }
        });

        Ok(())
    }

    /// 校验扣留块的 PKCS#7 填充，输出剩余明文
    pub fn finalize(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.finalized {
            return Err(AttachmentError::Internal("decipher finalized twice"));
        }
        self.finalized = true;

        if self.previous.is_none() {
            return Err(AttachmentError::Internal("decipher finalized before its IV arrived"));
        }
        if !self.buffer.pending().is_empty() {
            return Err(AttachmentError::InvalidCiphertext(
                "ciphertext is not a multiple of the block size",
            ));
        }

        let last = self
            .held
            .take()
            .ok_or(AttachmentError::InvalidCiphertext("ciphertext has no blocks"))?;

        let pad = last[BLOCK_SIZE - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE {
            return Err(AttachmentError::InvalidCiphertext("bad PKCS#7 padding"));
        }
        if last[BLOCK_SIZE - pad..].iter().any(|&byte| byte as usize != pad) {
            return Err(AttachmentError::InvalidCiphertext("bad PKCS#7 padding"));
        }

        out.extend_from_slice(&last[..BLOCK_SIZE - pad]);
        Ok(())
    }
}
