//! 大附件的流式加密
//!
//! 附件先用零字节填充到长度档位，再用 AES-256-CBC 加密，
//! 成帧为 `IV || 密文 || HMAC-SHA256`，并以该帧的 SHA-256 digest 作为标识。
//! 全程对有界 chunk 单遍处理；stage 流水线见 [`stream`]，字节布局见 [`format`]。

pub mod backup;
pub mod crypto;
pub mod decrypt;
pub mod encrypt;
pub mod error;
pub mod format;
pub mod fs;
pub mod stream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backup::{reencrypt_for_backup, wrap_outer_layer};
pub use crypto::generate_iv;
pub use crypto::keys::{AttachmentKeys, KeyMaterial};
pub use decrypt::{AttachmentDecryptor, DecryptedAttachment, IntegrityCheck, Layering};
pub use encrypt::{AttachmentEncryptor, DangerousIv, EncryptedAttachment};
pub use error::{AttachmentError, Result};
pub use format::padding::{ciphertext_len, padded_size, total_framed_len};
pub use fs::AttachmentStore;
pub use stream::hash::{plaintext_hash, plaintext_hash_of, plaintext_hash_of_reader};
pub use stream::{AbortSignal, Source, StreamConfig};

use std::io::BufWriter;
use std::path::Path;

/// 使用新 IV 将 `input` 文件加密到 `output`
pub fn encrypt_file(
    input: &Path,
    output: &Path,
    keys: KeyMaterial<'_>,
    config: &StreamConfig,
) -> Result<EncryptedAttachment> {
    let encryptor = AttachmentEncryptor::new(keys)
        .with_config(config.clone())
        .with_log_id(input.display().to_string());

    let sink_label = output.display().to_string();
    fs::write_atomic(output, |file| {
        encryptor.encrypt_labelled(Source::Path(input), BufWriter::new(file), &sink_label)
    })
}

/// 将 `input` 文件解密到 `output`，全部校验通过后才会创建 `output`
pub fn decrypt_file(
    input: &Path,
    output: &Path,
    decryptor: &AttachmentDecryptor<'_>,
) -> Result<DecryptedAttachment> {
    let sink_label = output.display().to_string();
    fs::write_atomic(output, |file| {
        decryptor.decrypt_labelled(Source::Path(input), BufWriter::new(file), &sink_label)
    })
}
