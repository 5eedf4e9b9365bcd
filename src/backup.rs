//! 备份发布：确定性重加密与外层信封
//!
//! 向备份存储重新发布附件时必须复现发送方当初的密文：
//! 用原 IV 重新加密明文，并与原 digest 比对。
//! 这是生产代码中唯一允许固定 IV 的路径。

use std::io::Write;

use crate::crypto::keys::KeyMaterial;
use crate::encrypt::{AttachmentEncryptor, DangerousIv, EncryptedAttachment, IvOverride};
use crate::error::{AttachmentError, Result};
use crate::format::{Digest, Iv};
use crate::stream::{Source, StreamConfig};

/// 用给定 IV 加密 `source`；输出 digest 与 `digest_to_match` 不一致时返回
/// `ReencryptedDigestMismatch`
///
/// 始终做档位填充。不一致通常意味着原加密用了非零字节填充，
/// 此时调用方一般退回到全新加密。
pub fn reencrypt_for_backup<W: Write>(
    source: Source<'_>,
    keys: KeyMaterial<'_>,
    iv: &[u8],
    digest_to_match: &[u8],
    sink: W,
    config: &StreamConfig,
) -> Result<EncryptedAttachment> {
    let iv = Iv::try_from(iv)
        .map_err(|_| AttachmentError::UnsafeMode("backup IV must be 16 bytes"))?;
    let digest_to_match = Digest::try_from(digest_to_match)
        .map_err(|_| AttachmentError::UnsafeMode("backup digest must be 32 bytes"))?;

    let token = DangerousIv(IvOverride::Backup {
        iv,
        digest_to_match,
    });

    AttachmentEncryptor::new(keys)
        .with_config(config.clone())
        .with_log_id("backup-reencrypt")
        .with_dangerous_iv(token)
        .encrypt(source, sink)
}

/// 用独立密钥和新 IV 对已加密附件再成帧一次
///
/// 不加档位填充，去掉外层后逐字节还原内层帧。
pub fn wrap_outer_layer<W: Write>(
    inner: Source<'_>,
    outer_keys: KeyMaterial<'_>,
    sink: W,
    config: &StreamConfig,
) -> Result<EncryptedAttachment> {
    AttachmentEncryptor::new(outer_keys)
        .with_config(config.clone())
        .with_log_id("outer-envelope")
        .without_bucket_padding()
        .encrypt(inner, sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::AttachmentKeys;
    use crate::decrypt::{AttachmentDecryptor, IntegrityCheck};
    use crate::format::padding::{padded_size, unpadded_framed_len};
    use crate::format::IV_LEN;
    use crate::testing::TestOverrides;

    fn original(keys: &AttachmentKeys, plaintext: &[u8]) -> EncryptedAttachment {
        AttachmentEncryptor::new(keys.material())
            .encrypt(Source::Bytes(plaintext), Vec::new())
            .unwrap()
    }

    #[test]
    fn reencryption_reproduces_the_original_blob() {
        let keys = AttachmentKeys::generate();
        let plaintext = vec![42u8; 3000];

        let mut first = Vec::new();
        let encrypted = AttachmentEncryptor::new(keys.material())
            .encrypt(Source::Bytes(&plaintext), &mut first)
            .unwrap();

        let mut second = Vec::new();
        let again = reencrypt_for_backup(
            Source::Bytes(&plaintext),
            keys.material(),
            &encrypted.iv,
            &encrypted.digest,
            &mut second,
            &StreamConfig::default(),
        )
        .unwrap();

        assert_eq!(again, encrypted);
        assert_eq!(first, second);
    }

    #[test]
    fn nonzero_original_padding_is_a_mismatch() {
        let keys = AttachmentKeys::generate();
        let iv = [8u8; IV_LEN];
        let plaintext = b"hello backup".to_vec();

        // 旧版发送方用 0xff 而不是零填充
        let mut padded = plaintext.clone();
        padded.resize(padded_size(plaintext.len() as u64) as usize, 0xff);
        let sent = AttachmentEncryptor::new(keys.material())
            .with_dangerous_iv(TestOverrides::new().fixed_iv(iv).skip_padding().into_token())
            .encrypt(Source::Bytes(&padded), Vec::new())
            .unwrap();

        let result = reencrypt_for_backup(
            Source::Bytes(&plaintext),
            keys.material(),
            &iv,
            &sent.digest,
            Vec::new(),
            &StreamConfig::default(),
        );
        assert!(matches!(result, Err(AttachmentError::ReencryptedDigestMismatch)));
    }

    #[test]
    fn malformed_iv_or_digest_is_refused() {
        let keys = AttachmentKeys::generate();
        let encrypted = original(&keys, b"x");

        let short_iv = reencrypt_for_backup(
            Source::Bytes(b"x"),
            keys.material(),
            &encrypted.iv[..8],
            &encrypted.digest,
            Vec::new(),
            &StreamConfig::default(),
        );
        assert!(matches!(short_iv, Err(AttachmentError::UnsafeMode(_))));

        let long_digest = [0u8; 33];
        let bad_digest = reencrypt_for_backup(
            Source::Bytes(b"x"),
            keys.material(),
            &encrypted.iv,
            &long_digest,
            Vec::new(),
            &StreamConfig::default(),
        );
        assert!(matches!(bad_digest, Err(AttachmentError::UnsafeMode(_))));
    }

    #[test]
    fn outer_envelope_has_no_bucket_padding() {
        let inner_keys = AttachmentKeys::generate();
        let outer_keys = AttachmentKeys::generate();
        let plaintext = b"wrapped twice";

        let mut inner = Vec::new();
        let encrypted = AttachmentEncryptor::new(inner_keys.material())
            .encrypt(Source::Bytes(plaintext), &mut inner)
            .unwrap();

        let mut outer = Vec::new();
        let wrapped = wrap_outer_layer(
            Source::Bytes(&inner),
            outer_keys.material(),
            &mut outer,
            &StreamConfig::default(),
        )
        .unwrap();
        assert_eq!(
            Some(wrapped.ciphertext_size),
            unpadded_framed_len(inner.len() as u64)
        );

        let mut recovered = Vec::new();
        AttachmentDecryptor::new(
            inner_keys.material(),
            plaintext.len() as u64,
            IntegrityCheck::Digest(encrypted.digest),
        )
        .with_outer_layer(outer_keys.material())
        .decrypt(Source::Bytes(&outer), &mut recovered)
        .unwrap();
        assert_eq!(recovered, plaintext);
    }
}
