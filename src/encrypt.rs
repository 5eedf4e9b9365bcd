//! 附件加密流程实现
//!
//! 加密流程（严格顺序）：
//! 1. 对原始明文计算哈希并计数
//! 2. 用零字节填充到对应的长度档位
//! 3. AES-256-CBC 加密
//! 4. 前置 IV，追加 MAC
//! 5. 对成帧后的输出计算哈希并计数（digest、密文长度）
//!
//! 注意：
//! - 字节一经产出即写入 sink；失败时 sink 中留有部分数据，由调用方清理
//!   （写盘场景由 `AttachmentStore` 负责）
//! - 固定 IV 或跳过填充需要 [`DangerousIv`] 令牌

use std::io::Write;

use tracing::{debug, error, info, warn};

use crate::crypto::keys::KeyMaterial;
use crate::crypto::{constant_time_eq, generate_iv};
use crate::error::{AttachmentError, Result};
use crate::format::padding::{total_framed_len, unpadded_framed_len};
use crate::format::{DIGEST_LEN, Digest, Iv, PLAINTEXT_HASH_HEX_LEN};
use crate::stream::cipher::EncryptStage;
use crate::stream::frame::{AppendMac, PrependIv};
use crate::stream::hash::{HashStage, MeasureSize};
use crate::stream::length::AppendPadding;
use crate::stream::{Chain, SINK_LABEL, Source, StreamConfig};

/// 加密成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedAttachment {
    /// 成帧输出的 SHA-256
    pub digest: Digest,
    pub iv: Iv,
    /// 原始明文的十六进制 SHA-256
    pub plaintext_hash: String,
    pub plaintext_size: u64,
    /// 实际写入 sink 的字节数
    pub ciphertext_size: u64,
}

/// 覆盖随机 IV 或档位填充的权限令牌
///
/// 没有公开构造函数：测试代码通过 `testing::TestOverrides` 获取，
/// 备份重加密在 `backup::reencrypt_for_backup` 内部自行构造。
pub struct DangerousIv(pub(crate) IvOverride);

pub(crate) enum IvOverride {
    #[cfg(any(test, feature = "testing"))]
    Test { iv: Option<Iv>, skip_padding: bool },
    Backup { iv: Iv, digest_to_match: Digest },
}

/// 单次运行中档位填充的配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Padding {
    Bucket,
    None,
}

/// 加密链中各 stage 上报的值
#[derive(Default)]
pub(crate) struct EncryptSlots {
    plaintext_hash: Option<Digest>,
    plaintext_size: Option<u64>,
    digest: Option<Digest>,
    ciphertext_size: Option<u64>,
}

impl EncryptSlots {
    /// 构建写入 `self` 的 stage 列表
    pub(crate) fn chain<'s>(
        &'s mut self,
        keys: KeyMaterial<'_>,
        iv: &Iv,
        padding: Padding,
    ) -> Result<Chain<'s>> {
        let EncryptSlots {
            plaintext_hash,
            plaintext_size,
            digest,
            ciphertext_size,
        } = self;

        let pad = match padding {
            Padding::Bucket => Some(AppendPadding::new()),
            Padding::None => None,
        };

        Ok(Chain::new()
            .then(HashStage::new(plaintext_hash))
            .then(MeasureSize::new(plaintext_size))
            .then_maybe(pad)
            .then(EncryptStage::new(keys.aes_key(), iv))
            .then(PrependIv::new(*iv))
            .then(AppendMac::new(keys.mac_key())?)
            .then(HashStage::new(digest))
            .then(MeasureSize::new(ciphertext_size)))
    }

    /// 读回 slot 并检查加密后置条件
    pub(crate) fn into_result(self, iv: Iv, padding: Padding) -> Result<EncryptedAttachment> {
        let plaintext_hash = self
            .plaintext_hash
            .map(hex::encode)
            .ok_or(AttachmentError::Internal("plaintext hash was not computed"))?;
        if plaintext_hash.len() != PLAINTEXT_HASH_HEX_LEN {
            return Err(AttachmentError::Internal("plaintext hash has the wrong length"));
        }

        let digest = self
            .digest
            .ok_or(AttachmentError::Internal("digest was not computed"))?;
        if digest.len() != DIGEST_LEN {
            return Err(AttachmentError::Internal("digest has the wrong length"));
        }

        let plaintext_size = self
            .plaintext_size
            .ok_or(AttachmentError::Internal("plaintext size was not measured"))?;
        let ciphertext_size = self
            .ciphertext_size
            .ok_or(AttachmentError::Internal("ciphertext size was not measured"))?;

        let expected = match padding {
            Padding::Bucket => total_framed_len(plaintext_size),
            Padding::None => unpadded_framed_len(plaintext_size),
        };
        if expected != Some(ciphertext_size) {
            return Err(AttachmentError::Internal(
                "ciphertext size does not match the framed length",
            ));
        }

        Ok(EncryptedAttachment {
            digest,
            iv,
            plaintext_hash,
            plaintext_size,
            ciphertext_size,
        })
    }
}

/// 每次 `encrypt` 调用加密一个附件
pub struct AttachmentEncryptor<'a> {
    keys: KeyMaterial<'a>,
    dangerous: Option<DangerousIv>,
    padding: Padding,
    config: StreamConfig,
    log_id: String,
}

impl<'a> AttachmentEncryptor<'a> {
    pub fn new(keys: KeyMaterial<'a>) -> Self {
        Self {
            keys,
            dangerous: None,
            padding: Padding::Bucket,
            config: StreamConfig::default(),
            log_id: "attachment".to_string(),
        }
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// 该附件在日志事件中的标识
    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }

    pub fn with_dangerous_iv(mut self, token: DangerousIv) -> Self {
        self.dangerous = Some(token);
        self
    }

    /// 外层信封成帧时不做档位填充
    pub(crate) fn without_bucket_padding(mut self) -> Self {
        self.padding = Padding::None;
        self
    }

    /// 将 `source` 流式加密写入 `sink`
    pub fn encrypt<W: Write>(&self, source: Source<'_>, sink: W) -> Result<EncryptedAttachment> {
        self.encrypt_labelled(source, sink, SINK_LABEL)
    }

    /// 同 [`encrypt`](Self::encrypt)，`sink_label` 用于在 I/O 错误中标明输出文件
    pub(crate) fn encrypt_labelled<W: Write>(
        &self,
        source: Source<'_>,
        sink: W,
        sink_label: &str,
    ) -> Result<EncryptedAttachment> {
        let (iv, padding) = self.plan();
        debug!(
            id = %self.log_id,
            source = %source.describe(),
            padding = ?padding,
            fixed_iv = self.dangerous.is_some(),
            chunk_size = self.config.chunk_size,
            "encrypting attachment"
        );

        let result = self.run(source, sink, sink_label, iv, padding);
        match &result {
            Ok(encrypted) => info!(
                id = %self.log_id,
                plaintext_size = encrypted.plaintext_size,
                ciphertext_size = encrypted.ciphertext_size,
                "attachment encrypted"
            ),
            Err(err) => error!(id = %self.log_id, error = %err, "attachment encryption failed"),
        }
        result
    }

    fn plan(&self) -> (Iv, Padding) {
        match &self.dangerous {
            None => (generate_iv(), self.padding),
            #[cfg(any(test, feature = "testing"))]
            Some(DangerousIv(IvOverride::Test { iv, skip_padding })) => {
                let padding = if *skip_padding {
                    Padding::None
                } else {
                    self.padding
                };
                (iv.unwrap_or_else(generate_iv), padding)
            }
            Some(DangerousIv(IvOverride::Backup { iv, .. })) => (*iv, Padding::Bucket),
        }
    }

    fn run<W: Write>(
        &self,
        source: Source<'_>,
        sink: W,
        sink_label: &str,
        iv: Iv,
        padding: Padding,
    ) -> Result<EncryptedAttachment> {
        // ---------- 打开输入 ----------
        let source_label = source.describe();
        let reader = source.open()?;

        // ---------- 流式处理 ----------
        let mut slots = EncryptSlots::default();
        {
            let mut chain = slots
                .chain(self.keys, &iv, padding)?
                .with_endpoints(source_label, sink_label);
            chain.run(reader, sink, &self.config)?;
        }

        // ---------- 后置条件 ----------
        let encrypted = slots.into_result(iv, padding)?;

        if let Some(DangerousIv(IvOverride::Backup {
            digest_to_match, ..
        })) = &self.dangerous
        {
            if !constant_time_eq(&encrypted.digest, digest_to_match) {
                warn!(
                    id = %self.log_id,
                    "reencrypted attachment did not reproduce the expected digest"
                );
                return Err(AttachmentError::ReencryptedDigestMismatch);
            }
        }

        Ok(encrypted)
    }
}
