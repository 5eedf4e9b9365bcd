//! 附件解密流程实现
//!
//! 解密流程（严格顺序）：
//! 1. 若有外层信封：剥离并校验外层 MAC，读取外层 IV，解密
//! 2. 对内层帧计算哈希（digest）
//! 3. 剥离并校验内层 MAC
//! 4. 读取内层 IV，解密
//! 5. 截断到声明的明文长度
//! 6. 对明文计算哈希并计数
//!
//! 解密状态与 stage 一一对应：`VerifyMac` 消费 MAC，
//! `DecryptStage` 先消费 IV 再流式解密，`finish` 即收尾阶段。
//! 只有所有 MAC 校验与下面的完整性检查都通过，本次解密才算验证成功。
//!
//! 注意：
//! - MAC 在各 stage finish 时从前往后校验：先外层 MAC，再内层，最后 CBC 填充
//! - 明文在校验完成前就已写入 sink；失败时 sink 中留有部分数据，由调用方丢弃

use std::io::Write;

use tracing::{debug, error, info};

use crate::crypto::constant_time_eq;
use crate::crypto::keys::KeyMaterial;
use crate::error::{AttachmentError, Result};
use crate::format::{Digest, Iv};
use crate::stream::cipher::DecryptStage;
use crate::stream::frame::{MacLayer, VerifyMac};
use crate::stream::hash::{HashStage, MeasureSize};
use crate::stream::length::Truncate;
use crate::stream::{Chain, SINK_LABEL, Source, StreamConfig};

/// 除 MAC 之外，解密结果还要对照的完整性依据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// 发送方公布的 digest
    Digest(Digest),
    /// 期望明文的十六进制 SHA-256
    PlaintextHash(String),
    /// 本进程自己生成的附件，只校验 MAC
    LocallyGenerated,
}

/// 密文是否带有外层信封
#[derive(Debug, Clone, Copy)]
pub enum Layering<'a> {
    SingleLayer,
    DualLayer { outer: KeyMaterial<'a> },
}

impl Layering<'_> {
    fn describe(&self) -> &'static str {
        match self {
            Layering::SingleLayer => "single",
            Layering::DualLayer { .. } => "dual",
        }
    }
}

/// 校验通过的解密结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedAttachment {
    pub iv: Iv,
    pub plaintext_hash: String,
    /// 内层帧的 SHA-256
    pub digest: Digest,
    /// 写入 sink 的字节数
    pub plaintext_size: u64,
}

/// 解密链中各 stage 上报的值
#[derive(Default)]
pub(crate) struct DecryptSlots {
    digest: Option<Digest>,
    iv: Option<Iv>,
    plaintext_hash: Option<Digest>,
    plaintext_size: Option<u64>,
}

impl DecryptSlots {
    pub(crate) fn chain<'s>(
        &'s mut self,
        keys: KeyMaterial<'_>,
        layering: Layering<'_>,
        size: u64,
    ) -> Result<Chain<'s>> {
        let DecryptSlots {
            digest,
            iv,
            plaintext_hash,
            plaintext_size,
        } = self;

        let outer = match layering {
            Layering::SingleLayer => Chain::new(),
            Layering::DualLayer { outer } => Chain::new()
                .then(VerifyMac::new(outer.mac_key(), MacLayer::Outer)?)
                .then(DecryptStage::new(outer.aes_key())),
        };

        let inner = Chain::new()
            .then(HashStage::new(digest))
            .then(VerifyMac::new(keys.mac_key(), MacLayer::Inner)?)
            .then(DecryptStage::new(keys.aes_key()).reporting_iv(iv))
            .then(Truncate::new(size))
            .then(HashStage::new(plaintext_hash))
            .then(MeasureSize::new(plaintext_size));

        Ok(outer.append(inner))
    }

    /// 读回 slot 并执行完整性检查
    pub(crate) fn verify(self, integrity: &IntegrityCheck) -> Result<DecryptedAttachment> {
        let digest = self
            .digest
            .ok_or(AttachmentError::Internal("digest was not computed"))?;
        let iv = self
            .iv
            .ok_or(AttachmentError::Internal("IV was not reported"))?;
        let plaintext_hash = self
            .plaintext_hash
            .map(hex::encode)
            .ok_or(AttachmentError::Internal("plaintext hash was not computed"))?;
        let plaintext_size = self
            .plaintext_size
            .ok_or(AttachmentError::Internal("plaintext size was not measured"))?;

        match integrity {
            IntegrityCheck::Digest(their_digest) => {
                if !constant_time_eq(&digest, their_digest) {
                    return Err(AttachmentError::BadDigest);
                }
            }
            IntegrityCheck::PlaintextHash(expected) => {
                let expected = expected.trim().to_ascii_lowercase();
                if !constant_time_eq(plaintext_hash.as_bytes(), expected.as_bytes()) {
                    return Err(AttachmentError::BadPlaintextHash);
                }
            }
            IntegrityCheck::LocallyGenerated => {}
        }

        Ok(DecryptedAttachment {
            iv,
            plaintext_hash,
            digest,
            plaintext_size,
        })
    }
}

/// 解密并校验单个附件
pub struct AttachmentDecryptor<'a> {
    pub(crate) keys: KeyMaterial<'a>,
    pub(crate) size: u64,
    pub(crate) integrity: IntegrityCheck,
    pub(crate) layering: Layering<'a>,
    pub(crate) config: StreamConfig,
    pub(crate) log_id: String,
}

impl<'a> AttachmentDecryptor<'a> {
    /// `size` 为发送方声明的准确明文长度
    pub fn new(keys: KeyMaterial<'a>, size: u64, integrity: IntegrityCheck) -> Self {
        Self {
            keys,
            size,
            integrity,
            layering: Layering::SingleLayer,
            config: StreamConfig::default(),
            log_id: "attachment".to_string(),
        }
    }

    pub fn with_layering(mut self, layering: Layering<'a>) -> Self {
        self.layering = layering;
        self
    }

    /// `with_layering(Layering::DualLayer { outer })` 的简写
    pub fn with_outer_layer(self, outer: KeyMaterial<'a>) -> Self {
        self.with_layering(Layering::DualLayer { outer })
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_log_id(mut self, log_id: impl Into<String>) -> Self {
        self.log_id = log_id.into();
        self
    }

    /// 将 `source` 流式解密写入 `sink`，并校验结果
    pub fn decrypt<W: Write>(&self, source: Source<'_>, sink: W) -> Result<DecryptedAttachment> {
        self.decrypt_labelled(source, sink, SINK_LABEL)
    }

    /// 同 [`decrypt`](Self::decrypt)，`sink_label` 用于在 I/O 错误中标明输出
    pub(crate) fn decrypt_labelled<W: Write>(
        &self,
        source: Source<'_>,
        sink: W,
        sink_label: &str,
    ) -> Result<DecryptedAttachment> {
        debug!(
            id = %self.log_id,
            source = %source.describe(),
            layering = self.layering.describe(),
            size = self.size,
            chunk_size = self.config.chunk_size,
            "decrypting attachment"
        );

        let result = self.run(source, sink, sink_label);
        match &result {
            Ok(decrypted) => info!(
                id = %self.log_id,
                plaintext_size = decrypted.plaintext_size,
                "attachment decrypted"
            ),
            Err(err) => error!(id = %self.log_id, error = %err, "attachment decryption failed"),
        }
        result
    }

    fn run<W: Write>(
        &self,
        source: Source<'_>,
        sink: W,
        sink_label: &str,
    ) -> Result<DecryptedAttachment> {
        // ---------- 打开输入 ----------
        let source_label = source.describe();
        let reader = source.open()?;

        // ---------- 流式处理 ----------
        let mut slots = DecryptSlots::default();
        {
            let mut chain = slots
                .chain(self.keys, self.layering, self.size)?
                .with_endpoints(source_label, sink_label);
            chain.run(reader, sink, &self.config)?;
        }

        // ---------- 校验 ----------
        slots.verify(&self.integrity)
    }
}
