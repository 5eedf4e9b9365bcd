//! 只观察、不修改字节的透传 stage

use std::io::{self, Read};

use sha2::{Digest as _, Sha256};

use super::{Chain, Flush, SINK_LABEL, Source, Stage, StreamConfig};
use crate::error::{AttachmentError, Result};
use crate::format::Digest;

/// 对流水线此处的每个字节计算 SHA-256
///
/// 字节原样转发；stage finish 时哈希写入 `slot`。
pub struct HashStage<'a> {
    hasher: Option<Sha256>,
    slot: &'a mut Option<Digest>,
}

impl<'a> HashStage<'a> {
    pub fn new(slot: &'a mut Option<Digest>) -> Self {
        Self {
            hasher: Some(Sha256::new()),
            slot,
        }
    }
}

impl Stage for HashStage<'_> {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        out.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Flush> {
        if let Some(hasher) = self.hasher.take() {
            *self.slot = Some(hasher.finalize().into());
        }
        Ok(Flush::Done)
    }
}

/// 统计流经的字节数
pub struct MeasureSize<'a> {
    total: u64,
    slot: &'a mut Option<u64>,
}

impl<'a> MeasureSize<'a> {
    pub fn new(slot: &'a mut Option<u64>) -> Self {
        Self { total: 0, slot }
    }
}

impl Stage for MeasureSize<'_> {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.total += chunk.len() as u64;
        out.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Flush> {
        *self.slot = Some(self.total);
        Ok(Flush::Done)
    }
}

/// 内存中附件的十六进制 SHA-256，与流水线上报的 `plaintext_hash` 一致
pub fn plaintext_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// [`plaintext_hash`] 的流式版本，用于磁盘上的附件
pub fn plaintext_hash_of_reader<R: Read>(reader: R, config: &StreamConfig) -> Result<String> {
    hash_stream(reader, config, None)
}

/// 同 [`plaintext_hash_of_reader`]，但由本函数打开 `source`，
/// 文件缺失时错误中带有路径
pub fn plaintext_hash_of(source: Source<'_>, config: &StreamConfig) -> Result<String> {
    let label = source.describe();
    let reader = source.open()?;
    hash_stream(reader, config, Some(label))
}

fn hash_stream<R: Read>(reader: R, config: &StreamConfig, label: Option<String>) -> Result<String> {
    let mut digest = None;
    {
        let mut chain = Chain::new().then(HashStage::new(&mut digest));
        if let Some(label) = label {
            chain = chain.with_endpoints(label, SINK_LABEL);
        }
        chain.run(reader, io::sink(), config)?;
    }
    digest
        .map(hex::encode)
        .ok_or(AttachmentError::Internal("plaintext hash was not computed"))
}
