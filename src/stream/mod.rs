//! 附件流水线：按 chunk 处理的 stage 链
//!
//! 附件流水线中的每一步变换都是一个 [`Stage`]：
//! 接受任意大小的 chunk，把当前已能产出的字节追加到输出缓冲，
//! 输入结束时再冲刷自身缓存的状态。
//! [`Chain`] 按顺序串联多个 stage，从 reader 读入，最终结果写入 writer。
//!
//! 约束：
//! - 字节严格按顺序经过每个 stage，不跳过任何字节
//! - 内存占用受 chunk 大小加各 stage 缓冲限制
//! - 中止信号只在 chunk 之间检查
//!
//! 需要产出结果的 stage（哈希、IV、长度）写入调用方借出的 slot，
//! slot 的生命周期覆盖整条链。

pub mod cipher;
pub mod frame;
pub mod hash;
pub mod length;

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{AttachmentError, IoContext, Result};

/// 默认读取大小：64 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// 调用方未标注端点时，I/O 错误中使用的名称
pub(crate) const SOURCE_LABEL: &str = "attachment source";
pub(crate) const SINK_LABEL: &str = "attachment sink";

/// 单次 `finish` 调用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// 已无剩余输出
    Done,
    /// 已输出有限的一段，需要再次调用 finish
    Pending,
}

pub trait Stage {
    /// 处理一个 chunk，产出的字节追加到 `out`
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// 上游耗尽后调用，反复调用直到返回 [`Flush::Done`]
    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Flush>;
}

/// 调用方与运行中的流水线共享的取消标志
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 所有流水线共用的驱动参数
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub chunk_size: usize,
    pub abort: Option<AbortSignal>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            abort: None,
        }
    }
}

impl StreamConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_abort_signal(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(AttachmentError::InvalidConfig(
                "chunk size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn check_abort(&self) -> Result<()> {
        match &self.abort {
            Some(signal) if signal.is_aborted() => Err(AttachmentError::Aborted),
            _ => Ok(()),
        }
    }
}

/// 流水线的输入来源
pub enum Source<'a> {
    /// 内存中的字节
    Bytes(&'a [u8]),
    /// 由流水线打开的文件，任何退出路径上都会关闭
    Path(&'a Path),
    /// 调用方持有的 reader
    Reader(&'a mut dyn Read),
}

impl<'a> Source<'a> {
    pub(crate) fn open(self) -> Result<Box<dyn Read + 'a>> {
        match self {
            Source::Bytes(bytes) => Ok(Box::new(bytes)),
            Source::Path(path) => {
                let file = File::open(path).io_context(|| format!("opening {}", path.display()))?;
                Ok(Box::new(BufReader::new(file)))
            }
            Source::Reader(reader) => Ok(Box::new(reader)),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Source::Bytes(bytes) => format!("{} in-memory bytes", bytes.len()),
            Source::Path(path) => path.display().to_string(),
            Source::Reader(_) => "caller stream".to_string(),
        }
    }
}

/// 有序的 stage 列表
#[derive(Default)]
pub struct Chain<'a> {
    stages: Vec<Box<dyn Stage + 'a>>,
    source_label: Option<String>,
    sink_label: Option<String>,
}

impl<'a> Chain<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then<S: Stage + 'a>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn then_maybe<S: Stage + 'a>(self, stage: Option<S>) -> Self {
        match stage {
            Some(stage) => self.then(stage),
            None => self,
        }
    }

    /// 为 [`Chain::run`] 的 reader 与 writer 命名，用于 I/O 错误上下文
    pub fn with_endpoints(mut self, source: impl Into<String>, sink: impl Into<String>) -> Self {
        self.source_label = Some(source.into());
        self.sink_label = Some(sink.into());
        self
    }

    /// 把 `other` 的全部 stage 接在 `self` 之后
    pub fn append(mut self, other: Chain<'a>) -> Self {
        self.stages.extend(other.stages);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 让一个 chunk 依次经过所有 stage，返回最终输出
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.feed_from(0, chunk.to_vec())
    }

    fn feed_from(&mut self, start: usize, mut current: Vec<u8>) -> Result<Vec<u8>> {
        for stage in self.stages.iter_mut().skip(start) {
            if current.is_empty() {
                break;
            }
            let mut out = Vec::new();
            stage.process(&current, &mut out)?;
            current = out;
        }
        Ok(current)
    }

    /// 从前往后依次 finish 各 stage。
    ///
    /// 某个 stage 冲刷出的字节先流经后续 stage，之后才 finish 后续 stage；
    /// 最终输出分段交给 `emit`。
    pub fn finish_with<F>(&mut self, mut emit: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        for index in 0..self.stages.len() {
            loop {
                let mut out = Vec::new();
                let state = self.stages[index].finish(&mut out)?;

                let forwarded = self.feed_from(index + 1, out)?;
                if !forwarded.is_empty() {
                    emit(&forwarded)?;
                }

                if state == Flush::Done {
                    break;
                }
            }
        }
        Ok(())
    }

    /// 内存场景的便捷方法：finish 并收集全部输出
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        let mut collected = Vec::new();
        self.finish_with(|bytes| {
            collected.extend_from_slice(bytes);
            Ok(())
        })?;
        Ok(collected)
    }

    /// 按 `config.chunk_size` 读完 `reader`，每段经过整条链后写入 `writer`
    pub fn run<R, W>(&mut self, mut reader: R, mut writer: W, config: &StreamConfig) -> Result<()>
    where
        R: Read,
        W: Write,
    {
        config.validate()?;
        let source_label = self.source_label.as_deref().unwrap_or(SOURCE_LABEL).to_owned();
        let sink_label = self.sink_label.as_deref().unwrap_or(SINK_LABEL).to_owned();
        let mut buffer = vec![0u8; config.chunk_size];

        loop {
            config.check_abort()?;

            let read_len = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(AttachmentError::Io {
                        context: format!("reading {source_label}"),
                        source: e,
                    });
                }
            };

            let out = self.push(&buffer[..read_len])?;
            if !out.is_empty() {
                writer
                    .write_all(&out)
                    .io_context(|| format!("writing {sink_label}"))?;
            }
        }

        config.check_abort()?;

        self.finish_with(|bytes| {
            writer
                .write_all(bytes)
                .io_context(|| format!("writing {sink_label}"))
        })?;

        writer.flush().io_context(|| format!("flushing {sink_label}"))
    }
}
