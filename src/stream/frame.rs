//! 成帧相关 stage：密文前的 IV 与密文后的 MAC

use hmac::Mac as _;

use super::{Flush, Stage};
use crate::crypto::keys::MAC_KEY_LEN;
use crate::crypto::{HmacSha256, constant_time_eq, new_hmac};
use crate::error::{AttachmentError, Result};
use crate::format::{IV_LEN, Iv, MAC_LEN, Mac};

/// 在第一个密文字节之前输出 IV
pub struct PrependIv {
    iv: Iv,
    emitted: bool,
}

impl PrependIv {
    pub fn new(iv: Iv) -> Self {
        Self { iv, emitted: false }
    }

    fn emit_once(&mut self, out: &mut Vec<u8>) {
        if !self.emitted {
            out.extend_from_slice(&self.iv);
            self.emitted = true;
        }
    }
}

impl Stage for PrependIv {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.emit_once(out);
        out.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Flush> {
        self.emit_once(out);
        Ok(Flush::Done)
    }
}

/// 对流经的全部字节计算 HMAC-SHA256，并追加在末尾
pub struct AppendMac {
    hmac: Option<HmacSha256>,
}

impl AppendMac {
    pub fn new(mac_key: &[u8; MAC_KEY_LEN]) -> Result<Self> {
        Ok(Self {
            hmac: Some(new_hmac(mac_key)?),
        })
    }
}

impl Stage for AppendMac {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let hmac = self
            .hmac
            .as_mut()
            .ok_or(AttachmentError::Internal("MAC stage used after finish"))?;
        hmac.update(chunk);
        out.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Flush> {
        if let Some(hmac) = self.hmac.take() {
            out.extend_from_slice(&hmac.finalize().into_bytes());
        }
        Ok(Flush::Done)
    }
}

/// 覆盖流末尾 `MAC_LEN` 字节的滑动窗口
///
/// 新输入把旧字节挤出窗口后，这些不可能属于末尾 MAC 的字节立即放行。
/// 流结束时窗口中恰好是声称的 MAC。
pub struct MacTail {
    window: [u8; MAC_LEN],
    filled: usize,
}

impl Default for MacTail {
    fn default() -> Self {
        Self::new()
    }
}

impl MacTail {
    pub fn new() -> Self {
        Self {
            window: [0u8; MAC_LEN],
            filled: 0,
        }
    }

    /// 加入 `chunk`，放行的字节追加到 `out`
    pub fn push(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        let combined = self.filled + chunk.len();
        if combined <= MAC_LEN {
            self.window[self.filled..combined].copy_from_slice(chunk);
            self.filled = combined;
            return;
        }

        let excess = combined - MAC_LEN;
        let from_window = excess.min(self.filled);
        let from_chunk = excess - from_window;

        out.extend_from_slice(&self.window[..from_window]);
        out.extend_from_slice(&chunk[..from_chunk]);

        let kept = self.filled - from_window;
        self.window.copy_within(from_window..self.filled, 0);
        self.window[kept..].copy_from_slice(&chunk[from_chunk..]);
        self.filled = MAC_LEN;
    }

    /// 末尾的 MAC；总字节数不足 `MAC_LEN` 时返回 `TruncatedStream`
    pub fn claimed(&self) -> Result<Mac> {
        if self.filled < MAC_LEN {
            return Err(AttachmentError::TruncatedStream {
                expected: MAC_LEN,
                actual: self.filled,
            });
        }
        Ok(self.window)
    }
}

/// MAC 所属的信封层，决定不匹配时返回的错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacLayer {
    Inner,
    Outer,
}

impl MacLayer {
    fn mismatch(self) -> AttachmentError {
        match self {
            MacLayer::Inner => AttachmentError::BadMac,
            MacLayer::Outer => AttachmentError::BadOuterMac,
        }
    }
}

/// 剥离末尾 MAC，并对照其之前的字节进行校验
///
/// 除最后 `MAC_LEN` 字节外，其余字节到达即转发。
/// 比较在 `finish` 中进行，早于后续 stage 的 finish，
/// 被篡改的流不会走到下游的填充检查。
pub struct VerifyMac {
    tail: MacTail,
    hmac: Option<HmacSha256>,
    layer: MacLayer,
}

impl VerifyMac {
    pub fn new(mac_key: &[u8; MAC_KEY_LEN], layer: MacLayer) -> Result<Self> {
        Ok(Self {
            tail: MacTail::new(),
            hmac: Some(new_hmac(mac_key)?),
            layer,
        })
    }
}

impl Stage for VerifyMac {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let hmac = self
            .hmac
            .as_mut()
            .ok_or(AttachmentError::Internal("MAC check used after finish"))?;

        let start = out.len();
        self.tail.push(chunk, out);
        hmac.update(&out[start..]);
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Flush> {
        let Some(hmac) = self.hmac.take() else {
            return Ok(Flush::Done);
        };

        let claimed = self.tail.claimed()?;
        let computed = hmac.finalize().into_bytes();
        if !constant_time_eq(&computed, &claimed) {
            return Err(self.layer.mismatch());
        }
        Ok(Flush::Done)
    }
}

enum IvState {
    Collecting { buffer: [u8; IV_LEN], filled: usize },
    Streaming,
}

/// 从任意分段到达的流中切出开头的 IV
pub struct IvCollector {
    state: IvState,
}

impl Default for IvCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl IvCollector {
    pub fn new() -> Self {
        Self {
            state: IvState::Collecting {
                buffer: [0u8; IV_LEN],
                filled: 0,
            },
        }
    }

    /// 从 `chunk` 开头消费 IV 字节。
    ///
    /// 凑齐 IV 的那次调用返回 IV 以及其后的剩余字节。
    pub fn feed<'c>(&mut self, chunk: &'c [u8]) -> (Option<Iv>, &'c [u8]) {
        let IvState::Collecting { buffer, filled } = &mut self.state else {
            return (None, chunk);
        };

        let take = (IV_LEN - *filled).min(chunk.len());
        buffer[*filled..*filled + take].copy_from_slice(&chunk[..take]);
        *filled += take;

        if *filled < IV_LEN {
            return (None, &chunk[take..]);
        }

        let iv = *buffer;
        self.state = IvState::Streaming;
        (Some(iv), &chunk[take..])
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, IvState::Streaming)
    }

    /// 流在 IV 内部结束时返回 `TruncatedStream`
    pub fn ensure_complete(&self) -> Result<()> {
        match self.state {
            IvState::Streaming => Ok(()),
            IvState::Collecting { filled, .. } => Err(AttachmentError::TruncatedStream {
                expected: IV_LEN,
                actual: filled,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Chain;

    const MAC_KEY: [u8; 32] = [3u8; 32];

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut chain = Chain::new()
            .then(PrependIv::new([1u8; IV_LEN]))
            .then(AppendMac::new(&MAC_KEY).unwrap());
        let mut out = chain.push(body).unwrap();
        out.extend(chain.finish().unwrap());
        out
    }

    fn verify(blob: &[u8], piece: usize, layer: MacLayer) -> Result<Vec<u8>> {
        let mut chain = Chain::new().then(VerifyMac::new(&MAC_KEY, layer)?);
        let mut out = Vec::new();
        for chunk in blob.chunks(piece) {
            out.extend(chain.push(chunk)?);
        }
        out.extend(chain.finish()?);
        Ok(out)
    }

    #[test]
    fn iv_is_emitted_even_without_input() {
        let out = framed(b"");
        assert_eq!(out.len(), IV_LEN + MAC_LEN);
        assert_eq!(&out[..IV_LEN], &[1u8; IV_LEN]);
    }

    #[test]
    fn verify_strips_the_mac_for_any_chunking() {
        let blob = framed(b"some attachment body that spans several chunks");
        for piece in [1, 5, 31, 32, 33, 64, blob.len()] {
            let body = verify(&blob, piece, MacLayer::Inner).unwrap();
            assert_eq!(body, &blob[..blob.len() - MAC_LEN], "piece {piece}");
        }
    }

    #[test]
    fn flipped_bit_fails_with_the_layer_error() {
        let mut blob = framed(b"payload");
        blob[IV_LEN] ^= 0x01;
        assert!(matches!(
            verify(&blob, 7, MacLayer::Inner),
            Err(AttachmentError::BadMac)
        ));
        assert!(matches!(
            verify(&blob, 7, MacLayer::Outer),
            Err(AttachmentError::BadOuterMac)
        ));
    }

    #[test]
    fn short_stream_reports_truncation() {
        assert!(matches!(
            verify(&[0u8; 20], 4, MacLayer::Inner),
            Err(AttachmentError::TruncatedStream {
                expected: 32,
                actual: 20
            })
        ));
    }

    #[test]
    fn mac_tail_keeps_the_last_bytes() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut tail = MacTail::new();
        let mut released = Vec::new();
        for chunk in data.chunks(13) {
            tail.push(chunk, &mut released);
        }
        assert_eq!(released, &data[..68]);
        assert_eq!(tail.claimed().unwrap().as_slice(), &data[68..]);
    }

    #[test]
    fn iv_collector_handles_split_ivs() {
        let data: Vec<u8> = (0..40u8).collect();
        let mut collector = IvCollector::new();

        let (iv, rest) = collector.feed(&data[..10]);
        assert!(iv.is_none());
        assert!(rest.is_empty());
        assert!(collector.ensure_complete().is_err());

        let (iv, rest) = collector.feed(&data[10..20]);
        assert_eq!(iv.unwrap().as_slice(), &data[..16]);
        assert_eq!(rest, &data[16..20]);

        let (iv, rest) = collector.feed(&data[20..]);
        assert!(iv.is_none());
        assert_eq!(rest, &data[20..]);
        assert!(collector.is_complete());
    }
}
