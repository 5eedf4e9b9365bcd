//! 改变流长度的 stage：加密时做档位填充，解密时截断回声明长度

use super::{Flush, Stage};
use crate::error::Result;
use crate::format::padding::padded_size;

/// 单次 `finish` 最多输出的填充零字节数
const PADDING_PIECE: u64 = 64 * 1024;

/// 转发明文，随后追加零字节直到所在档位
pub struct AppendPadding {
    seen: u64,
    remaining: Option<u64>,
}

impl Default for AppendPadding {
    fn default() -> Self {
        Self::new()
    }
}

impl AppendPadding {
    pub fn new() -> Self {
        Self {
            seen: 0,
            remaining: None,
        }
    }
}

impl Stage for AppendPadding {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.seen += chunk.len() as u64;
        out.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> Result<Flush> {
        let seen = self.seen;
        let remaining = self
            .remaining
            .get_or_insert_with(|| padded_size(seen) - seen);

        let piece = (*remaining).min(PADDING_PIECE);
        out.resize(out.len() + piece as usize, 0);
        *remaining -= piece;

        if *remaining == 0 {
            Ok(Flush::Done)
        } else {
            Ok(Flush::Pending)
        }
    }
}

/// 只转发前 `limit` 字节，丢弃其后的全部字节
pub struct Truncate {
    remaining: u64,
}

impl Truncate {
    pub fn new(limit: u64) -> Self {
        Self { remaining: limit }
    }
}

impl Stage for Truncate {
    fn process(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let take = (chunk.len() as u64).min(self.remaining);
        out.extend_from_slice(&chunk[..take as usize]);
        self.remaining -= take;
        Ok(())
    }

    fn finish(&mut self, _out: &mut Vec<u8>) -> Result<Flush> {
        Ok(Flush::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Chain;

    fn run(chain: &mut Chain<'_>, input: &[u8], piece: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in input.chunks(piece) {
            out.extend(chain.push(chunk).unwrap());
        }
        out.extend(chain.finish().unwrap());
        out
    }

    #[test]
    fn padding_fills_up_to_the_bucket_with_zeros() {
        let mut chain = Chain::new().then(AppendPadding::new());
        let out = run(&mut chain, b"hello", 2);

        assert_eq!(out.len(), 541);
        assert_eq!(&out[..5], b"hello");
        assert!(out[5..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn empty_input_pads_to_the_smallest_bucket() {
        let mut chain = Chain::new().then(AppendPadding::new());
        assert_eq!(chain.finish().unwrap(), vec![0u8; 541]);
    }

    #[test]
    fn large_padding_is_emitted_in_bounded_pieces() {
        let input = vec![1u8; 10_000_000];
        let expected = padded_size(input.len() as u64) as usize;
        assert!(expected - input.len() > PADDING_PIECE as usize);

        let mut chain = Chain::new().then(AppendPadding::new());
        let out = run(&mut chain, &input, 65_536);
        assert_eq!(out.len(), expected);
    }

    #[test]
    fn truncate_drops_the_tail() {
        let mut chain = Chain::new().then(Truncate::new(7));
        assert_eq!(run(&mut chain, b"attachment", 3), b"attachm");

        let mut chain = Chain::new().then(Truncate::new(0));
        assert!(run(&mut chain, b"abc", 1).is_empty());
    }
}
