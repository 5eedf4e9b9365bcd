//! 长度档位与密文长度的闭式计算
//!
//! 加密前明文用零字节填充到某个档位，存储长度只暴露附件所在的档位。
//! 档位按 5% 几何增长，最小 541 字节；已存储的附件都按这张表填充，不得改动。
//!
//! 本模块全部是纯函数，不接触附件数据，
//! 仅凭声明的明文长度即可算出下载的预期大小。

use super::{BLOCK_SIZE, IV_LEN, MAC_LEN};

/// 最小档位
const MIN_BUCKET: u64 = 541;

/// 相邻档位的增长系数
const BUCKET_GROWTH: f64 = 1.05;

/// 原始明文长度对应的档位（填充后的明文长度）
///
/// 单调不减，且总是 `>= raw_len`。
pub fn padded_size(raw_len: u64) -> u64 {
    if raw_len <= MIN_BUCKET {
        return MIN_BUCKET;
    }

    let exponent = ((raw_len as f64).ln() / BUCKET_GROWTH.ln()).ceil();
    let bucket = BUCKET_GROWTH.powf(exponent).floor() as u64;

    bucket.max(MIN_BUCKET)
}

/// 填充后明文对应的 CBC 输出长度；超出 `u64` 时返回 `None`
///
/// PKCS#7 总会追加 1 到 16 字节，长度恰为块大小整数倍时也会多出一整块。
pub fn ciphertext_len(padded_len: u64) -> Option<u64> {
    let block = BLOCK_SIZE as u64;
    (padded_len / block).checked_add(1)?.checked_mul(block)
}

/// 开启档位填充时，`raw_len` 字节明文成帧后（IV + 密文 + MAC）的准确长度
pub fn total_framed_len(raw_len: u64) -> Option<u64> {
    framed(ciphertext_len(padded_size(raw_len))?)
}

/// 不做档位填充时的成帧长度（外层信封）
pub fn unpadded_framed_len(raw_len: u64) -> Option<u64> {
    framed(ciphertext_len(raw_len)?)
}

fn framed(ciphertext_len: u64) -> Option<u64> {
    ciphertext_len.checked_add((IV_LEN + MAC_LEN) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 已存储附件所用档位表的一部分
    const KNOWN_BUCKETS: &[u64] = &[
        541, 568, 596, 626, 657, 690, 725, 761, 799, 839, 881, 925, 972, 1020, 1071, 1125,
        13549, 14226, 14937, 15684, 992136, 1041743, 1093831, 1148522, 10319484, 10835458,
        56922433, 59768555, 102224512, 107335738,
    ];

    #[test]
    fn first_bucket_covers_small_sizes() {
        for size in 0..=541 {
            assert_eq!(padded_size(size), 541, "size {size}");
        }
    }

    #[test]
    fn known_buckets_are_fixed_points() {
        for &bucket in KNOWN_BUCKETS {
            assert_eq!(padded_size(bucket), bucket, "exact {bucket}");
            assert_eq!(padded_size(bucket - 1), bucket, "just under {bucket}");
        }
    }

    #[test]
    fn consecutive_known_buckets_are_adjacent() {
        assert_eq!(padded_size(542), 568);
        assert_eq!(padded_size(569), 596);
        assert_eq!(padded_size(1126), 1181);
    }

    #[test]
    fn bucket_is_monotonic_and_never_shrinks() {
        let mut previous = 0;
        for size in (0..200_000).step_by(37) {
            let bucket = padded_size(size);
            assert!(bucket >= size);
            assert!(bucket >= previous);
            previous = bucket;
        }
    }

    #[test]
    fn ciphertext_len_always_adds_a_block() {
        assert_eq!(ciphertext_len(0), Some(16));
        assert_eq!(ciphertext_len(15), Some(16));
        assert_eq!(ciphertext_len(16), Some(32));
        assert_eq!(ciphertext_len(17), Some(32));
        assert_eq!(ciphertext_len(541), Some(544));
    }

    #[test]
    fn sizes_near_the_top_of_u64_do_not_overflow() {
        assert_eq!(ciphertext_len(u64::MAX - 3), None);
        assert_eq!(ciphertext_len(u64::MAX - 16), Some(u64::MAX - 15));
        assert_eq!(total_framed_len(u64::MAX), None);
        assert_eq!(unpadded_framed_len(u64::MAX - 40), None);
    }

    #[test]
    fn framed_length_for_empty_plaintext() {
        // 填充到 541 -> 密文 544，再加 IV 与 MAC
        assert_eq!(total_framed_len(0), Some(16 + 544 + 32));
        assert_eq!(unpadded_framed_len(0), Some(16 + 16 + 32));
    }
}
