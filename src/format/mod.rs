//! 加密附件的落盘格式
//!
//! ```text
//! [ IV: 16 bytes ][ AES-256-CBC ciphertext: N bytes, N % 16 == 0 ][ HMAC-SHA256: 32 bytes ]
//! ```
//!
//! MAC 覆盖 IV 与密文。digest 是整个帧的 SHA-256，作为附件按内容寻址的标识。
//!
//! 备份（双层）附件把上面的帧当作明文，使用独立密钥、不做档位填充再成帧一次：
//!
//! ```text
//! [ outer IV ][ outer ciphertext( inner blob ) ][ outer MAC ]
//! ```

pub mod padding;

pub use padding::{ciphertext_len, padded_size, total_framed_len};

/// AES 块大小
pub const BLOCK_SIZE: usize = 16;

/// CBC 初始化向量长度
pub const IV_LEN: usize = 16;

/// 末尾 HMAC-SHA256 长度
pub const MAC_LEN: usize = 32;

/// SHA-256 长度，digest 与明文哈希共用
pub const DIGEST_LEN: usize = 32;

/// 十六进制明文哈希的长度
pub const PLAINTEXT_HASH_HEX_LEN: usize = DIGEST_LEN * 2;

pub type Iv = [u8; IV_LEN];
pub type Mac = [u8; MAC_LEN];
pub type Digest = [u8; DIGEST_LEN];
