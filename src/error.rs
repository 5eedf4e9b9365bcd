use std::io;

use thiserror::Error;

pub type Result<T, E = AttachmentError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttachmentError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("attachment keys must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("stream ended early: expected at least {expected} bytes, got {actual}")]
    TruncatedStream { expected: usize, actual: usize },

    #[error("bad MAC")]
    BadMac,

    #[error("bad outer encryption MAC")]
    BadOuterMac,

    #[error("bad digest")]
    BadDigest,

    #[error("bad plaintext hash")]
    BadPlaintextHash,

    #[error("reencrypted attachment does not reproduce the expected digest")]
    ReencryptedDigestMismatch,

    #[error("unsafe mode misuse: {0}")]
    UnsafeMode(&'static str),

    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(&'static str),

    #[error("unsafe attachment path: {0}")]
    UnsafePath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation aborted")]
    Aborted,

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl AttachmentError {
    /// 附件本身不可信时返回 true；I/O 错误或调用方用错不算
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::BadMac
                | Self::BadOuterMac
                | Self::BadDigest
                | Self::BadPlaintextHash
                | Self::TruncatedStream { .. }
                | Self::InvalidCiphertext(_)
        )
    }
}

/// 为原始 I/O 错误附加操作上下文（哪个文件、哪个阶段）
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| AttachmentError::Io {
            context: context().into(),
            source,
        })
    }
}
