//! 落盘输出：原子写入，以及基于它的附件存储

pub mod atomic;
pub mod store;

pub use atomic::write_atomic;
pub use store::{AttachmentStore, DecryptedFile, LocallyReencrypted, StoredAttachment};
