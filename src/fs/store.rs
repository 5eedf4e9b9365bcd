//! 基于磁盘的附件存储
//!
//! 附件统一存放在一个根目录下，路径为 `<前两位十六进制>/<64 位十六进制>`。
//! 传给存储的路径都相对于根目录，落盘前先做校验。
//!
//! 注意：
//! - 输出经由 `write_atomic`，加密或解密失败（包括 MAC、digest 校验失败）
//!   不会留下任何文件
//! - 密钥从不写在附件旁边

use std::fs;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};

use rand::{RngCore, rngs::OsRng};
use tracing::{debug, error, info};

use super::atomic::write_atomic;
use crate::crypto::generate_iv;
use crate::crypto::keys::AttachmentKeys;
use crate::decrypt::{AttachmentDecryptor, DecryptSlots, DecryptedAttachment};
use crate::encrypt::{AttachmentEncryptor, EncryptSlots, EncryptedAttachment, Padding};
use crate::error::{AttachmentError, IoContext, Result};
use crate::format::Digest;
use crate::stream::Source;

/// 生成附件名所用的随机字节数
const NAME_BYTES: usize = 32;

/// 已写入存储的加密附件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    /// 相对存储根目录
    pub path: PathBuf,
    pub encrypted: EncryptedAttachment,
}

/// 已写入存储的解密附件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFile {
    /// 相对存储根目录
    pub path: PathBuf,
    pub decrypted: DecryptedAttachment,
}

/// 使用新的本地密钥重新加密的下载附件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocallyReencrypted {
    /// 相对存储根目录
    pub path: PathBuf,
    /// 文件当前使用的 64 字节密钥，十六进制编码
    pub local_key: String,
    pub plaintext_hash: String,
    pub digest: Digest,
    /// 明文长度
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 新的随机附件名：32 个随机字节的十六进制
    pub fn create_name() -> String {
        let mut bytes = [0u8; NAME_BYTES];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// `<前两位>/<name>`，文件分散到 256 个目录
    pub fn relative_path_for(name: &str) -> PathBuf {
        let prefix = name.get(..2).unwrap_or(name);
        Path::new(prefix).join(name)
    }

    /// 解析相对存储根目录的路径，拒绝任何可能逃出根目录的路径
    pub fn absolute_path(&self, relative: &Path) -> Result<PathBuf> {
        let safe = validate_relative_path(relative)?;
        if safe.as_os_str().is_empty() {
            return Err(AttachmentError::UnsafePath(format!("{relative:?} is empty")));
        }
        safe_join(&self.root, &safe)
    }

    fn allocate(&self) -> Result<(PathBuf, PathBuf)> {
        let relative = Self::relative_path_for(&Self::create_name());
        let absolute = self.absolute_path(&relative)?;
        Ok((relative, absolute))
    }

    /// 将 `source` 加密写入新命名的文件
    pub fn encrypt_to_disk(
        &self,
        source: Source<'_>,
        encryptor: &AttachmentEncryptor<'_>,
    ) -> Result<StoredAttachment> {
        let (relative, absolute) = self.allocate()?;

        let sink_label = absolute.display().to_string();
        let encrypted = write_atomic(&absolute, |file| {
            encryptor.encrypt_labelled(source, BufWriter::new(file), &sink_label)
        })?;

        Ok(StoredAttachment {
            path: relative,
            encrypted,
        })
    }

    /// 将 `source` 解密写入新命名的文件。
    ///
    /// 只有全部 MAC 与完整性检查通过后文件才会出现。
    pub fn decrypt_to_disk(
        &self,
        source: Source<'_>,
        decryptor: &AttachmentDecryptor<'_>,
    ) -> Result<DecryptedFile> {
        let (relative, absolute) = self.allocate()?;

        let sink_label = absolute.display().to_string();
        let decrypted = write_atomic(&absolute, |file| {
            decryptor.decrypt_labelled(source, BufWriter::new(file), &sink_label)
        })?;

        Ok(DecryptedFile {
            path: relative,
            decrypted,
        })
    }

    /// 解密下载的附件，并用新生成的本地密钥重新加密，数据只过一遍
    pub fn reencrypt_locally(
        &self,
        source: Source<'_>,
        decryptor: &AttachmentDecryptor<'_>,
    ) -> Result<LocallyReencrypted> {
        let (relative, absolute) = self.allocate()?;
        let local_keys = AttachmentKeys::generate();
        let iv = generate_iv();

        debug!(
            id = %decryptor.log_id,
            source = %source.describe(),
            size = decryptor.size,
            "reencrypting attachment locally"
        );

        let result = write_atomic(&absolute, |file| {
            let source_label = source.describe();
            let reader = source.open()?;

            let mut decrypt_slots = DecryptSlots::default();
            let mut encrypt_slots = EncryptSlots::default();
            {
                let decrypt =
                    decrypt_slots.chain(decryptor.keys, decryptor.layering, decryptor.size)?;
                let encrypt = encrypt_slots.chain(local_keys.material(), &iv, Padding::Bucket)?;
                let mut chain = decrypt
                    .append(encrypt)
                    .with_endpoints(source_label, absolute.display().to_string());
                chain.run(reader, BufWriter::new(file), &decryptor.config)?;
            }

            decrypt_slots.verify(&decryptor.integrity)?;
            encrypt_slots.into_result(iv, Padding::Bucket)
        });

        let encrypted = match result {
            Ok(encrypted) => encrypted,
            Err(err) => {
                error!(id = %decryptor.log_id, error = %err, "local reencryption failed");
                return Err(err);
            }
        };

        info!(
            id = %decryptor.log_id,
            plaintext_size = encrypted.plaintext_size,
            ciphertext_size = encrypted.ciphertext_size,
            "attachment reencrypted locally"
        );

        Ok(LocallyReencrypted {
            path: relative,
            local_key: local_keys.to_hex(),
            plaintext_hash: encrypted.plaintext_hash,
            digest: encrypted.digest,
            size: encrypted.plaintext_size,
        })
    }

    /// 删除存储中的文件；文件已不存在不算错误
    pub fn safe_unlink(&self, relative: &Path) -> Result<()> {
        let absolute = self.absolute_path(relative)?;
        match fs::remove_file(&absolute) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.io_context(|| format!("removing {}", absolute.display())),
        }
    }
}

/// 只保留普通路径分量；`..`、根与前缀分量一律拒绝
fn validate_relative_path(rel: &Path) -> Result<PathBuf> {
    let mut safe = PathBuf::new();
    for comp in rel.components() {
        match comp {
            Component::CurDir => {}
            Component::Normal(v) => safe.push(v),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(AttachmentError::UnsafePath(format!("{rel:?}")));
            }
        }
    }
    Ok(safe)
}

fn safe_join(root: &Path, rel: &Path) -> Result<PathBuf> {
    let joined = root.join(rel);
    if !joined.starts_with(root) {
        return Err(AttachmentError::UnsafePath(format!("{joined:?} leaves the store")));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_spread_over_prefix_directories() {
        let name = AttachmentStore::create_name();
        assert_eq!(name.len(), 64);

        let relative = AttachmentStore::relative_path_for(&name);
        assert_eq!(relative, Path::new(&name[..2]).join(&name));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let store = AttachmentStore::new("/var/attachments");
        for bad in ["../etc/passwd", "/etc/passwd", "ab/../../x", ""] {
            assert!(
                matches!(
                    store.absolute_path(Path::new(bad)),
                    Err(AttachmentError::UnsafePath(_))
                ),
                "{bad}"
            );
        }

        let ok = store.absolute_path(Path::new("./ab/abcd")).unwrap();
        assert_eq!(ok, Path::new("/var/attachments/ab/abcd"));
    }

    #[test]
    fn unlinking_a_missing_file_is_fine() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let store = AttachmentStore::new(dir.path());
        store.safe_unlink(Path::new("ab/missing")).unwrap();
    }
}
