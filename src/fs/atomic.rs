//! 原子写入工具
//!
//! 提供「先写临时文件，成功后再替换目标文件」的写出语义，
//! 写入失败时不会在目标文件名下留下截断或不完整的文件。

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{AttachmentError, IoContext, Result};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 原子写文件。
///
/// 流程：
/// 1. 在目标目录创建临时文件；
/// 2. 调用 `write_fn` 写入完整内容；
/// 3. sync 后 rename 替换目标文件。
///
/// 任何失败都会删除临时文件。
pub fn write_atomic<F, T>(target: &Path, write_fn: F) -> Result<T>
where
    F: FnOnce(&mut File) -> Result<T>,
{
    let parent = target.parent().ok_or_else(|| {
        AttachmentError::InvalidConfig(format!(
            "{} has no parent directory, cannot write atomically",
            target.display()
        ))
    })?;

    fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;

    let tmp_path = build_tmp_path(parent, target.file_name());
    let mut tmp_file =
        File::create(&tmp_path).io_context(|| format!("creating {}", tmp_path.display()))?;

    let value = match write_fn(&mut tmp_file) {
        Ok(value) => value,
        Err(err) => {
            drop(tmp_file);
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
    };

    if let Err(err) = commit(tmp_file, &tmp_path, target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    Ok(value)
}

fn commit(tmp_file: File, tmp_path: &Path, target: &Path) -> Result<()> {
    tmp_file
        .sync_all()
        .io_context(|| format!("syncing {}", tmp_path.display()))?;
    drop(tmp_file);

    // 除 Windows 外，rename 会原子地替换已存在的目标
    #[cfg(windows)]
    if target.exists() {
        fs::remove_file(target).io_context(|| format!("replacing {}", target.display()))?;
    }

    fs::rename(tmp_path, target).io_context(|| format!("renaming to {}", target.display()))
}

fn build_tmp_path(parent: &Path, file_name: Option<&std::ffi::OsStr>) -> PathBuf {
    let base_name = file_name
        .and_then(|n| n.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("attachment");

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);

    parent.join(format!(
        ".{base_name}.tmp-{}-{timestamp}-{counter}",
        std::process::id()
    ))
}
