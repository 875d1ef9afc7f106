//! 备份文件导出
//!
//! 浏览器端的"触发下载"在本目标中由 [`ExportSink`] 代替：
//! - [`DirectoryExportSink`]：原子写入到指定目录（临时文件 + 重命名）
//! - 需要纯字节时直接使用 `to_pretty_bytes()`，无需任何 sink

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::backup_common::{calculate_bytes_hash, BackupError};

/// 导出回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReceipt {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// 文件内容的 SHA256（便于用户核对下载文件）
    pub sha256: String,
}

/// 文件下载原语
pub trait ExportSink {
    fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<ExportReceipt, BackupError>;
}

/// 写入本地目录的导出 sink
#[derive(Debug, Clone)]
pub struct DirectoryExportSink {
    dir: PathBuf,
}

impl DirectoryExportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ExportSink for DirectoryExportSink {
    fn deliver(&self, filename: &str, bytes: &[u8]) -> Result<ExportReceipt, BackupError> {
        validate_filename(filename)?;
        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(filename);
        write_atomic(&path, bytes).map_err(|e| {
            error!("[BackupExport] 写入导出文件失败 {:?}: {}", path, e);
            e
        })?;

        let receipt = ExportReceipt {
            filename: filename.to_string(),
            path,
            size_bytes: bytes.len() as u64,
            sha256: calculate_bytes_hash(bytes),
        };
        info!(
            "[BackupExport] 已导出 {} ({} bytes, sha256={})",
            receipt.filename, receipt.size_bytes, receipt.sha256
        );
        Ok(receipt)
    }
}

/// 文件名只允许单级名称，防止写出目标目录
fn validate_filename(filename: &str) -> Result<(), BackupError> {
    let invalid = filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(|c: char| c == '/' || c == '\\' || c == '\0');
    if invalid {
        return Err(BackupError::Format(format!("非法的导出文件名: {:?}", filename)));
    }
    Ok(())
}

/// 原子写入
///
/// 1. 先写入临时文件 (.tmp)
/// 2. 同步到磁盘
/// 3. 原子重命名为目标文件
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        // 失败时尝试清理临时文件
        let _ = fs::remove_file(&temp_path);
    }
    result
}
