//! 备份系统共享组件
//!
//! 提供所有备份模块共用的错误类型和工具函数
//! - 校验和引擎: 备份信封的完整性戳（快速滚动哈希，非加密用途）
//! - SHA256计算: 导出文件回执
//! - 时间戳与容量格式化

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// 滚动哈希初始种子
const DIGEST_SEED: u32 = 5381;

/// 滚动哈希乘数
const DIGEST_MULTIPLIER: u32 = 33;

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Backup format error: {0}")]
    Format(String),

    #[error("Backup structure invalid, missing keys: {}", .0.join(", "))]
    MissingKeys(Vec<String>),

    #[error("A backup with id {0} already exists")]
    DuplicateId(String),

    #[error("Storage quota exceeded: {0}")]
    StorageQuota(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Import failed: {0}")]
    Import(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// 是否属于格式类错误（JSON 损坏、缺少键、旧版备份缺少集合）
    pub fn is_format_error(&self) -> bool {
        matches!(self, BackupError::Format(_) | BackupError::MissingKeys(_))
    }
}

/// 对任意可序列化值计算校验和
///
/// 先用规范序列化（serde_json，保持插入顺序）得到字符串，再对其 UTF-8 字节
/// 做滚动哈希。只用于检测篡改/损坏，不具备密码学安全性。
///
/// # Errors
/// 值无法序列化时返回 `BackupError::Encoding`
pub fn digest<T: Serialize + ?Sized>(value: &T) -> Result<String, BackupError> {
    let serialized =
        serde_json::to_string(value).map_err(|e| BackupError::Encoding(e.to_string()))?;
    Ok(digest_str(&serialized))
}

/// 对已解析的 JSON 值计算校验和
pub fn digest_value(value: &Value) -> String {
    // Value 的序列化不会失败
    digest_str(&value.to_string())
}

/// 对序列化后的字符串计算滚动哈希，结果为无前导零的小写十六进制
pub fn digest_str(serialized: &str) -> String {
    let hash = serialized.bytes().fold(DIGEST_SEED, |hash, byte| {
        hash.wrapping_mul(DIGEST_MULTIPLIER) ^ u32::from(byte)
    });
    format!("{:x}", hash)
}

/// 计算字节数组的SHA256哈希值
///
/// 用于导出文件的回执，无需重新读取磁盘文件
pub fn calculate_bytes_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// ISO-8601 毫秒精度 UTC 时间戳，例如 `2026-10-18T09:05:03.120Z`
pub fn iso_timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 文件名安全的时间戳：ISO 时间戳中的 `:` 和 `.` 替换为 `-`
pub fn filename_timestamp(now: DateTime<Utc>) -> String {
    iso_timestamp(now).replace(|c: char| c == ':' || c == '.', "-")
}

/// 字节数格式化为 MB，保留两位小数
pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / 1024.0 / 1024.0)
}
