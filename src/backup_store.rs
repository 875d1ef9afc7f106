//! # 本地备份存储
//!
//! 在持久化键值存储的单个槽位中保存通用备份信封列表（JSON 数组，最新在前）。
//!
//! ## 组件
//!
//! - [`KeyValueStore`]: 底层键值存储抽象（`get` / `set` / `remove`）
//! - [`MemoryKeyValueStore`]: 内存实现，可设置字节配额（模拟浏览器本地存储）
//! - [`FileKeyValueStore`]: 目录实现，每个键一个文件，原子写入
//! - [`BackupStore`]: 备份列表的读改写，ID 去重，配额错误单独报告
//!
//! ## 并发
//!
//! 每次写操作都是对整个槽位的读-改-写，没有版本校验；多个写入方共享同一槽位时
//! 以最后一次写入为准。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::backup_builder::BackupEnvelope;
use crate::backup_common::format_megabytes;
use crate::backup_config::{BackupSettings, DEFAULT_STORAGE_KEY};
use crate::backup_export::write_atomic;

/// 底层存储错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

/// 持久化键值存储
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

// ============================================================================
// 内存实现
// ============================================================================

/// 内存键值存储
///
/// 配额按所有键和值的字节数之和计算。
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StorageError> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Other("内存存储锁已中毒".to_string()))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let others: u64 = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            let required = others + (key.len() + value.len()) as u64;
            if required > quota {
                return Err(StorageError::QuotaExceeded(format!(
                    "需要 {} 字节，配额 {} 字节",
                    required, quota
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

// ============================================================================
// 文件实现
// ============================================================================

/// 目录键值存储：`<dir>/<key>.json`
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            quota_bytes: None,
        }
    }

    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// 按设置中的 `storage_quota_bytes` 创建
    pub fn from_settings(dir: impl Into<PathBuf>, settings: &BackupSettings) -> Self {
        Self::new(dir).with_quota(settings.storage_quota_bytes)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_stem: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_stem))
    }

    /// 目录中除 `exclude` 外所有键文件的总字节数
    fn used_bytes_excluding(&self, exclude: &Path) -> Result<u64, StorageError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(map_io_error(e)),
        };

        let mut total = 0u64;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("[BackupStore] Directory entry read error (skipped): {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if path == exclude || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        Ok(total)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io_error(e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        if let Some(quota) = self.quota_bytes {
            let required = self.used_bytes_excluding(&path)? + value.len() as u64;
            if required > quota {
                return Err(StorageError::QuotaExceeded(format!(
                    "需要 {} 字节，配额 {} 字节",
                    required, quota
                )));
            }
        }
        fs::create_dir_all(&self.dir).map_err(map_io_error)?;
        write_atomic(&path, value.as_bytes()).map_err(map_io_error)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io_error(e)),
        }
    }
}

/// 磁盘已满 / 超出磁盘配额映射为 `QuotaExceeded`
fn map_io_error(err: std::io::Error) -> StorageError {
    if is_quota_error(&err) {
        StorageError::QuotaExceeded(err.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[cfg(unix)]
fn is_quota_error(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}

#[cfg(windows)]
fn is_quota_error(err: &std::io::Error) -> bool {
    // ERROR_HANDLE_DISK_FULL = 39, ERROR_DISK_FULL = 112
    matches!(err.raw_os_error(), Some(39) | Some(112))
}

#[cfg(not(any(unix, windows)))]
fn is_quota_error(_err: &std::io::Error) -> bool {
    false
}

// ============================================================================
// 备份存储
// ============================================================================

/// 存储操作失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailure {
    Duplicate,
    NotFound,
    QuotaExceeded,
    Storage,
}

/// 存储操作结果（不抛错，供 UI 直接展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStoreResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StoreFailure>,
}

impl BackupStoreResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            failure: None,
        }
    }

    fn failed(failure: StoreFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(failure),
        }
    }

    fn from_storage_error(err: &StorageError, action: &str) -> Self {
        match err {
            StorageError::QuotaExceeded(detail) => Self::failed(
                StoreFailure::QuotaExceeded,
                format!(
                    "本地存储空间已满，无法{}（{}）。请删除旧备份，或改为导出到文件",
                    action, detail
                ),
            ),
            other => Self::failed(StoreFailure::Storage, format!("{}失败: {}", action, other)),
        }
    }
}

/// 本地存储占用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub used_bytes: u64,
    #[serde(rename = "formattedMB")]
    pub formatted_mb: String,
}

/// 备份列表摘要（不含数据块）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub id: String,
    pub version_app: String,
    pub created_at: String,
    pub total_registros: u64,
    pub size_bytes: u64,
}

/// 本地备份存储
pub struct BackupStore<S: KeyValueStore> {
    kv: S,
    key: String,
    max_entries: Option<usize>,
}

impl<S: KeyValueStore> BackupStore<S> {
    pub fn new(kv: S) -> Self {
        Self {
            kv,
            key: DEFAULT_STORAGE_KEY.to_string(),
            max_entries: None,
        }
    }

    pub fn from_settings(kv: S, settings: &BackupSettings) -> Self {
        Self::new(kv)
            .with_key(settings.storage_key.clone())
            .with_max_entries(settings.max_stored_backups)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// 最多保留的备份数；超出时保存操作会丢弃最旧的备份
    pub fn with_max_entries(mut self, max_entries: Option<usize>) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 保存备份（最新在前）；ID 已存在时不覆盖
    pub fn save(&self, envelope: &BackupEnvelope) -> BackupStoreResult {
        match serde_json::to_value(envelope) {
            Ok(raw) => self.save_raw(raw),
            Err(e) => {
                error!("[BackupStore] 序列化备份失败: {}", e);
                BackupStoreResult::failed(StoreFailure::Storage, format!("序列化备份失败: {}", e))
            }
        }
    }

    /// 按原样保存信封 JSON（上传的备份保留原始键顺序和未知字段）
    pub fn save_raw(&self, envelope: Value) -> BackupStoreResult {
        let Some(id) = envelope_id(&envelope).map(str::to_string) else {
            return BackupStoreResult::failed(StoreFailure::Storage, "备份缺少 metadata.id");
        };

        let mut backups = match self.read_list() {
            Ok(backups) => backups,
            Err(e) => {
                error!("[BackupStore] 读取本地备份失败，放弃保存: {}", e);
                return BackupStoreResult::from_storage_error(&e, "读取本地备份");
            }
        };
        if backups.iter().any(|b| envelope_id(b) == Some(id.as_str())) {
            warn!("[BackupStore] 备份 ID 已存在，拒绝覆盖: {}", id);
            return BackupStoreResult::failed(
                StoreFailure::Duplicate,
                format!("ID 为 {} 的备份已存在，未覆盖", id),
            );
        }

        backups.insert(0, envelope);
        if let Some(max) = self.max_entries {
            if backups.len() > max {
                let dropped: Vec<String> = backups
                    .drain(max..)
                    .filter_map(|b| envelope_id(&b).map(str::to_string))
                    .collect();
                info!("[BackupStore] 超出保留上限 {}，移除旧备份: {:?}", max, dropped);
            }
        }

        match self.write_list(&backups) {
            Ok(()) => {
                info!("[BackupStore] 备份已保存: id={}, total={}", id, backups.len());
                BackupStoreResult::ok("备份已保存到本地存储")
            }
            Err(e) => {
                error!("[BackupStore] 保存备份失败: {}", e);
                BackupStoreResult::from_storage_error(&e, "保存备份")
            }
        }
    }

    /// 所有备份；槽位不存在、读取失败或内容损坏时返回空列表
    pub fn list_all(&self) -> Vec<BackupEnvelope> {
        self.list_raw()
            .into_iter()
            .filter_map(|raw| match BackupEnvelope::from_value(raw) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!("[BackupStore] 跳过无法解析的备份: {}", e);
                    None
                }
            })
            .collect()
    }

    /// 所有备份的原始 JSON（最新在前）
    pub fn list_raw(&self) -> Vec<Value> {
        self.read_list().unwrap_or_else(|e| {
            warn!("[BackupStore] 读取本地备份失败: {}", e);
            Vec::new()
        })
    }

    pub fn get_by_id(&self, id: &str) -> Option<BackupEnvelope> {
        self.list_all().into_iter().find(|b| b.metadata.id == id)
    }

    /// 按 ID 取原始信封 JSON，校验和应基于它计算
    pub fn get_raw_by_id(&self, id: &str) -> Option<Value> {
        self.list_raw()
            .into_iter()
            .find(|b| envelope_id(b) == Some(id))
    }

    pub fn delete_by_id(&self, id: &str) -> BackupStoreResult {
        let backups = match self.read_list() {
            Ok(backups) => backups,
            Err(e) => {
                error!("[BackupStore] 读取本地备份失败，放弃删除: {}", e);
                return BackupStoreResult::from_storage_error(&e, "读取本地备份");
            }
        };
        let before = backups.len();
        let remaining: Vec<Value> = backups
            .into_iter()
            .filter(|b| envelope_id(b) != Some(id))
            .collect();

        if remaining.len() == before {
            return BackupStoreResult::failed(
                StoreFailure::NotFound,
                format!("未找到 ID 为 {} 的备份", id),
            );
        }

        match self.write_list(&remaining) {
            Ok(()) => {
                info!("[BackupStore] 备份已删除: {}", id);
                BackupStoreResult::ok(format!("备份 {} 已删除", id))
            }
            Err(e) => {
                error!("[BackupStore] 删除备份失败: {}", e);
                BackupStoreResult::from_storage_error(&e, "删除备份")
            }
        }
    }

    pub fn clear_all(&self) -> BackupStoreResult {
        match self.kv.remove(&self.key) {
            Ok(()) => {
                info!("[BackupStore] 已清空本地备份槽位: {}", self.key);
                BackupStoreResult::ok("已清空所有本地备份")
            }
            Err(e) => {
                error!("[BackupStore] 清空本地备份失败: {}", e);
                BackupStoreResult::from_storage_error(&e, "清空本地备份")
            }
        }
    }

    /// 槽位序列化内容的字节数
    pub fn usage(&self) -> StorageUsage {
        let used_bytes = match self.kv.get(&self.key) {
            Ok(Some(raw)) => raw.len() as u64,
            Ok(None) => 0,
            Err(e) => {
                warn!("[BackupStore] 读取存储占用失败: {}", e);
                0
            }
        };
        StorageUsage {
            used_bytes,
            formatted_mb: format_megabytes(used_bytes),
        }
    }

    pub fn summaries(&self) -> Vec<BackupSummary> {
        self.list_raw()
            .into_iter()
            .filter_map(|raw| {
                let size_bytes = raw.to_string().len() as u64;
                let envelope = BackupEnvelope::from_value(raw).ok()?;
                Some(BackupSummary {
                    id: envelope.metadata.id,
                    version_app: envelope.metadata.version_app,
                    created_at: envelope.metadata.created_at,
                    total_registros: envelope.metadata.total_registros,
                    size_bytes,
                })
            })
            .collect()
    }

    /// 读取槽位
    ///
    /// 槽位不存在或 JSON 损坏视为空列表；底层读取失败返回错误，
    /// 写操作据此放弃，避免用空列表覆盖已有备份。
    fn read_list(&self) -> Result<Vec<Value>, StorageError> {
        let Some(raw) = self.kv.get(&self.key)? else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<Value>>(&raw) {
            Ok(backups) => Ok(backups),
            Err(e) => {
                warn!("[BackupStore] 本地备份内容损坏，按空列表处理: {}", e);
                Ok(Vec::new())
            }
        }
    }

    fn write_list(&self, backups: &[Value]) -> Result<(), StorageError> {
        let json = serde_json::to_string(backups)
            .map_err(|e| StorageError::Other(format!("序列化备份列表失败: {}", e)))?;
        debug!("[BackupStore] 写入槽位 {} ({} bytes)", self.key, json.len());
        self.kv.set(&self.key, &json)
    }
}

fn envelope_id(envelope: &Value) -> Option<&str> {
    envelope.get("metadata")?.get("id")?.as_str()
}
