// ==================== 备份/恢复命令 ====================
//
// UI 层调用的入口。所有失败统一转换为可序列化的 AppError，
// 存储类操作保留 BackupStoreResult 结构直接返回。

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::backup_builder::{build_legacy_backup, build_universal_envelope, BackupEnvelope};
use crate::backup_common::{filename_timestamp, BackupError};
use crate::backup_config::BackupSettings;
use crate::backup_export::{DirectoryExportSink, ExportReceipt, ExportSink};
use crate::backup_store::{
    BackupStore, BackupStoreResult, BackupSummary, KeyValueStore, StorageUsage, StoreFailure,
};
use crate::models::{ActingUser, AppError, AppErrorType, ApplicationDataset};
use crate::restore::{
    apply_restore, restore, validate_universal, DataImporter, RestoreMode, RestoreReport,
    ValidatedPayload,
};
use crate::scope_filter::scope_dataset_with_policy;

fn deliver_universal(bytes: &[u8], sink: &dyn ExportSink) -> Result<ExportReceipt, AppError> {
    let filename = format!("backup-universal-{}.json", filename_timestamp(Utc::now()));
    Ok(sink.deliver(&filename, bytes)?)
}

/// 应用数据集的只读快照来源
pub trait DatasetProvider {
    fn snapshot(&self) -> anyhow::Result<ApplicationDataset>;
}

impl DatasetProvider for ApplicationDataset {
    fn snapshot(&self) -> anyhow::Result<ApplicationDataset> {
        Ok(self.clone())
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        let message = err.to_string();
        match err {
            BackupError::Format(_) | BackupError::Encoding(_) => AppError::validation(message),
            BackupError::MissingKeys(keys) => AppError::with_details(
                AppErrorType::Validation,
                message,
                json!({ "missingKeys": keys }),
            ),
            BackupError::DuplicateId(id) => {
                AppError::with_details(AppErrorType::Duplicate, message, json!({ "id": id }))
            }
            BackupError::StorageQuota(_) => AppError::new(AppErrorType::QuotaExceeded, message),
            BackupError::Storage(_) | BackupError::Import(_) => AppError::storage(message),
            BackupError::IntegrityMismatch { expected, actual } => AppError::with_details(
                AppErrorType::Integrity,
                message,
                json!({ "expected": expected, "actual": actual }),
            ),
            BackupError::NotFound(_) => AppError::not_found(message),
            BackupError::Io(_) => AppError::file_system(message),
        }
    }
}

/// 存储结果转为 Result，失败原因映射到对应的错误类型
fn store_outcome(result: BackupStoreResult) -> Result<BackupStoreResult, AppError> {
    let error_type = match result.failure {
        None => return Ok(result),
        Some(StoreFailure::Duplicate) => AppErrorType::Duplicate,
        Some(StoreFailure::NotFound) => AppErrorType::NotFound,
        Some(StoreFailure::QuotaExceeded) => AppErrorType::QuotaExceeded,
        Some(StoreFailure::Storage) => AppErrorType::Storage,
    };
    Err(AppError::new(error_type, result.message))
}

fn snapshot(provider: &dyn DatasetProvider) -> Result<ApplicationDataset, AppError> {
    provider.snapshot().map_err(|e| {
        error!("[BackupCommands] 读取应用数据失败: {}", e);
        AppError::storage(format!("读取应用数据失败: {}", e))
    })
}

/// 备份服务：组合设置、本地备份存储与外部协作方
pub struct BackupService<S: KeyValueStore> {
    settings: BackupSettings,
    store: BackupStore<S>,
}

impl<S: KeyValueStore> BackupService<S> {
    pub fn new(settings: BackupSettings, kv: S) -> Self {
        let store = BackupStore::from_settings(kv, &settings);
        Self { settings, store }
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub fn store(&self) -> &BackupStore<S> {
        &self.store
    }

    /// 设置中 `export_directory` 对应的导出目录
    pub fn default_export_sink(&self) -> Result<DirectoryExportSink, AppError> {
        self.settings
            .export_directory
            .as_deref()
            .map(DirectoryExportSink::new)
            .ok_or_else(|| AppError::configuration("未配置 export_directory"))
    }

    /// 生成旧版备份并导出（generateBackup）
    pub fn generate_backup(
        &self,
        provider: &dyn DatasetProvider,
        user: &ActingUser,
        sink: &dyn ExportSink,
    ) -> Result<ExportReceipt, AppError> {
        let (filename, bytes) = self.generate_backup_bytes(provider, user)?;
        Ok(sink.deliver(&filename, &bytes)?)
    }

    /// 生成旧版备份的文件名和字节内容，不做任何 I/O
    pub fn generate_backup_bytes(
        &self,
        provider: &dyn DatasetProvider,
        user: &ActingUser,
    ) -> Result<(String, Vec<u8>), AppError> {
        let full = snapshot(provider)?;
        let file = build_legacy_backup(&full, user, self.settings.unscoped_role_policy);
        let bytes = file.to_pretty_bytes()?;
        Ok((file.filename, bytes))
    }

    /// 生成按角色裁剪的通用备份信封
    pub fn create_universal_backup(
        &self,
        provider: &dyn DatasetProvider,
        user: &ActingUser,
    ) -> Result<BackupEnvelope, AppError> {
        let full = snapshot(provider)?;
        let scoped = scope_dataset_with_policy(&full, user, self.settings.unscoped_role_policy);
        Ok(build_universal_envelope(scoped, &self.settings.app_version)?)
    }

    /// 生成通用备份并保存到本地存储
    pub fn save_universal_backup(
        &self,
        provider: &dyn DatasetProvider,
        user: &ActingUser,
    ) -> Result<BackupEnvelope, AppError> {
        let envelope = self.create_universal_backup(provider, user)?;
        store_outcome(self.store.save(&envelope))?;
        Ok(envelope)
    }

    /// 生成通用备份并导出到文件
    pub fn export_universal_backup(
        &self,
        provider: &dyn DatasetProvider,
        user: &ActingUser,
        sink: &dyn ExportSink,
    ) -> Result<ExportReceipt, AppError> {
        let envelope = self.create_universal_backup(provider, user)?;
        deliver_universal(&envelope.to_pretty_bytes()?, sink)
    }

    /// 把本地存储中的备份导出到文件（本地空间不足时的替代方案）
    pub fn export_stored_backup(
        &self,
        id: &str,
        sink: &dyn ExportSink,
    ) -> Result<ExportReceipt, AppError> {
        let raw = self
            .store
            .get_raw_by_id(id)
            .ok_or_else(|| AppError::from(BackupError::NotFound(id.to_string())))?;
        // 按存储中的原样导出，保证导出文件的校验和仍然成立
        let bytes = serde_json::to_vec_pretty(&raw)?;
        deliver_universal(&bytes, sink)
    }

    pub fn list_backups(&self) -> Vec<BackupSummary> {
        self.store.summaries()
    }

    pub fn delete_backup(&self, id: &str) -> BackupStoreResult {
        self.store.delete_by_id(id)
    }

    pub fn clear_backups(&self) -> BackupStoreResult {
        self.store.clear_all()
    }

    pub fn storage_usage(&self) -> StorageUsage {
        self.store.usage()
    }

    /// 校验上传的备份（validateBackup），使用配置中的完整性策略
    pub fn validate_backup(
        &self,
        raw: &str,
        mode: RestoreMode,
    ) -> Result<ValidatedPayload, AppError> {
        Ok(restore(raw, mode, self.settings.integrity_policy)?)
    }

    /// 把已校验的通用备份保存到本地存储
    pub fn keep_uploaded_backup(
        &self,
        payload: &ValidatedPayload,
    ) -> Result<BackupStoreResult, AppError> {
        match payload {
            ValidatedPayload::Universal { raw, .. } => {
                store_outcome(self.store.save_raw(raw.clone()))
            }
            ValidatedPayload::Legacy(_) => Err(AppError::validation(
                "旧版备份没有元数据，不能保存到本地备份列表",
            )),
        }
    }

    /// 执行恢复：交给外部导入方（调用前须取得用户确认）
    pub fn restore_backup(
        &self,
        payload: &ValidatedPayload,
        importer: &mut dyn DataImporter,
    ) -> Result<RestoreReport, AppError> {
        Ok(apply_restore(payload, importer)?)
    }

    /// 从本地存储恢复：按配置策略校验完整性后交给导入方
    pub fn restore_stored_backup(
        &self,
        id: &str,
        importer: &mut dyn DataImporter,
    ) -> Result<RestoreReport, AppError> {
        let raw = self
            .store
            .get_raw_by_id(id)
            .ok_or_else(|| AppError::from(BackupError::NotFound(id.to_string())))?;

        let payload = validate_universal(raw, self.settings.integrity_policy).map_err(|e| {
            warn!("[BackupCommands] 本地备份 {} 校验失败: {}", id, e);
            AppError::from(e)
        })?;
        info!(
            "[BackupCommands] 从本地备份恢复: id={}, integrity={:?}",
            id,
            payload.integrity()
        );
        self.restore_backup(&payload, importer)
    }
}
