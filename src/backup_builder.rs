//! # 备份构建
//!
//! 两种输出格式：
//!
//! - **旧版平铺备份**：按角色裁剪后的集合映射，直接作为下载文件内容
//! - **通用备份信封**：`metadata` + `data` + `checksum`
//!
//! ```text
//! ApplicationDataset ──scope_dataset──▶ 裁剪数据 ──┬──▶ LegacyBackupFile (文件名 + 字节)
//!                                                  └──▶ BackupEnvelope  (digest({metadata, data}))
//! ```
//!
//! 所有 `*_at` 变体接受显式时间/ID，便于测试得到可复现的输出。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::backup_common::{digest, filename_timestamp, iso_timestamp, BackupError};
use crate::backup_config::UnscopedRolePolicy;
use crate::backup_validator::{validate_envelope, verify_integrity};
use crate::models::{ActingUser, ApplicationDataset, UserRole};
use crate::scope_filter::scope_dataset_with_policy;

/// 教区名称缺失时的文件名占位
const DIOCESE_NAME_FALLBACK: &str = "diocesis";

/// 堂区名称缺失时的文件名占位
const PARISH_NAME_FALLBACK: &str = "parroquia";

/// 备份元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    /// 备份 ID（唯一标识符）
    pub id: String,
    /// 应用版本
    pub version_app: String,
    /// 创建时间（ISO-8601）
    pub created_at: String,
    /// 所有集合的记录总数
    pub total_registros: u64,
}

/// 参与校验和计算的信封主体（字段顺序即序列化顺序）
#[derive(Serialize)]
struct EnvelopeBody<'a> {
    metadata: &'a BackupMetadata,
    data: &'a ApplicationDataset,
}

/// 通用备份信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub metadata: BackupMetadata,
    pub data: ApplicationDataset,
    pub checksum: String,
}

impl BackupEnvelope {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// 重新计算 `{metadata, data}` 的摘要
    pub fn compute_checksum(&self) -> Result<String, BackupError> {
        compute_checksum(&self.metadata, &self.data)
    }

    /// 当前校验和是否与内容一致
    pub fn verify(&self) -> Result<bool, BackupError> {
        Ok(self.compute_checksum()? == self.checksum)
    }

    /// 从已解析的 JSON 构造信封：先做结构校验，再做类型转换
    pub fn from_value(value: Value) -> Result<Self, BackupError> {
        validate_envelope(&value).into_result()?;
        serde_json::from_value(value)
            .map_err(|e| BackupError::Format(format!("备份信封字段类型错误: {}", e)))
    }

    /// 以原始 JSON 形式校验（与文件中的键顺序一致）
    pub fn verify_as_value(&self) -> Result<bool, BackupError> {
        let value =
            serde_json::to_value(self).map_err(|e| BackupError::Encoding(e.to_string()))?;
        Ok(verify_integrity(&value, &self.checksum))
    }

    /// 序列化为 2 空格缩进的 JSON 字节
    pub fn to_pretty_bytes(&self) -> Result<Vec<u8>, BackupError> {
        serde_json::to_vec_pretty(self).map_err(|e| BackupError::Encoding(e.to_string()))
    }
}

fn compute_checksum(
    metadata: &BackupMetadata,
    data: &ApplicationDataset,
) -> Result<String, BackupError> {
    digest(&EnvelopeBody { metadata, data })
}

/// 旧版平铺备份文件
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyBackupFile {
    pub filename: String,
    pub payload: ApplicationDataset,
}

impl LegacyBackupFile {
    /// 下载内容：2 空格缩进的 JSON 字节
    pub fn to_pretty_bytes(&self) -> Result<Vec<u8>, BackupError> {
        serde_json::to_vec_pretty(&self.payload).map_err(|e| BackupError::Encoding(e.to_string()))
    }
}

/// 生成旧版平铺备份（当前时间）
pub fn build_legacy_backup(
    full: &ApplicationDataset,
    user: &ActingUser,
    unscoped: UnscopedRolePolicy,
) -> LegacyBackupFile {
    build_legacy_backup_at(full, user, unscoped, Utc::now())
}

/// 生成旧版平铺备份（指定时间）
pub fn build_legacy_backup_at(
    full: &ApplicationDataset,
    user: &ActingUser,
    unscoped: UnscopedRolePolicy,
    now: DateTime<Utc>,
) -> LegacyBackupFile {
    let payload = scope_dataset_with_policy(full, user, unscoped);
    let filename = legacy_backup_filename(user, now);

    info!(
        "[BackupBuilder] 旧版备份已生成: file={}, collections={}, records={}",
        filename,
        payload.len(),
        payload.total_records()
    );
    LegacyBackupFile { filename, payload }
}

/// 备份文件名：`backup-<范围>-<名称>-<时间戳>.json`
pub fn legacy_backup_filename(user: &ActingUser, now: DateTime<Utc>) -> String {
    let ts = filename_timestamp(now);
    match &user.role {
        UserRole::AdminGeneral => format!("backup-global-{}.json", ts),
        UserRole::Diocese | UserRole::Archdiocese => format!(
            "backup-diocese-{}-{}.json",
            sanitize_entity_name(user.diocese_name.as_deref(), DIOCESE_NAME_FALLBACK),
            ts
        ),
        UserRole::Parish => format!(
            "backup-parish-{}-{}.json",
            sanitize_entity_name(user.parish_name.as_deref(), PARISH_NAME_FALLBACK),
            ts
        ),
        other => format!(
            "backup-{}-{}.json",
            sanitize_entity_name(Some(other.as_str()), "rol"),
            ts
        ),
    }
}

/// 连续的空白、路径分隔符和控制字符替换为单个 `_`；名称缺失或为空时使用占位
fn sanitize_entity_name(name: Option<&str>, fallback: &str) -> String {
    let Some(name) = name.filter(|n| !n.is_empty()) else {
        return fallback.to_string();
    };

    let mut sanitized = String::with_capacity(name.len());
    let mut in_separator = false;
    for ch in name.chars() {
        if ch.is_whitespace() || ch.is_control() || ch == '/' || ch == '\\' {
            if !in_separator {
                sanitized.push('_');
            }
            in_separator = true;
        } else {
            sanitized.push(ch);
            in_separator = false;
        }
    }
    sanitized
}

/// 生成通用备份信封（新 ID、当前时间）
pub fn build_universal_envelope(
    scoped: ApplicationDataset,
    app_version: &str,
) -> Result<BackupEnvelope, BackupError> {
    build_universal_envelope_at(scoped, app_version, Uuid::new_v4().to_string(), Utc::now())
}

/// 生成通用备份信封（指定 ID 与时间）
pub fn build_universal_envelope_at(
    scoped: ApplicationDataset,
    app_version: &str,
    id: String,
    now: DateTime<Utc>,
) -> Result<BackupEnvelope, BackupError> {
    let metadata = BackupMetadata {
        id,
        version_app: app_version.to_string(),
        created_at: iso_timestamp(now),
        total_registros: scoped.total_records(),
    };
    let checksum = compute_checksum(&metadata, &scoped)?;

    info!(
        "[BackupBuilder] 通用备份已生成: id={}, records={}, checksum={}",
        metadata.id, metadata.total_registros, checksum
    );
    Ok(BackupEnvelope {
        metadata,
        data: scoped,
        checksum,
    })
}
