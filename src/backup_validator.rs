//! 备份结构校验
//!
//! - 通用备份信封：`metadata` + `data` + `checksum`，metadata 必填四个字段
//! - 旧版平铺备份：至少包含 `users` / `sacraments` / `parishes` 之一
//! - 完整性校验：重算去掉 `checksum` 后的信封摘要并比较

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backup_common::{digest_value, BackupError};
use crate::models::{PARISHES, SACRAMENTS, USERS};

/// 根节点不是对象时报告的键
pub const ROOT_OBJECT_KEY: &str = "ROOT_OBJECT";

/// 信封顶层必填键
pub const ENVELOPE_REQUIRED_KEYS: &[&str] = &["metadata", "data", "checksum"];

/// metadata 必填字段
pub const METADATA_REQUIRED_FIELDS: &[&str] = &["id", "versionApp", "createdAt", "totalRegistros"];

/// 旧版备份至少要包含的集合之一
pub const LEGACY_REQUIRED_COLLECTIONS: &[&str] = &[USERS, SACRAMENTS, PARISHES];

const CHECKSUM_KEY: &str = "checksum";

/// 信封结构校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeValidation {
    pub is_valid: bool,
    pub missing_keys: Vec<String>,
}

impl EnvelopeValidation {
    fn from_missing(missing_keys: Vec<String>) -> Self {
        Self {
            is_valid: missing_keys.is_empty(),
            missing_keys,
        }
    }

    /// 转为错误：结构无效时返回 `BackupError::MissingKeys`
    pub fn into_result(self) -> Result<(), BackupError> {
        if self.is_valid {
            Ok(())
        } else {
            Err(BackupError::MissingKeys(self.missing_keys))
        }
    }
}

/// 校验通用备份信封的结构
///
/// 顶层缺键时只报告顶层缺键，不在同一次调用中继续检查 metadata 子字段。
pub fn validate_envelope(candidate: &Value) -> EnvelopeValidation {
    let Some(root) = candidate.as_object() else {
        return EnvelopeValidation::from_missing(vec![ROOT_OBJECT_KEY.to_string()]);
    };

    let missing_top: Vec<String> = ENVELOPE_REQUIRED_KEYS
        .iter()
        .filter(|key| !root.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    if !missing_top.is_empty() {
        return EnvelopeValidation::from_missing(missing_top);
    }

    let metadata = root.get("metadata").and_then(Value::as_object);
    let missing_meta = METADATA_REQUIRED_FIELDS
        .iter()
        .filter(|field| metadata.map_or(true, |meta| !meta.contains_key(**field)))
        .map(|field| format!("metadata.{}", field))
        .collect();
    EnvelopeValidation::from_missing(missing_meta)
}

/// 校验旧版平铺备份
///
/// # Errors
/// 非对象输入，或不含 `users` / `sacraments` / `parishes` 任何一个键时返回格式错误
pub fn validate_legacy_flat(candidate: &Value) -> Result<(), BackupError> {
    let Some(root) = candidate.as_object() else {
        return Err(BackupError::Format(
            "旧版备份必须是 JSON 对象".to_string(),
        ));
    };

    if LEGACY_REQUIRED_COLLECTIONS
        .iter()
        .any(|name| root.contains_key(*name))
    {
        Ok(())
    } else {
        Err(BackupError::Format(format!(
            "旧版备份缺少必要数据，至少需要包含以下集合之一: {}",
            LEGACY_REQUIRED_COLLECTIONS.join(", ")
        )))
    }
}

/// 去掉 `checksum` 键后的信封（保持其余键顺序）
pub fn strip_checksum(envelope: &Map<String, Value>) -> Value {
    let rest: Map<String, Value> = envelope
        .iter()
        .filter(|(key, _)| key.as_str() != CHECKSUM_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(rest)
}

/// 重新计算信封摘要（不含 `checksum` 字段）
pub fn compute_envelope_checksum(envelope: &Value) -> String {
    match envelope.as_object() {
        Some(map) => digest_value(&strip_checksum(map)),
        None => digest_value(envelope),
    }
}

/// 校验信封完整性：重算摘要并与声明的校验和比较
pub fn verify_integrity(envelope: &Value, claimed_checksum: &str) -> bool {
    compute_envelope_checksum(envelope) == claimed_checksum
}
