//! 恢复流程
//!
//! 上传文本 → JSON 解析 → 结构校验 → （可选）完整性校验 → 交给外部导入方。
//!
//! 本模块从不修改当前数据；覆盖式导入完全由 [`DataImporter`] 负责，
//! 且应在调用方取得用户确认之后才调用 [`apply_restore`]。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

use crate::backup_builder::BackupEnvelope;
use crate::backup_common::BackupError;
use crate::backup_config::IntegrityPolicy;
use crate::backup_validator::{compute_envelope_checksum, validate_envelope, validate_legacy_flat};
use crate::models::ApplicationDataset;

/// 恢复文件格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// 旧版平铺备份
    Legacy,
    /// 通用备份信封
    Universal,
}

/// 完整性校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntegrityStatus {
    Verified,
    Mismatch { expected: String, actual: String },
    NotChecked,
}

impl IntegrityStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, IntegrityStatus::Verified)
    }
}

/// 通过校验、可以交给导入方的数据
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedPayload {
    Legacy(ApplicationDataset),
    Universal {
        envelope: BackupEnvelope,
        /// 上传时的原始信封，校验和按它计算
        raw: Value,
        integrity: IntegrityStatus,
    },
}

impl ValidatedPayload {
    pub fn mode(&self) -> RestoreMode {
        match self {
            ValidatedPayload::Legacy(_) => RestoreMode::Legacy,
            ValidatedPayload::Universal { .. } => RestoreMode::Universal,
        }
    }

    pub fn dataset(&self) -> &ApplicationDataset {
        match self {
            ValidatedPayload::Legacy(data) => data,
            ValidatedPayload::Universal { envelope, .. } => &envelope.data,
        }
    }

    /// 通用备份的原始 JSON
    pub fn raw_envelope(&self) -> Option<&Value> {
        match self {
            ValidatedPayload::Legacy(_) => None,
            ValidatedPayload::Universal { raw, .. } => Some(raw),
        }
    }

    /// 旧版备份没有完整性信息
    pub fn integrity(&self) -> Option<&IntegrityStatus> {
        match self {
            ValidatedPayload::Legacy(_) => None,
            ValidatedPayload::Universal { integrity, .. } => Some(integrity),
        }
    }
}

/// 恢复结果摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub mode: RestoreMode,
    pub collections: usize,
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityStatus>,
}

/// 外部全量导入方（覆盖当前全部数据）
pub trait DataImporter {
    fn import_full_data(&mut self, payload: &ApplicationDataset) -> anyhow::Result<()>;
}

/// 解析并校验上传的备份文本
///
/// # Errors
/// - JSON 无法解析、结构缺键、旧版备份缺少必要集合：格式错误
/// - 策略为 [`IntegrityPolicy::Block`] 且校验和不一致：`IntegrityMismatch`
pub fn restore(
    raw: &str,
    mode: RestoreMode,
    policy: IntegrityPolicy,
) -> Result<ValidatedPayload, BackupError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| BackupError::Format(format!("invalid JSON: {}", e)))?;

    match mode {
        RestoreMode::Legacy => {
            validate_legacy_flat(&value)?;
            let dataset = ApplicationDataset::from_value(value)
                .ok_or_else(|| BackupError::Format("旧版备份必须是 JSON 对象".to_string()))?;
            info!(
                "[Restore] 旧版备份校验通过: collections={}, records={}",
                dataset.len(),
                dataset.total_records()
            );
            Ok(ValidatedPayload::Legacy(dataset))
        }
        RestoreMode::Universal => validate_universal(value, policy),
    }
}

/// 校验已解析的通用备份信封
///
/// 完整性按原始 JSON 计算（保留文件中的键顺序和未知字段），本地存储中的
/// 备份恢复时也走这里。
pub fn validate_universal(
    value: Value,
    policy: IntegrityPolicy,
) -> Result<ValidatedPayload, BackupError> {
    let validation = validate_envelope(&value);
    if !validation.is_valid {
        warn!("[Restore] 备份结构无效，缺少: {:?}", validation.missing_keys);
        return Err(BackupError::MissingKeys(validation.missing_keys));
    }

    let integrity = check_integrity(&value, policy);
    if let IntegrityStatus::Mismatch { expected, actual } = &integrity {
        warn!(
            "[Restore] 校验和不一致: expected={}, actual={}, policy={:?}",
            expected, actual, policy
        );
        if policy == IntegrityPolicy::Block {
            return Err(BackupError::IntegrityMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
    }

    let envelope = BackupEnvelope::from_value(value.clone())?;
    info!(
        "[Restore] 通用备份校验通过: id={}, records={}, integrity={:?}",
        envelope.metadata.id, envelope.metadata.total_registros, integrity
    );
    Ok(ValidatedPayload::Universal {
        envelope,
        raw: value,
        integrity,
    })
}

/// 从本地文件读取并校验
pub fn restore_file(
    path: &Path,
    mode: RestoreMode,
    policy: IntegrityPolicy,
) -> Result<ValidatedPayload, BackupError> {
    let raw = std::fs::read_to_string(path)?;
    restore(&raw, mode, policy)
}

fn check_integrity(envelope: &Value, policy: IntegrityPolicy) -> IntegrityStatus {
    if policy == IntegrityPolicy::Skip {
        return IntegrityStatus::NotChecked;
    }

    let expected = match envelope.get("checksum") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let actual = compute_envelope_checksum(envelope);
    if actual == expected {
        IntegrityStatus::Verified
    } else {
        IntegrityStatus::Mismatch { expected, actual }
    }
}

/// 把校验通过的数据交给外部导入方
///
/// 调用方必须事先取得用户确认：导入会覆盖当前全部数据。
pub fn apply_restore(
    payload: &ValidatedPayload,
    importer: &mut dyn DataImporter,
) -> Result<RestoreReport, BackupError> {
    let dataset = payload.dataset();
    importer
        .import_full_data(dataset)
        .map_err(|e| BackupError::Import(e.to_string()))?;

    let report = RestoreReport {
        mode: payload.mode(),
        collections: dataset.len(),
        total_records: dataset.total_records(),
        integrity: payload.integrity().cloned(),
    };
    info!(
        "[Restore] 数据已交付导入: mode={:?}, collections={}, records={}",
        report.mode, report.collections, report.total_records
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_builder::build_universal_envelope_at;
    use crate::models::{PARISHES, USERS};
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn envelope_text() -> String {
        let data = ApplicationDataset::new()
            .with_collection(USERS, vec![json!({"id": "u1"})])
            .with_collection(PARISHES, vec![json!({"id": "p1", "name": "San Juan"})]);
        let envelope = build_universal_envelope_at(
            data,
            "1.0.0",
            "b-1".to_string(),
            Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap(),
        )
        .unwrap();
        String::from_utf8(envelope.to_pretty_bytes().unwrap()).unwrap()
    }

    fn tampered_text() -> String {
        envelope_text().replace("San Juan", "San Pablo")
    }

    #[derive(Default)]
    struct RecordingImporter {
        received: Option<ApplicationDataset>,
    }

    impl DataImporter for RecordingImporter {
        fn import_full_data(&mut self, payload: &ApplicationDataset) -> anyhow::Result<()> {
            self.received = Some(payload.clone());
            Ok(())
        }
    }

    struct RejectingImporter;

    impl DataImporter for RejectingImporter {
        fn import_full_data(&mut self, _payload: &ApplicationDataset) -> anyhow::Result<()> {
            anyhow::bail!("database is read-only")
        }
    }

    #[test]
    fn test_invalid_json_is_format_error() {
        let result = restore("{oops", RestoreMode::Legacy, IntegrityPolicy::Warn);
        assert_matches!(result, Err(BackupError::Format(msg)) if msg.contains("invalid JSON"));
    }

    #[test]
    fn test_legacy_restore() {
        let payload = restore(r#"{"users": []}"#, RestoreMode::Legacy, IntegrityPolicy::Warn)
            .unwrap();
        assert_eq!(payload.mode(), RestoreMode::Legacy);
        assert!(payload.integrity().is_none());

        let result = restore(r#"{"foo": []}"#, RestoreMode::Legacy, IntegrityPolicy::Warn);
        assert_matches!(result, Err(BackupError::Format(_)));
    }

    #[test]
    fn test_universal_restore_verified() {
        let payload =
            restore(&envelope_text(), RestoreMode::Universal, IntegrityPolicy::Warn).unwrap();
        assert_eq!(payload.integrity(), Some(&IntegrityStatus::Verified));
        assert_eq!(payload.dataset().total_records(), 2);
    }

    #[test]
    fn test_universal_restore_missing_keys() {
        let result = restore(r#"{"data": {}}"#, RestoreMode::Universal, IntegrityPolicy::Warn);
        assert_matches!(
            result,
            Err(BackupError::MissingKeys(keys)) if keys == vec!["metadata", "checksum"]
        );
    }

    #[test]
    fn test_mismatch_is_reported_under_warn() {
        let payload =
            restore(&tampered_text(), RestoreMode::Universal, IntegrityPolicy::Warn).unwrap();
        assert_matches!(payload.integrity(), Some(IntegrityStatus::Mismatch { .. }));
    }

    #[test]
    fn test_mismatch_blocks_under_block() {
        let result = restore(&tampered_text(), RestoreMode::Universal, IntegrityPolicy::Block);
        assert_matches!(result, Err(BackupError::IntegrityMismatch { .. }));
    }

    #[test]
    fn test_skip_policy_does_not_check() {
        let payload =
            restore(&tampered_text(), RestoreMode::Universal, IntegrityPolicy::Skip).unwrap();
        assert_eq!(payload.integrity(), Some(&IntegrityStatus::NotChecked));
    }

    #[test]
    fn test_foreign_key_order_and_extra_metadata_verify() {
        let body = json!({
            "metadata": {
                "id": "ext-1",
                "createdAt": "2026-10-18T09:00:00.000Z",
                "versionApp": "0.9.0",
                "totalRegistros": 1,
                "scope": "diocese"
            },
            "data": {"users": [{"id": "u1"}]}
        });
        let mut raw = body.clone();
        raw["checksum"] = json!(crate::backup_common::digest_value(&body));

        let payload = validate_universal(raw.clone(), IntegrityPolicy::Block).unwrap();
        assert_eq!(payload.integrity(), Some(&IntegrityStatus::Verified));
        assert_eq!(payload.raw_envelope(), Some(&raw));
    }

    #[test]
    fn test_apply_restore_hands_off_dataset() {
        let payload =
            restore(&envelope_text(), RestoreMode::Universal, IntegrityPolicy::Warn).unwrap();
        let mut importer = RecordingImporter::default();

        let report = apply_restore(&payload, &mut importer).unwrap();
        assert_eq!(report.mode, RestoreMode::Universal);
        assert_eq!(report.total_records, 2);
        assert_eq!(importer.received.as_ref(), Some(payload.dataset()));
    }

    #[test]
    fn test_apply_restore_surfaces_import_failure() {
        let payload = restore(r#"{"parishes": []}"#, RestoreMode::Legacy, IntegrityPolicy::Warn)
            .unwrap();
        let result = apply_restore(&payload, &mut RejectingImporter);
        assert_matches!(result, Err(BackupError::Import(msg)) if msg.contains("read-only"));
    }
}
