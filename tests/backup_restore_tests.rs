//! 备份/恢复端到端测试

use assert_matches::assert_matches;
use ecclesia_backup_lib::backup_builder::{
    build_legacy_backup, build_universal_envelope, legacy_backup_filename,
};
use ecclesia_backup_lib::backup_export::{DirectoryExportSink, ExportSink};
use ecclesia_backup_lib::backup_store::{BackupStore, FileKeyValueStore, MemoryKeyValueStore};
use ecclesia_backup_lib::backup_validator::{validate_envelope, verify_integrity};
use ecclesia_backup_lib::models::{DEANERIES, PARISHES, SACRAMENTS, USERS, VICARIATES};
use ecclesia_backup_lib::scope_filter::scope_dataset;
use ecclesia_backup_lib::{
    ActingUser, ApplicationDataset, BackupError, BackupService, BackupSettings, DataImporter,
    IntegrityPolicy, IntegrityStatus, RestoreMode, UnscopedRolePolicy, ValidatedPayload,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn barranquilla_dataset() -> ApplicationDataset {
    ApplicationDataset::new()
        .with_collection(
            PARISHES,
            vec![json!({"id": "p1", "dioceseId": "D1", "name": "San Juan"})],
        )
        .with_collection(USERS, vec![json!({"id": "u1", "dioceseId": "D1"})])
        .with_collection(SACRAMENTS, vec![json!({"id": "s1", "dioceseId": "D1"})])
}

fn barranquilla_user() -> ActingUser {
    ActingUser::diocese("D1", Some("Barranquilla"))
}

#[derive(Default)]
struct CapturingImporter {
    imported: Vec<ApplicationDataset>,
}

impl DataImporter for CapturingImporter {
    fn import_full_data(&mut self, payload: &ApplicationDataset) -> anyhow::Result<()> {
        self.imported.push(payload.clone());
        Ok(())
    }
}

/// 文件名格式：backup-diocese-Barranquilla-YYYY-MM-DDTHH-MM-SS-mmmZ.json
fn assert_diocese_filename(filename: &str) {
    let ts = filename
        .strip_prefix("backup-diocese-Barranquilla-")
        .and_then(|rest| rest.strip_suffix(".json"))
        .unwrap_or_else(|| panic!("unexpected filename: {filename}"));
    assert_eq!(ts.len(), "2026-10-18T09-05-03-120Z".len(), "{ts}");
    assert!(ts.ends_with('Z'));
    assert!(!ts.contains(':') && !ts.contains('.'));
}

#[test]
fn test_end_to_end_diocese_legacy_backup() {
    let file = build_legacy_backup(
        &barranquilla_dataset(),
        &barranquilla_user(),
        UnscopedRolePolicy::Empty,
    );

    assert_diocese_filename(&file.filename);
    assert_eq!(file.payload.records(PARISHES).len(), 1);
    assert_eq!(file.payload.records(USERS).len(), 1);
    assert_eq!(file.payload.records(SACRAMENTS).len(), 1);
    assert_eq!(file.payload.total_records(), 3);
}

#[test]
fn test_legacy_backup_export_and_restore() {
    let temp_dir = TempDir::new().unwrap();
    let service = BackupService::new(BackupSettings::default(), MemoryKeyValueStore::new());
    let sink = DirectoryExportSink::new(temp_dir.path());

    let receipt = service
        .generate_backup(&barranquilla_dataset(), &barranquilla_user(), &sink)
        .unwrap();
    assert_diocese_filename(&receipt.filename);

    let raw = std::fs::read_to_string(&receipt.path).unwrap();
    assert!(raw.contains("\n  \"parishes\": ["), "2 空格缩进");

    let payload = service.validate_backup(&raw, RestoreMode::Legacy).unwrap();
    let mut importer = CapturingImporter::default();
    let report = service.restore_backup(&payload, &mut importer).unwrap();

    assert_eq!(report.total_records, 3);
    assert_eq!(importer.imported, vec![barranquilla_dataset()]);
}

#[test]
fn test_diocese_scope_with_deanery_join() {
    let full = ApplicationDataset::new()
        .with_collection(
            PARISHES,
            vec![
                json!({"id": "p1", "dioceseId": "D1"}),
                json!({"id": "p2", "dioceseId": "D1"}),
                json!({"id": "p3", "dioceseId": "D2"}),
            ],
        )
        .with_collection(
            VICARIATES,
            vec![
                json!({"id": "v1", "dioceseId": "D1"}),
                json!({"id": "v2", "dioceseId": "D2"}),
            ],
        )
        .with_collection(
            DEANERIES,
            vec![
                json!({"id": "dn1", "vicariateId": "v1"}),
                json!({"id": "dn2", "vicariateId": "v2"}),
            ],
        );

    let scoped = scope_dataset(&full, &ActingUser::diocese("D1", None));
    let parish_ids: Vec<&Value> = scoped.records(PARISHES).iter().map(|p| &p["id"]).collect();
    assert_eq!(parish_ids, vec!["p1", "p2"]);

    let deanery_ids: Vec<&Value> = scoped.records(DEANERIES).iter().map(|d| &d["id"]).collect();
    assert_eq!(deanery_ids, vec!["dn1"]);
}

#[test]
fn test_universal_checksum_roundtrip_and_stale_checksum() {
    let envelope = build_universal_envelope(barranquilla_dataset(), "3.2.1").unwrap();
    let mut value = serde_json::to_value(&envelope).unwrap();

    assert!(validate_envelope(&value).is_valid);
    assert!(verify_integrity(&value, &envelope.checksum));

    value["data"]["users"][0]["dioceseId"] = json!("D9");
    assert!(!verify_integrity(&value, &envelope.checksum));
}

#[test]
fn test_universal_backup_store_and_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let kv = Arc::new(FileKeyValueStore::new(temp_dir.path().join("storage")));
    let service = BackupService::new(BackupSettings::default(), Arc::clone(&kv));

    let envelope = service
        .save_universal_backup(&barranquilla_dataset(), &ActingUser::admin())
        .unwrap();

    // 同一底层存储上的另一个实例能读到
    let other = BackupStore::new(Arc::clone(&kv));
    assert_eq!(other.get_by_id(&envelope.metadata.id), Some(envelope.clone()));

    let sink = DirectoryExportSink::new(temp_dir.path().join("exports"));
    let receipt = service
        .export_stored_backup(&envelope.metadata.id, &sink)
        .unwrap();
    let raw = std::fs::read_to_string(&receipt.path).unwrap();

    let payload = service.validate_backup(&raw, RestoreMode::Universal).unwrap();
    assert_matches!(
        &payload,
        ValidatedPayload::Universal { integrity: IntegrityStatus::Verified, .. }
    );
    assert_eq!(payload.dataset(), &envelope.data);

    // 重新上传同一备份：ID 重复
    let err = service.keep_uploaded_backup(&payload).unwrap_err();
    assert!(err.message.contains(&envelope.metadata.id));

    assert!(service.delete_backup(&envelope.metadata.id).success);
    assert!(service.keep_uploaded_backup(&payload).is_ok());
}

#[test]
fn test_tampered_universal_file_under_each_policy() {
    let temp_dir = TempDir::new().unwrap();
    let envelope = build_universal_envelope(barranquilla_dataset(), "3.2.1").unwrap();
    let tampered = String::from_utf8(envelope.to_pretty_bytes().unwrap())
        .unwrap()
        .replace("San Juan", "San Roque");
    let receipt = DirectoryExportSink::new(temp_dir.path())
        .deliver("tampered.json", tampered.as_bytes())
        .unwrap();
    let raw = std::fs::read_to_string(&receipt.path).unwrap();

    let warn = BackupService::new(BackupSettings::default(), MemoryKeyValueStore::new());
    let payload = warn.validate_backup(&raw, RestoreMode::Universal).unwrap();
    assert_matches!(payload.integrity(), Some(IntegrityStatus::Mismatch { .. }));

    let block = BackupService::new(
        BackupSettings {
            integrity_policy: IntegrityPolicy::Block,
            ..BackupSettings::default()
        },
        MemoryKeyValueStore::new(),
    );
    let err = block
        .validate_backup(&raw, RestoreMode::Universal)
        .unwrap_err();
    assert!(err.details.is_some());

    let direct = ecclesia_backup_lib::restore::restore(
        &raw,
        RestoreMode::Universal,
        IntegrityPolicy::Block,
    );
    assert_matches!(direct, Err(BackupError::IntegrityMismatch { .. }));
}

#[test]
fn test_chancery_backup_follows_policy() {
    let user = ActingUser::new("chancery");
    let empty = BackupService::new(BackupSettings::default(), MemoryKeyValueStore::new());
    let (filename, bytes) = empty
        .generate_backup_bytes(&barranquilla_dataset(), &user)
        .unwrap();
    assert!(filename.starts_with("backup-chancery-"));
    assert_eq!(bytes, b"{}");

    let full = BackupService::new(
        BackupSettings {
            unscoped_role_policy: UnscopedRolePolicy::Full,
            ..BackupSettings::default()
        },
        MemoryKeyValueStore::new(),
    );
    let envelope = full
        .create_universal_backup(&barranquilla_dataset(), &user)
        .unwrap();
    assert_eq!(envelope.metadata.total_registros, 3);
}

#[test]
fn test_filename_uses_parish_name() {
    let now = chrono::Utc::now();
    let name = legacy_backup_filename(&ActingUser::parish("p1", Some("San Juan Bautista")), now);
    assert!(name.starts_with("backup-parish-San_Juan_Bautista-"));
}

#[test]
fn test_entity_name_with_slash_exports() {
    let temp_dir = TempDir::new().unwrap();
    let sink = DirectoryExportSink::new(temp_dir.path());
    let service = BackupService::new(BackupSettings::default(), MemoryKeyValueStore::new());
    let user = ActingUser::parish("p1", Some("San José / Centro"));

    let receipt = service
        .generate_backup(&barranquilla_dataset(), &user, &sink)
        .unwrap();
    assert!(receipt.filename.starts_with("backup-parish-San_José_Centro-"));
    assert_eq!(receipt.path.parent(), Some(temp_dir.path()));
}
