//! # Ecclesia 备份核心
//!
//! 教区/堂区档案与圣事登记的分级备份、恢复与完整性校验。
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │ ActingUser   │──▶│ scope_filter │──▶│ backup_builder │──▶│ backup_export│ (文件)
//! │ Dataset      │   │ (角色裁剪)    │   │ (信封/校验和)   │──▶│ backup_store │ (本地存储)
//! └──────────────┘   └──────────────┘   └────────────────┘   └──────────────┘
//!
//! 上传文本 ──▶ restore (解析 → backup_validator → 完整性) ──▶ DataImporter
//! ```
//!
//! UI 层通过 [`commands::BackupService`] 调用；认证、界面和数据导入本身不在本 crate 内。

pub mod backup_builder;
pub mod backup_common;
pub mod backup_config;
pub mod backup_export;
pub mod backup_store;
pub mod backup_validator;
pub mod commands;
pub mod models;
pub mod restore;
pub mod scope_filter;

pub use backup_builder::{BackupEnvelope, BackupMetadata, LegacyBackupFile};
pub use backup_common::BackupError;
pub use backup_config::{BackupSettings, IntegrityPolicy, UnscopedRolePolicy};
pub use commands::{BackupService, DatasetProvider};
pub use models::{ActingUser, AppError, ApplicationDataset, UserRole};
pub use restore::{DataImporter, IntegrityStatus, RestoreMode, ValidatedPayload};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 初始化 tracing 日志（默认 INFO，可用 `RUST_LOG` 覆盖）
///
/// 重复调用是安全的：已存在全局订阅者时直接返回。
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already initialized");
    }
}
