//! 备份配置模块
//!
//! 提供备份设置的加载功能，支持：
//! - 应用版本号（写入 metadata.versionApp）
//! - 本地存储槽位键名与容量配额
//! - 完整性校验策略、未识别角色的导出范围策略
//! - 本地最多保留的备份数
//!
//! 来源优先级：默认值 < TOML 文件 < `ECCLESIA_BACKUP__*` 环境变量（支持 .env）。

use serde::{Deserialize, Serialize};
use std::path::Path;

/// 默认存储槽位键
pub const DEFAULT_STORAGE_KEY: &str = "universal_backups";

/// 环境变量前缀
const ENV_PREFIX: &str = "ECCLESIA_BACKUP";

/// 默认配置文件（不含扩展名）
const DEFAULT_CONFIG_FILE: &str = "config/backup";

/// 校验和不一致时的恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// 校验但只报告结果，由调用方决定是否继续
    #[default]
    Warn,
    /// 校验失败直接拒绝恢复
    Block,
    /// 不做完整性校验
    Skip,
}

/// 未识别角色（如 chancery）的导出范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnscopedRolePolicy {
    /// 导出空数据集
    #[default]
    Empty,
    /// 导出完整数据集
    Full,
}

/// 备份设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// 应用版本（写入 metadata.versionApp）
    pub app_version: String,

    /// 本地存储中保存备份列表的槽位键
    pub storage_key: String,

    /// 完整性校验策略
    pub integrity_policy: IntegrityPolicy,

    /// 未识别角色的导出范围
    pub unscoped_role_policy: UnscopedRolePolicy,

    /// 本地最多保留的备份数量（None 表示无限制）
    pub max_stored_backups: Option<usize>,

    /// 存储配额（字节，None 表示不限制，由底层存储自行报告）
    pub storage_quota_bytes: Option<u64>,

    /// 导出文件目录（None 表示由调用方指定）
    pub export_directory: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            integrity_policy: IntegrityPolicy::default(),
            unscoped_role_policy: UnscopedRolePolicy::default(),
            max_stored_backups: None,
            storage_quota_bytes: None,
            export_directory: None,
        }
    }
}

impl BackupSettings {
    /// 从 `.env`、默认配置文件和环境变量加载
    pub fn from_env_and_file() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let default_file = Path::new(DEFAULT_CONFIG_FILE).with_extension("toml");
        if default_file.exists() {
            Self::load(Some(&default_file))
        } else {
            Self::load(None)
        }
    }

    /// 从指定 TOML 文件（可选）和环境变量加载
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_from_sources(file, None)
    }

    /// `env` 为 `None` 时读取进程环境变量
    ///
    /// 环境变量一律按字符串读入，由 config 的反序列化按字段类型转换，
    /// 这样 `APP_VERSION=2.10` 仍是字符串 `"2.10"`。
    fn load_from_sources(
        file: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .source(env),
        );

        let loaded = builder.build()?;
        let settings: BackupSettings = loaded.try_deserialize()?;
        settings.validate()?;

        tracing::info!(
            "[BackupConfig] 配置已加载: version={}, key={}, integrity={:?}, unscoped={:?}, max={:?}, quota={:?}",
            settings.app_version,
            settings.storage_key,
            settings.integrity_policy,
            settings.unscoped_role_policy,
            settings.max_stored_backups,
            settings.storage_quota_bytes
        );
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.storage_key.trim().is_empty() {
            anyhow::bail!("storage_key 不能为空");
        }
        if self.max_stored_backups == Some(0) {
            anyhow::bail!("max_stored_backups 必须大于 0");
        }
        Ok(())
    }
}
