use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 单条实体记录（字段名 → 标量/字符串/日期值）
pub type Record = Map<String, Value>;

// 集合名常量：范围过滤与旧版校验依赖这些键
pub const USERS: &str = "users";
pub const PARISHES: &str = "parishes";
pub const VICARIATES: &str = "vicariates";
pub const DEANERIES: &str = "deaneries";
pub const SACRAMENTS: &str = "sacraments";
pub const CHANCELLERIES: &str = "chancelleries";
pub const DIOCESES: &str = "dioceses";

/// 应用数据集：集合名 → 记录序列
///
/// 保持插入顺序（serde_json `preserve_order`），校验和与导出文件依赖该顺序。
/// 集合值约定为数组；非数组值原样透传，计数时按 0 条处理。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationDataset(Map<String, Value>);

impl ApplicationDataset {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// 从已解析的 JSON 构造；根节点不是对象时返回 None
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn with_collection(mut self, name: &str, records: Vec<Value>) -> Self {
        self.insert_collection(name, records);
        self
    }

    pub fn insert_collection(&mut self, name: &str, records: Vec<Value>) {
        self.0.insert(name.to_string(), Value::Array(records));
    }

    /// 原样写入一个集合值（用于透传非数组内容）
    pub fn insert_raw(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// 取集合记录；集合不存在或不是数组时返回空切片
    pub fn records(&self, name: &str) -> &[Value] {
        match self.0.get(name) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 所有集合的记录总数（即 metadata.totalRegistros）
    pub fn total_records(&self) -> u64 {
        self.0
            .values()
            .map(|v| v.as_array().map_or(0, |items| items.len() as u64))
            .sum()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// 用户角色
///
/// 未识别的角色字符串保存在 `Other` 中，序列化时原样写回。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UserRole {
    AdminGeneral,
    Diocese,
    Archdiocese,
    Parish,
    Chancery,
    Other(String),
}

impl UserRole {
    pub fn as_str(&self) -> &str {
        match self {
            UserRole::AdminGeneral => "admin_general",
            UserRole::Diocese => "diocese",
            UserRole::Archdiocese => "archdiocese",
            UserRole::Parish => "parish",
            UserRole::Chancery => "chancery",
            UserRole::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for UserRole {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "admin_general" => UserRole::AdminGeneral,
            "diocese" => UserRole::Diocese,
            "archdiocese" => UserRole::Archdiocese,
            "parish" => UserRole::Parish,
            "chancery" => UserRole::Chancery,
            _ => UserRole::Other(raw),
        }
    }
}

impl From<&str> for UserRole {
    fn from(raw: &str) -> Self {
        UserRole::from(raw.to_string())
    }
}

impl From<UserRole> for String {
    fn from(role: UserRole) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 当前操作用户（由认证层提供，本模块只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActingUser {
    pub role: UserRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diocese_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parish_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diocese_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parish_name: Option<String>,
}

impl ActingUser {
    pub fn new(role: impl Into<UserRole>) -> Self {
        Self {
            role: role.into(),
            diocese_id: None,
            parish_id: None,
            diocese_name: None,
            parish_name: None,
        }
    }

    pub fn admin() -> Self {
        Self::new(UserRole::AdminGeneral)
    }

    pub fn diocese(diocese_id: impl Into<String>, diocese_name: Option<&str>) -> Self {
        Self {
            diocese_id: Some(diocese_id.into()),
            diocese_name: diocese_name.map(str::to_string),
            ..Self::new(UserRole::Diocese)
        }
    }

    pub fn parish(parish_id: impl Into<String>, parish_name: Option<&str>) -> Self {
        Self {
            parish_id: Some(parish_id.into()),
            parish_name: parish_name.map(str::to_string),
            ..Self::new(UserRole::Parish)
        }
    }
}

// 结构化错误处理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppErrorType {
    Validation,
    Integrity,
    Duplicate,
    QuotaExceeded,
    Storage,
    FileSystem,
    NotFound,
    Configuration,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Storage, message)
    }

    pub fn file_system(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::FileSystem, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::validation(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::validation(message.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::unknown(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::validation(format!("JSON序列化错误: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::file_system(format!("文件系统错误: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_roundtrip_keeps_unknown_roles() {
        let user: ActingUser = serde_json::from_value(json!({
            "role": "notary",
            "dioceseId": "D1"
        }))
        .unwrap();
        assert_eq!(user.role, UserRole::Other("notary".to_string()));

        let back = serde_json::to_value(&user).unwrap();
        assert_eq!(back["role"], "notary");
        assert_eq!(back["dioceseId"], "D1");
        assert!(back.get("parishId").is_none());
    }

    #[test]
    fn test_known_roles_parse() {
        assert_eq!(UserRole::from("admin_general"), UserRole::AdminGeneral);
        assert_eq!(UserRole::from("archdiocese"), UserRole::Archdiocese);
        assert_eq!(UserRole::from("chancery"), UserRole::Chancery);
        assert_eq!(UserRole::Parish.to_string(), "parish");
    }

    #[test]
    fn test_total_records_ignores_non_arrays() {
        let mut dataset = ApplicationDataset::new()
            .with_collection(USERS, vec![json!({"id": "u1"}), json!({"id": "u2"})])
            .with_collection(PARISHES, vec![json!({"id": "p1"})]);
        dataset.insert_raw("settings", json!({"theme": "dark"}));

        assert_eq!(dataset.total_records(), 3);
        assert_eq!(dataset.records("settings").len(), 0);
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn test_dataset_keeps_insertion_order() {
        let dataset = ApplicationDataset::new()
            .with_collection(SACRAMENTS, vec![])
            .with_collection(USERS, vec![])
            .with_collection(DIOCESES, vec![]);
        let names: Vec<&String> = dataset.collection_names().collect();
        assert_eq!(names, vec![SACRAMENTS, USERS, DIOCESES]);
    }
}
