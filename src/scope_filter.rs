//! 按角色裁剪可导出的数据范围
//!
//! | 角色                    | users      | parishes   | vicariates | deaneries        | sacraments |
//! |-------------------------|------------|------------|------------|------------------|------------|
//! | admin_general           | 全部       | 全部       | 全部       | 全部             | 全部       |
//! | diocese / archdiocese   | dioceseId  | dioceseId  | dioceseId  | 所属分区的教区   | dioceseId  |
//! | parish                  | parishId   | id         | 透传       | 透传             | parishId   |
//!
//! 表中未列出的集合一律透传。其余角色由 [`UnscopedRolePolicy`] 决定。
//! 纯函数，不产生副作用，不返回错误。

use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::backup_config::UnscopedRolePolicy;
use crate::models::{
    ActingUser, ApplicationDataset, UserRole, DEANERIES, PARISHES, SACRAMENTS, USERS, VICARIATES,
};

const DIOCESE_ID: &str = "dioceseId";
const PARISH_ID: &str = "parishId";
const RECORD_ID: &str = "id";

/// 分区（deanery）指向所属代牧区的外键，两种写法都存在
const VICARIATE_REFS: &[&str] = &["vicariateId", "vicaryId"];

/// 使用默认策略（未识别角色导出空数据集）裁剪数据
pub fn scope_dataset(full: &ApplicationDataset, user: &ActingUser) -> ApplicationDataset {
    scope_dataset_with_policy(full, user, UnscopedRolePolicy::default())
}

/// 按角色裁剪数据
pub fn scope_dataset_with_policy(
    full: &ApplicationDataset,
    user: &ActingUser,
    unscoped: UnscopedRolePolicy,
) -> ApplicationDataset {
    let scoped = match &user.role {
        UserRole::AdminGeneral => full.clone(),
        UserRole::Diocese | UserRole::Archdiocese => {
            scope_for_diocese(full, user.diocese_id.as_deref())
        }
        UserRole::Parish => scope_for_parish(full, user.parish_id.as_deref()),
        other => {
            warn!(
                "[ScopeFilter] 角色 {} 没有专门的导出范围规则，按策略 {:?} 处理",
                other, unscoped
            );
            match unscoped {
                UnscopedRolePolicy::Empty => ApplicationDataset::new(),
                UnscopedRolePolicy::Full => full.clone(),
            }
        }
    };

    debug!(
        "[ScopeFilter] role={} collections={} records={}/{}",
        user.role,
        scoped.len(),
        scoped.total_records(),
        full.total_records()
    );
    scoped
}

fn scope_for_diocese(full: &ApplicationDataset, diocese_id: Option<&str>) -> ApplicationDataset {
    if diocese_id.is_none() {
        warn!("[ScopeFilter] 教区用户缺少 dioceseId，受限集合将为空");
    }

    // 用未过滤的 vicariates 建立归属索引
    let owned_vicariates: HashSet<String> = full
        .records(VICARIATES)
        .iter()
        .filter(|v| field_matches(v, DIOCESE_ID, diocese_id))
        .filter_map(|v| v.get(RECORD_ID).and_then(id_string))
        .collect();

    map_collections(full, |name, records| match name {
        USERS | PARISHES | VICARIATES | SACRAMENTS => Some(retain(records, |r| {
            field_matches(r, DIOCESE_ID, diocese_id)
        })),
        DEANERIES => Some(retain(records, |r| {
            VICARIATE_REFS.iter().any(|key| {
                r.get(*key)
                    .and_then(id_string)
                    .is_some_and(|id| owned_vicariates.contains(&id))
            })
        })),
        _ => None,
    })
}

fn scope_for_parish(full: &ApplicationDataset, parish_id: Option<&str>) -> ApplicationDataset {
    if parish_id.is_none() {
        warn!("[ScopeFilter] 堂区用户缺少 parishId，受限集合将为空");
    }

    map_collections(full, |name, records| match name {
        USERS | SACRAMENTS => Some(retain(records, |r| field_matches(r, PARISH_ID, parish_id))),
        PARISHES => Some(
            records
                .iter()
                .find(|r| field_matches(r, RECORD_ID, parish_id))
                .cloned()
                .into_iter()
                .collect(),
        ),
        _ => None,
    })
}

/// 逐集合应用过滤；`filter` 返回 None 表示该集合原样透传
fn map_collections<F>(full: &ApplicationDataset, filter: F) -> ApplicationDataset
where
    F: Fn(&str, &[Value]) -> Option<Vec<Value>>,
{
    let mut scoped = ApplicationDataset::new();
    for (name, value) in full.iter() {
        match value.as_array() {
            Some(records) => match filter(name.as_str(), records) {
                Some(kept) => scoped.insert_collection(name, kept),
                None => scoped.insert_raw(name, value.clone()),
            },
            None => scoped.insert_raw(name, value.clone()),
        }
    }
    scoped
}

fn retain<P>(records: &[Value], keep: P) -> Vec<Value>
where
    P: Fn(&Value) -> bool,
{
    records.iter().filter(|r| keep(r)).cloned().collect()
}

/// 记录字段是否等于期望的标识；期望值缺失时不匹配任何记录
fn field_matches(record: &Value, field: &str, expected: Option<&str>) -> bool {
    match (expected, record.get(field).and_then(id_string)) {
        (Some(expected), Some(actual)) => actual == expected,
        _ => false,
    }
}

/// 标识可能是字符串或整数
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
