//! 配置模块，负责加载JSON配置文件

use crate::predicate::IndeterminatePolicy;
use crate::qc::ReopenPolicy;
use crate::sql_compiler::SqlDialect;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {0}")]
    NotFound(PathBuf),
    #[error("无法读取配置文件 {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("无法解析JSON配置文件 {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// 表映射配置结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMappingConfig {
    /// 表单 ID 到数据库表名的映射
    #[serde(flatten)]
    pub mappings: HashMap<String, String>,
}

impl TableMappingConfig {
    /// 获取表单对应的表名，如果不存在则返回小写的表单 ID
    pub fn get_table_name(&self, form_id: &str) -> String {
        self.mappings
            .get(form_id)
            .cloned()
            .unwrap_or_else(|| form_id.to_lowercase())
    }
}

/// 引擎配置，所有字段都有默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 生成 SQL 使用的方言
    pub dialect: SqlDialect,
    /// 受试者标识列
    pub subject_column: String,
    /// 访视序号列，决定 previous / first 的顺序
    pub visit_column: String,
    pub table_mapping: TableMappingConfig,
    /// 已关闭的违规再次触发时是否重新打开
    pub reopen_policy: ReopenPolicy,
    /// 实时校验缺字段时是否放行
    pub indeterminate_policy: IndeterminatePolicy,
    /// 单条规则查询的执行与锁等待上限（秒），超时的规则计入失败
    pub query_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::default(),
            subject_column: "subject_id".to_string(),
            visit_column: "visit_number".to_string(),
            table_mapping: TableMappingConfig::default(),
            reopen_policy: ReopenPolicy::default(),
            indeterminate_policy: IndeterminatePolicy::default(),
            query_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::NotFound(path_ref.to_path_buf()));
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path_ref.to_path_buf(),
            source,
        })
    }
}
