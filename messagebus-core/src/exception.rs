//! 终态失败时写入 `Exception` 消息头的结构化异常信息
//!
//! 使用固定字段与版本号的稳定结构，按 JSON 序列化。
//!
use crate::handler::HandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EXCEPTION_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExceptionHeader {
    pub schema_version: u32,
    pub time_stamp: DateTime<Utc>,
    pub exception_type: String,
    /// 展开后的原因链文本
    pub message: String,
    pub causes: Vec<String>,
    pub stack_trace: Option<String>,
    pub source: Option<String>,
    /// 原始错误的序列化形式（尽力而为，失败时为空串）
    pub exception: String,
}

impl ExceptionHeader {
    pub fn new(error: &HandlerError, time_stamp: DateTime<Utc>, raw: String) -> Self {
        Self {
            schema_version: EXCEPTION_SCHEMA_VERSION,
            time_stamp,
            exception_type: error.kind.clone(),
            message: error.flattened_message(),
            causes: error.causes.clone(),
            stack_trace: error.stack_trace.clone(),
            source: error.source.clone(),
            exception: raw,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
