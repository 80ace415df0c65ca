//! 消息类型标识
//!
//! `TYPE_NAME` 即消息头中的 `FullTypeName`，同时用作扇出交换机名称、
//! 聚合缓冲区与聚合器注册表的键。
//!
use serde::{Serialize, de::DeserializeOwned};

pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}
