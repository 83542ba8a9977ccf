//! 消息值模型。
//!
//! 传输层把调用方的消息视为一棵结构化值树：普通叶子内联编码进头部，
//! [`Bulk`] 节点标记“按大块负载传输”，其缓冲不会被拷入帧流。

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::memory::Buffer;

/// 经 Comm 传输的消息。
pub type Message = Value;

/// 结构化值。
///
/// # 契约 (What)
/// - `Bytes` 为内联字节，随头部一起编码；
/// - `Bulk` 为零拷贝负载，头部中只留下占位符与尺寸描述；
/// - `Map` 使用有序映射，保证相同内容编码出相同头部。
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bulk(Bulk),
}

/// 按大块传输的负载：少量内联元数据加一组缓冲帧。
///
/// 元数据描述如何解释帧（例如数组的 dtype 与 shape），帧本身在发送端只被借用。
#[derive(Clone, Debug, PartialEq)]
pub struct Bulk {
    pub meta: Box<Value>,
    pub frames: Vec<Buffer>,
}

impl Bulk {
    /// 构造大块负载。
    pub fn new(meta: Value, frames: Vec<Buffer>) -> Self {
        Self {
            meta: Box::new(meta),
            frames,
        }
    }

    /// 所有帧的字节总数。
    pub fn nbytes(&self) -> usize {
        self.frames.iter().map(Buffer::len).sum()
    }
}

impl Value {
    /// 空映射。
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// 读取映射中的键。
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// 写入映射中的键；非映射值返回 `None` 且不做修改。
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        match self {
            Value::Map(map) => map.insert(key.into(), value.into()),
            _ => None,
        }
    }

    /// 移除并返回映射中的键。
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        match self {
            Value::Map(map) => map.remove(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_bulk(&self) -> Option<&Bulk> {
        match self {
            Value::Bulk(bulk) => Some(bulk),
            _ => None,
        }
    }

    /// 递归统计大块负载的帧数量。
    pub fn bulk_frame_count(&self) -> usize {
        match self {
            Value::Bulk(bulk) => bulk.frames.len() + bulk.meta.bulk_frame_count(),
            Value::List(items) => items.iter().map(Value::bulk_frame_count).sum(),
            Value::Map(map) => map.values().map(Value::bulk_frame_count).sum(),
            _ => 0,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Bulk> for Value {
    fn from(v: Bulk) -> Self {
        Value::Bulk(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Value {
    fn from(pairs: [(K, V); N]) -> Self {
        Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
