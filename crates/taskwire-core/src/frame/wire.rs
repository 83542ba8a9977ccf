use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::de::{
    self, DeserializeSeed, Deserializer, EnumAccess, MapAccess, SeqAccess, Unexpected,
    VariantAccess, Visitor,
};
use serde::{Deserialize, Serialize};

use super::PayloadDescriptor;
use crate::error::{CommError, ErrorKind, Result, codes};
use crate::memory::Buffer;
use crate::message::{Bulk, Value};

/// 嵌套深度上限，防止恶意或失控的值树撑爆栈。
pub(super) const MAX_DEPTH: usize = 128;

/// 线路上的值：与 [`Value`] 同构，但大块负载被替换为指向负载列表的占位符。
///
/// 变体顺序即线路上的变体序号，`Deserialize` 由 [`WireValueSeed`] 手写实现。
#[derive(Debug, Serialize)]
pub(super) enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Placeholder {
        meta: Box<WireValue>,
        first: u32,
        count: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub(super) struct WireHeader {
    pub version: u8,
    pub body: WireValue,
    pub descriptors: Vec<PayloadDescriptor>,
}

const VARIANTS: &[&str] = &[
    "Null",
    "Bool",
    "Int",
    "Float",
    "Str",
    "Bytes",
    "List",
    "Map",
    "Placeholder",
];

const PLACEHOLDER_FIELDS: &[&str] = &["meta", "first", "count"];

/// 反序列化单次预分配的元素上限；真实长度由后续元素逐个撑开。
const PREALLOC_LIMIT: usize = 1024;

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        WireValueSeed { depth: 0 }.deserialize(deserializer)
    }
}

/// 带深度计数的反序列化入口。
///
/// 对端头部可以声明任意深的嵌套，派生实现会一路递归直到栈溢出；
/// 这里在进入每一层之前检查深度，超过 [`MAX_DEPTH`] 立即返回错误，
/// 与编码侧 [`lower`] 接受的深度一致。
#[derive(Clone, Copy)]
struct WireValueSeed {
    depth: usize,
}

impl WireValueSeed {
    fn nested(self) -> Self {
        Self { depth: self.depth + 1 }
    }
}

impl<'de> DeserializeSeed<'de> for WireValueSeed {
    type Value = WireValue;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<WireValue, D::Error> {
        if self.depth > MAX_DEPTH {
            return Err(de::Error::custom(format!(
                "header nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        deserializer.deserialize_enum("WireValue", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for WireValueSeed {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a wire value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> std::result::Result<WireValue, A::Error> {
        let (index, variant) = data.variant::<u32>()?;
        match index {
            0 => variant.unit_variant().map(|()| WireValue::Null),
            1 => variant.newtype_variant().map(WireValue::Bool),
            2 => variant.newtype_variant().map(WireValue::Int),
            3 => variant.newtype_variant().map(WireValue::Float),
            4 => variant.newtype_variant().map(WireValue::Str),
            5 => variant.newtype_variant().map(WireValue::Bytes),
            6 => variant
                .newtype_variant_seed(ListSeed(self.nested()))
                .map(WireValue::List),
            7 => variant
                .newtype_variant_seed(MapSeed(self.nested()))
                .map(WireValue::Map),
            8 => variant.struct_variant(PLACEHOLDER_FIELDS, PlaceholderVisitor(self.nested())),
            other => Err(de::Error::invalid_value(
                Unexpected::Unsigned(u64::from(other)),
                &"a wire value variant index below 9",
            )),
        }
    }
}

struct ListSeed(WireValueSeed);

impl<'de> DeserializeSeed<'de> for ListSeed {
    type Value = Vec<WireValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ListSeed {
    type Value = Vec<WireValue>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of wire values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(PREALLOC_LIMIT));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

struct MapSeed(WireValueSeed);

impl<'de> DeserializeSeed<'de> for MapSeed {
    type Value = BTreeMap<String, WireValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for MapSeed {
    type Value = BTreeMap<String, WireValue>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of wire values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(self.0)?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

struct PlaceholderVisitor(WireValueSeed);

impl<'de> Visitor<'de> for PlaceholderVisitor {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a payload placeholder")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<WireValue, A::Error> {
        let meta = seq
            .next_element_seed(self.0)?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let first = seq
            .next_element::<u32>()?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        let count = seq
            .next_element::<u32>()?
            .ok_or_else(|| de::Error::invalid_length(2, &self))?;
        Ok(WireValue::Placeholder {
            meta: Box::new(meta),
            first,
            count,
        })
    }
}

/// 第一遍：遍历消息，把每个大块负载换成占位符并追加描述符。
pub(super) fn lower(
    value: &Value,
    descriptors: &mut Vec<PayloadDescriptor>,
    payloads: &mut Vec<Buffer>,
    depth: usize,
) -> Result<WireValue> {
    if depth > MAX_DEPTH {
        return Err(encode_error(format!("message nesting exceeds {MAX_DEPTH} levels")));
    }
    let lowered = match value {
        Value::Null => WireValue::Null,
        Value::Bool(v) => WireValue::Bool(*v),
        Value::Int(v) => WireValue::Int(*v),
        Value::Float(v) => WireValue::Float(*v),
        Value::Str(v) => WireValue::Str(v.clone()),
        Value::Bytes(v) => WireValue::Bytes(v.clone()),
        Value::List(items) => WireValue::List(
            items
                .iter()
                .map(|item| lower(item, descriptors, payloads, depth + 1))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => WireValue::Map(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), lower(v, descriptors, payloads, depth + 1)?)))
                .collect::<Result<_>>()?,
        ),
        Value::Bulk(bulk) => {
            let meta = lower(&bulk.meta, descriptors, payloads, depth + 1)?;
            let first = to_u32(payloads.len())?;
            let count = to_u32(bulk.frames.len())?;
            for frame in &bulk.frames {
                descriptors.push(PayloadDescriptor {
                    len: frame.len() as u64,
                    kind: frame.kind(),
                });
                payloads.push(frame.clone());
            }
            WireValue::Placeholder {
                meta: Box::new(meta),
                first,
                count,
            }
        }
    };
    Ok(lowered)
}

/// 解码后的反向替换：占位符换回接收到的缓冲。
///
/// `slots` 中每个缓冲只能被取用一次，重复引用或越界均视为头部损坏。
pub(super) fn raise(value: WireValue, slots: &mut [Option<Buffer>], depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(CommError::decode(format!(
            "header nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    let raised = match value {
        WireValue::Null => Value::Null,
        WireValue::Bool(v) => Value::Bool(v),
        WireValue::Int(v) => Value::Int(v),
        WireValue::Float(v) => Value::Float(v),
        WireValue::Str(v) => Value::Str(v),
        WireValue::Bytes(v) => Value::Bytes(v),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| raise(item, slots, depth + 1))
                .collect::<Result<_>>()?,
        ),
        WireValue::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, raise(v, slots, depth + 1)?)))
                .collect::<Result<_>>()?,
        ),
        WireValue::Placeholder { meta, first, count } => {
            let meta = raise(*meta, slots, depth + 1)?;
            let start = first as usize;
            let end = start
                .checked_add(count as usize)
                .filter(|end| *end <= slots.len())
                .ok_or_else(|| {
                    CommError::decode(format!(
                        "placeholder [{first}, +{count}) outside {} payloads",
                        slots.len()
                    ))
                })?;
            let frames = slots[start..end]
                .iter_mut()
                .enumerate()
                .map(|(offset, slot)| {
                    slot.take().ok_or_else(|| {
                        CommError::decode(format!(
                            "payload {} referenced twice",
                            start + offset
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Value::Bulk(Bulk::new(meta, frames))
        }
    };
    Ok(raised)
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| encode_error(format!("too many payloads: {n}")))
}

fn encode_error(message: String) -> CommError {
    CommError::new(ErrorKind::DecodeError, codes::FRAME_ENCODE, message)
}
