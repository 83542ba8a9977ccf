//! 序列化桥：把领域对象转换为可零拷贝传输的 [`Bulk`] 节点。
//!
//! # 设计背景（Why）
//! - 数组等大对象如果内联进头部，会在编码时整体复制一次；转成 `Bulk` 后头部只保留
//!   dtype/shape 等元数据，数据缓冲作为负载帧被借用发送；
//! - 接收端按描述符分配的缓冲（可能位于设备内存）直接成为重建对象的存储。
//!
//! # 契约说明（What）
//! - [`ToBulk`]/[`FromBulk`] 成对实现；元数据不匹配返回 `DecodeError`，错误码
//!   `taskwire.bridge.mismatch`；
//! - [`to_serialize`] 把对象包装为消息中的一个值，可嵌入任意映射或列表。

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CommError, ErrorKind, Result, codes};
use crate::memory::{Buffer, DeviceAllocator};
use crate::message::{Bulk, Value};

/// 可转为大块负载的类型。
pub trait ToBulk {
    fn to_bulk(&self) -> Result<Bulk>;
}

/// 可由大块负载重建的类型。
pub trait FromBulk: Sized {
    fn from_bulk(bulk: Bulk) -> Result<Self>;
}

/// 把对象包装为按零拷贝传输的消息值。
pub fn to_serialize<T: ToBulk + ?Sized>(value: &T) -> Result<Value> {
    value.to_bulk().map(Value::Bulk)
}

/// [`to_serialize`] 的逆操作。
pub fn from_serialize<T: FromBulk>(value: Value) -> Result<T> {
    match value {
        Value::Bulk(bulk) => T::from_bulk(bulk),
        _ => Err(mismatch("expected a bulk value")),
    }
}

fn mismatch(message: impl Into<String>) -> CommError {
    CommError::new(ErrorKind::DecodeError, codes::BRIDGE_MISMATCH, message.into())
}

const KIND_KEY: &str = "kind";

impl ToBulk for Buffer {
    fn to_bulk(&self) -> Result<Bulk> {
        Ok(Bulk::new(Value::from([(KIND_KEY, "buffer")]), vec![self.clone()]))
    }
}

impl FromBulk for Buffer {
    fn from_bulk(bulk: Bulk) -> Result<Self> {
        expect_kind(&bulk, "buffer")?;
        single_frame(bulk)
    }
}

fn expect_kind(bulk: &Bulk, kind: &str) -> Result<()> {
    match bulk.meta.get(KIND_KEY).and_then(Value::as_str) {
        Some(found) if found == kind => Ok(()),
        found => Err(mismatch(format!("expected `{kind}` bulk, found {found:?}"))),
    }
}

fn single_frame(bulk: Bulk) -> Result<Buffer> {
    let count = bulk.frames.len();
    let mut frames = bulk.frames.into_iter();
    match (frames.next(), count) {
        (Some(frame), 1) => Ok(frame),
        _ => Err(mismatch(format!("expected exactly one frame, found {count}"))),
    }
}

/// 数组元素类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// 单个元素的字节数。
    pub fn itemsize(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "u8" => Ok(DType::U8),
            "i32" => Ok(DType::I32),
            "i64" => Ok(DType::I64),
            "f32" => Ok(DType::F32),
            "f64" => Ok(DType::F64),
            other => Err(mismatch(format!("unknown dtype `{other}`"))),
        }
    }
}

/// 连续存储的 n 维数组，数据为小端字节序。
///
/// # 契约 (What)
/// - `data.len() == shape.iter().product() * dtype.itemsize()`，构造时校验；
/// - `data` 可以位于主机或设备内存，传输时保持原有内存种类。
#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    dtype: DType,
    shape: Vec<usize>,
    data: Buffer,
}

impl NdArray {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Buffer) -> Result<Self> {
        let elements = element_count(&shape)?;
        let expected = elements
            .checked_mul(dtype.itemsize())
            .ok_or_else(|| mismatch("array byte size overflows"))?;
        if data.len() != expected {
            return Err(mismatch(format!(
                "array of shape {shape:?} and dtype {} needs {expected} bytes, buffer has {}",
                dtype.as_str(),
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// 由 `f64` 切片构造主机数组。
    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F64, shape, Buffer::from(bytes))
    }

    /// 读出 `f64` 元素；设备数组会经过一次主机暂存。
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        if self.dtype != DType::F64 {
            return Err(mismatch(format!("array dtype is {}, not f64", self.dtype.as_str())));
        }
        let bytes = self.data.to_host_bytes()?;
        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect())
    }

    /// 复制到设备内存。
    pub fn to_device(&self, device: &dyn DeviceAllocator) -> Result<Self> {
        let region = device.allocate(self.data.len())?;
        region.copy_from_host(0, &self.data.to_host_bytes()?)?;
        Ok(Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            data: Buffer::Device(region),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }

    /// 元素个数。
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }
}

fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
        .ok_or_else(|| mismatch("array element count overflows"))
}

impl ToBulk for NdArray {
    fn to_bulk(&self) -> Result<Bulk> {
        let shape = self
            .shape
            .iter()
            .map(|dim| {
                i64::try_from(*dim)
                    .map(Value::Int)
                    .map_err(|_| mismatch("dimension exceeds i64"))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut meta = BTreeMap::new();
        meta.insert(KIND_KEY.to_owned(), Value::from("ndarray"));
        meta.insert("dtype".to_owned(), Value::from(self.dtype.as_str()));
        meta.insert("shape".to_owned(), Value::List(shape));
        Ok(Bulk::new(Value::Map(meta), vec![self.data.clone()]))
    }
}

impl FromBulk for NdArray {
    fn from_bulk(bulk: Bulk) -> Result<Self> {
        expect_kind(&bulk, "ndarray")?;
        let dtype = bulk
            .meta
            .get("dtype")
            .and_then(Value::as_str)
            .ok_or_else(|| mismatch("ndarray meta lacks dtype"))
            .and_then(DType::parse)?;
        let shape = match bulk.meta.get("shape") {
            Some(Value::List(dims)) => dims
                .iter()
                .map(|dim| {
                    dim.as_int()
                        .and_then(|d| usize::try_from(d).ok())
                        .ok_or_else(|| mismatch("ndarray shape must be non-negative integers"))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(mismatch("ndarray meta lacks shape")),
        };
        let data = single_frame(bulk)?;
        Self::new(dtype, shape, data)
    }
}

impl ToBulk for Bytes {
    fn to_bulk(&self) -> Result<Bulk> {
        Buffer::Host(self.clone()).to_bulk()
    }
}
