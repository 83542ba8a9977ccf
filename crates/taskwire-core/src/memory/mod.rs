//! 零拷贝缓冲与加速器内存能力边界。
//!
//! # 设计背景（Why）
//! - 大块负载（数组、列式数据）可能驻留在主机内存，也可能驻留在加速器显存；传输层只借用
//!   这些缓冲，从不负责它们的分配池与回收策略；
//! - 缓冲在传输进行中不得被释放：主机缓冲用引用计数的 [`Bytes`]，设备缓冲用
//!   `Arc<dyn DeviceRegion>`，发送路径持有克隆直到传输完成即可满足该约束。
//!
//! # 契约说明（What）
//! - [`DeviceRegion`]：外部协作者提供 `(指针, 长度, 内存种类)` 与主机暂存拷贝能力；
//! - [`DeviceAllocator`]：按需分配同尺寸的接收缓冲；
//! - [`RecvBuffer`]：本层为接收而分配的存储，读取成功后所有权移交调用方。

mod emulated;

pub use emulated::EmulatedDevice;

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CommError, ErrorKind, Result, codes};

/// 缓冲所在的内存种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Host,
    Device,
}

/// 由外部协作者管理的一段设备内存。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 传输层只需要读取指针/长度并在必要时经主机暂存；真正的显存分配器、流同步等细节
///   留在协作者内部。
///
/// ## 契约 (What)
/// - `device_ptr`/`len` 描述区域本身，生命周期内不可变化；
/// - `copy_to_host`/`copy_from_host` 以字节偏移访问区域，越界必须返回错误而不是 panic；
/// - `fabric_eligible` 为 `false` 表示该区域不能注册到 Fabric（例如未锁页），
///   Fabric 后端会据此返回 `BufferRegistrationFailed`。
pub trait DeviceRegion: Send + Sync + fmt::Debug {
    /// 设备侧地址。
    fn device_ptr(&self) -> u64;

    /// 字节长度。
    fn len(&self) -> usize;

    /// 是否为空区域。
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从设备拷贝到主机缓冲。
    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// 从主机缓冲拷贝到设备。
    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()>;

    /// 是否允许注册为 Fabric 零拷贝区域。
    fn fabric_eligible(&self) -> bool {
        true
    }
}

/// 共享所有权的设备缓冲。
pub type DeviceBuffer = Arc<dyn DeviceRegion>;

/// 设备内存分配能力。
pub trait DeviceAllocator: Send + Sync + fmt::Debug {
    /// 分配 `len` 字节的设备缓冲。
    fn allocate(&self, len: usize) -> Result<DeviceBuffer>;
}

/// 缓冲的原始描述：指针、长度与内存种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBuffer {
    pub ptr: u64,
    pub len: usize,
    pub kind: MemoryKind,
}

/// 由调用方持有、传输层借用的负载缓冲。
#[derive(Clone, Debug)]
pub enum Buffer {
    Host(Bytes),
    Device(DeviceBuffer),
}

impl Buffer {
    /// 内存种类。
    pub fn kind(&self) -> MemoryKind {
        match self {
            Buffer::Host(_) => MemoryKind::Host,
            Buffer::Device(_) => MemoryKind::Device,
        }
    }

    /// 字节长度。
    pub fn len(&self) -> usize {
        match self {
            Buffer::Host(bytes) => bytes.len(),
            Buffer::Device(region) => region.len(),
        }
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 原始指针描述。
    pub fn raw(&self) -> RawBuffer {
        let ptr = match self {
            Buffer::Host(bytes) => bytes.as_ptr() as usize as u64,
            Buffer::Device(region) => region.device_ptr(),
        };
        RawBuffer {
            ptr,
            len: self.len(),
            kind: self.kind(),
        }
    }

    /// 主机缓冲视图。
    pub fn as_host(&self) -> Option<&Bytes> {
        match self {
            Buffer::Host(bytes) => Some(bytes),
            Buffer::Device(_) => None,
        }
    }

    /// 设备缓冲视图。
    pub fn as_device(&self) -> Option<&DeviceBuffer> {
        match self {
            Buffer::Host(_) => None,
            Buffer::Device(region) => Some(region),
        }
    }

    /// 取得主机侧字节；设备缓冲会经过一次显式暂存拷贝。
    pub fn to_host_bytes(&self) -> Result<Bytes> {
        match self {
            Buffer::Host(bytes) => Ok(bytes.clone()),
            Buffer::Device(region) => {
                let mut staging = vec![0u8; region.len()];
                region.copy_to_host(0, &mut staging)?;
                Ok(Bytes::from(staging))
            }
        }
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Buffer::Host(a), Buffer::Host(b)) => a == b,
            (Buffer::Device(a), Buffer::Device(b)) if Arc::ptr_eq(a, b) => true,
            _ => {
                if self.kind() != other.kind() || self.len() != other.len() {
                    return false;
                }
                match (self.to_host_bytes(), other.to_host_bytes()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                }
            }
        }
    }
}

impl From<Bytes> for Buffer {
    fn from(bytes: Bytes) -> Self {
        Buffer::Host(bytes)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer::Host(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Buffer {
    fn from(bytes: &'static [u8]) -> Self {
        Buffer::Host(Bytes::from_static(bytes))
    }
}

impl From<DeviceBuffer> for Buffer {
    fn from(region: DeviceBuffer) -> Self {
        Buffer::Device(region)
    }
}

/// 接收路径预先分配的存储。
///
/// 头部声明的每个负载描述符对应一个 `RecvBuffer`，在负载字节到达前完成分配，
/// 这是 Fabric 零拷贝接收的前提。
#[derive(Debug)]
pub enum RecvBuffer {
    Host(BytesMut),
    Device(DeviceBuffer),
}

impl RecvBuffer {
    /// 按描述的种类与长度分配接收缓冲。
    ///
    /// 请求设备内存但没有可用的分配器时，退化为主机内存并记录调试日志：
    /// 接收端没有加速器是合法部署形态。
    pub fn allocate(
        len: usize,
        kind: MemoryKind,
        device: Option<&dyn DeviceAllocator>,
    ) -> Result<Self> {
        match (kind, device) {
            (MemoryKind::Device, Some(allocator)) => {
                let region = allocator.allocate(len)?;
                if region.len() != len {
                    return Err(CommError::new(
                        ErrorKind::DecodeError,
                        codes::MEMORY_ALLOCATE,
                        format!(
                            "device allocator returned {} bytes, {} requested",
                            region.len(),
                            len
                        ),
                    ));
                }
                Ok(RecvBuffer::Device(region))
            }
            (MemoryKind::Device, None) => {
                tracing::debug!(len, "no device allocator, receiving device payload into host memory");
                Ok(RecvBuffer::Host(zeroed_host(len)?))
            }
            (MemoryKind::Host, _) => Ok(RecvBuffer::Host(zeroed_host(len)?)),
        }
    }

    /// 字节长度。
    pub fn len(&self) -> usize {
        match self {
            RecvBuffer::Host(bytes) => bytes.len(),
            RecvBuffer::Device(region) => region.len(),
        }
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 主机缓冲的可写视图，供流式后端直接 `read_exact`。
    pub fn host_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            RecvBuffer::Host(bytes) => Some(&mut bytes[..]),
            RecvBuffer::Device(_) => None,
        }
    }

    /// 将一段字节写入 `offset` 处。
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                CommError::decode(format!(
                    "chunk [{offset}, +{}) exceeds receive buffer of {} bytes",
                    src.len(),
                    self.len()
                ))
            })?;
        match self {
            RecvBuffer::Host(bytes) => {
                bytes[offset..end].copy_from_slice(src);
                Ok(())
            }
            RecvBuffer::Device(region) => region.copy_from_host(offset, src),
        }
    }

    /// 冻结为只读 [`Buffer`]，所有权移交调用方。
    pub fn freeze(self) -> Buffer {
        match self {
            RecvBuffer::Host(bytes) => Buffer::Host(bytes.freeze()),
            RecvBuffer::Device(region) => Buffer::Device(region),
        }
    }
}

/// 分配清零的主机缓冲；容量溢出或内存不足返回错误而不是中止进程。
pub(crate) fn zeroed_host_vec(len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len).map_err(|err| {
        CommError::new(
            ErrorKind::DecodeError,
            codes::MEMORY_ALLOCATE,
            format!("cannot allocate {len} bytes for a receive buffer: {err}"),
        )
    })?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn zeroed_host(len: usize) -> Result<BytesMut> {
    // 唯一持有的 `Bytes` 转回 `BytesMut` 不复制。
    zeroed_host_vec(len).map(|bytes| BytesMut::from(Bytes::from(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn device_request_without_allocator_lands_in_host_memory() {
        let buffer = RecvBuffer::allocate(16, MemoryKind::Device, None).expect("allocate");
        assert!(matches!(buffer, RecvBuffer::Host(_)));
        assert_eq!(buffer.len(), 16);
        assert!(logs_contain("no device allocator"));
    }

    #[test]
    fn write_at_rejects_overflow() {
        let mut buffer = RecvBuffer::allocate(4, MemoryKind::Host, None).expect("allocate");
        buffer.write_at(2, b"ab").expect("in bounds");
        let err = buffer.write_at(3, b"ab").expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert_eq!(buffer.freeze(), Buffer::from(vec![0, 0, b'a', b'b']));
    }

    #[test]
    fn device_buffers_compare_by_content() {
        let device = EmulatedDevice::new();
        let a = device.upload(b"payload").expect("upload");
        let b = device.upload(b"payload").expect("upload");
        assert_eq!(Buffer::Device(a), Buffer::Device(b));
        assert_ne!(
            Buffer::from(b"payload".to_vec()),
            Buffer::Device(device.upload(b"payload").expect("upload"))
        );
    }
}
