//! 进程级 Fabric 上下文与缓冲注册表。
//!
//! # 设计背景（Why）
//! - 真实的 Fabric 提供者（verbs/UCX）要求每个进程只打开一次设备并共享保护域，注册的
//!   内存区域也属于该保护域；
//! - 上下文在第一次使用时创建，最后一个引用者（会话或监听器）释放后销毁，
//!   空闲进程不保留任何 Fabric 资源。
//!
//! # 契约说明（What）
//! - [`FabricContext::acquire`] 返回共享实例，必要时新建；
//! - [`FabricContext::register`] 为缓冲分配注册键，返回的 [`MemoryRegion`] 在析构时注销；
//! - 设备缓冲只有在本端允许设备内存且区域声明可注册时才能注册，
//!   否则返回 `BufferRegistrationFailed`，从不悄悄改走主机拷贝。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, const_mutex};
use taskwire_core::error::Result;
use taskwire_core::memory::{Buffer, DeviceRegion, MemoryKind, RawBuffer, RecvBuffer};

use crate::error::registration_failed;

static SHARED: Mutex<Weak<FabricContext>> = const_mutex(Weak::new());

/// 注册表中的一条记录。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    pub key: u64,
    pub raw: RawBuffer,
}

/// 进程级共享的 Fabric 上下文。
#[derive(Debug)]
pub struct FabricContext {
    registrations: DashMap<u64, RawBuffer>,
    next_key: AtomicU64,
    next_endpoint: AtomicU32,
    device_context: AtomicBool,
}

impl FabricContext {
    /// 获取共享上下文；不存在时创建。
    pub fn acquire() -> Arc<Self> {
        let mut slot = SHARED.lock();
        if let Some(existing) = slot.upgrade() {
            return existing;
        }
        let context = Arc::new(Self {
            registrations: DashMap::new(),
            next_key: AtomicU64::new(1),
            next_endpoint: AtomicU32::new(1),
            device_context: AtomicBool::new(false),
        });
        *slot = Arc::downgrade(&context);
        tracing::info!(pid = std::process::id(), "fabric context created");
        context
    }

    /// 当前存活的共享上下文，不会触发创建。
    pub fn current() -> Option<Arc<Self>> {
        SHARED.lock().upgrade()
    }

    /// 分配本进程内唯一的端点标识：高 32 位为进程号，低 32 位为序号。
    pub fn next_endpoint_id(&self) -> u64 {
        let seq = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        (u64::from(std::process::id()) << 32) | u64::from(seq)
    }

    /// 按需创建设备上下文；重复调用无副作用。
    pub fn ensure_device_context(&self) {
        if !self.device_context.swap(true, Ordering::AcqRel) {
            tracing::info!("fabric device context created");
        }
    }

    pub fn has_device_context(&self) -> bool {
        self.device_context.load(Ordering::Acquire)
    }

    /// 当前注册的区域数量。
    pub fn registered(&self) -> usize {
        self.registrations.len()
    }

    /// 查询注册键对应的区域。
    pub fn lookup(&self, key: u64) -> Option<Registration> {
        self.registrations
            .get(&key)
            .map(|raw| Registration { key, raw: *raw })
    }

    /// 注册发送缓冲。
    ///
    /// `device_memory` 为本端是否允许设备内存参与零拷贝。
    pub fn register(self: &Arc<Self>, buffer: &Buffer, device_memory: bool) -> Result<MemoryRegion> {
        if let Buffer::Device(region) = buffer {
            check_device(region.as_ref(), device_memory)?;
        }
        Ok(self.insert(buffer.raw()))
    }

    /// 注册接收缓冲；主机缓冲以其当前地址登记，接收过程中不会重新分配。
    pub fn register_receive(
        self: &Arc<Self>,
        buffer: &RecvBuffer,
        device_memory: bool,
    ) -> Result<MemoryRegion> {
        let raw = match buffer {
            RecvBuffer::Host(bytes) => RawBuffer {
                ptr: bytes.as_ptr() as usize as u64,
                len: bytes.len(),
                kind: MemoryKind::Host,
            },
            RecvBuffer::Device(region) => {
                check_device(region.as_ref(), device_memory)?;
                RawBuffer {
                    ptr: region.device_ptr(),
                    len: region.len(),
                    kind: MemoryKind::Device,
                }
            }
        };
        Ok(self.insert(raw))
    }

    fn insert(self: &Arc<Self>, raw: RawBuffer) -> MemoryRegion {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.registrations.insert(key, raw);
        tracing::trace!(key, len = raw.len, kind = ?raw.kind, "fabric region registered");
        MemoryRegion {
            context: Arc::clone(self),
            key,
            raw,
        }
    }
}

fn check_device(region: &dyn DeviceRegion, device_memory: bool) -> Result<()> {
    if !device_memory {
        return Err(registration_failed(format!(
            "device buffer of {} bytes offered but device memory is disabled",
            region.len()
        )));
    }
    if !region.fabric_eligible() {
        return Err(registration_failed(format!(
            "device region at {:#x} ({} bytes) cannot be registered",
            region.device_ptr(),
            region.len()
        )));
    }
    Ok(())
}

impl Drop for FabricContext {
    fn drop(&mut self) {
        tracing::info!(pid = std::process::id(), "fabric context torn down");
    }
}

/// 已注册的内存区域；析构时从注册表注销。
#[derive(Debug)]
pub struct MemoryRegion {
    context: Arc<FabricContext>,
    key: u64,
    raw: RawBuffer,
}

impl MemoryRegion {
    /// 远端访问该区域使用的注册键。
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn len(&self) -> usize {
        self.raw.len
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len == 0
    }

    pub fn kind(&self) -> MemoryKind {
        self.raw.kind
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        self.context.registrations.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use taskwire_core::ErrorKind;
    use taskwire_core::memory::EmulatedDevice;

    #[test]
    fn registration_is_released_on_drop() {
        let context = FabricContext::acquire();
        let region = context
            .register(&Buffer::Host(Bytes::from_static(b"payload")), true)
            .expect("host registration");
        assert_eq!(region.len(), 7);
        assert_eq!(region.kind(), MemoryKind::Host);
        assert!(context.lookup(region.key()).is_some());
        let key = region.key();
        drop(region);
        assert!(context.lookup(key).is_none());
    }

    #[test]
    fn ineligible_device_region_is_rejected() {
        let context = FabricContext::acquire();
        let device = EmulatedDevice::new().with_fabric_eligible(false);
        let buffer = Buffer::Device(device.upload(b"pinned-less").expect("upload"));
        let err = context.register(&buffer, true).expect_err("ineligible");
        assert_eq!(err.kind(), ErrorKind::BufferRegistrationFailed);
    }

    #[test]
    fn device_memory_switch_is_honoured() {
        let context = FabricContext::acquire();
        let buffer = Buffer::Device(EmulatedDevice::new().upload(b"abc").expect("upload"));
        let err = context.register(&buffer, false).expect_err("disabled");
        assert_eq!(err.kind(), ErrorKind::BufferRegistrationFailed);
        let region = context.register(&buffer, true).expect("enabled");
        assert_eq!(region.kind(), MemoryKind::Device);
    }

    #[test]
    fn receive_buffers_register_at_their_address() {
        let context = FabricContext::acquire();
        let buffer = RecvBuffer::allocate(64, MemoryKind::Host, None).expect("allocate");
        let region = context.register_receive(&buffer, false).expect("host receive");
        let entry = context.lookup(region.key()).expect("registered");
        assert_eq!(entry.raw.len, 64);
        assert_eq!(entry.raw.kind, MemoryKind::Host);
    }

    #[test]
    fn endpoint_ids_embed_pid() {
        let context = FabricContext::acquire();
        let a = context.next_endpoint_id();
        let b = context.next_endpoint_id();
        assert_ne!(a, b);
        assert_eq!(a >> 32, u64::from(std::process::id()));
    }
}
