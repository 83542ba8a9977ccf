use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{DeviceAllocator, DeviceBuffer, DeviceRegion};
use crate::error::{CommError, ErrorKind, Result, codes};

const EMULATED_BASE: u64 = 0x7f00_0000_0000;
const EMULATED_ALIGN: u64 = 256;

static NEXT_PTR: AtomicU64 = AtomicU64::new(EMULATED_BASE);

/// 以主机内存模拟的设备内存。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 没有加速器的主机与测试环境同样需要走“设备缓冲”路径，验证接收端按种类分配、
///   Fabric 注册与资格检查等逻辑；
///
/// ## 契约 (What)
/// - 每个区域获得单调递增、按 256 字节对齐的合成设备地址；
/// - `with_fabric_eligible(false)` 产生的区域拒绝 Fabric 注册，用于模拟未锁页的显存；
/// - `allocated()` 统计经本分配器创建的区域数量。
#[derive(Clone, Debug)]
pub struct EmulatedDevice {
    fabric_eligible: bool,
    allocated: Arc<AtomicUsize>,
}

impl EmulatedDevice {
    /// 创建可注册的模拟设备。
    pub fn new() -> Self {
        Self {
            fabric_eligible: true,
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 控制后续分配的区域是否允许 Fabric 注册。
    pub fn with_fabric_eligible(mut self, eligible: bool) -> Self {
        self.fabric_eligible = eligible;
        self
    }

    /// 分配并填充一个区域。
    pub fn upload(&self, data: &[u8]) -> Result<DeviceBuffer> {
        let region = self.allocate(data.len())?;
        region.copy_from_host(0, data)?;
        Ok(region)
    }

    /// 已分配的区域数量。
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for EmulatedDevice {
    fn allocate(&self, len: usize) -> Result<DeviceBuffer> {
        let data = super::zeroed_host_vec(len)?;
        let span = (len as u64).div_ceil(EMULATED_ALIGN).max(1) * EMULATED_ALIGN;
        let ptr = NEXT_PTR.fetch_add(span, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(EmulatedRegion {
            ptr,
            data: Mutex::new(data),
            fabric_eligible: self.fabric_eligible,
        }))
    }
}

#[derive(Debug)]
struct EmulatedRegion {
    ptr: u64,
    data: Mutex<Vec<u8>>,
    fabric_eligible: bool,
}

impl EmulatedRegion {
    fn bounds(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
        let size = self.data.lock().len();
        offset
            .checked_add(len)
            .filter(|end| *end <= size)
            .map(|end| offset..end)
            .ok_or_else(|| {
                CommError::new(
                    ErrorKind::DecodeError,
                    codes::MEMORY_COPY,
                    format!("device copy [{offset}, +{len}) out of bounds for {size} bytes"),
                )
            })
    }
}

impl DeviceRegion for EmulatedRegion {
    fn device_ptr(&self) -> u64 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let range = self.bounds(offset, dst.len())?;
        dst.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()> {
        let range = self.bounds(offset, src.len())?;
        self.data.lock()[range].copy_from_slice(src);
        Ok(())
    }

    fn fabric_eligible(&self) -> bool {
        self.fabric_eligible
    }
}
