use std::time::Duration;

use serde::Deserialize;
use taskwire_core::error::{CommError, Result};
use taskwire_core::options::BackendOptions;

use crate::SCHEME;

/// 默认分块大小。
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// 允许的最小分块。
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;
/// 允许的最大分块，受线路上 `u32` 分块长度约束。
pub const MAX_CHUNK_SIZE: usize = 256 * 1024 * 1024;

/// 发送端何时注册负载缓冲。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    /// 写入任何字节前注册全部负载；注册失败时 Comm 保持可用。
    #[default]
    Eager,
    /// 逐个负载在 put 前注册；注册失败时帧已部分写出，Comm 随之关闭。
    Lazy,
}

/// `fabric` 后端接受的选项。
///
/// # 教案式说明
/// - **Why**：真实 Fabric 部署需要在“是否启用设备内存”“何时注册”“每次 put 的粒度”
///   之间取舍，这些取舍必须能按连接配置；
/// - **What**：
///   - `create_device_context`：首次使用时是否在进程级上下文中创建设备上下文；
///   - `device_memory`：是否允许注册与接收设备内存，关闭后设备负载注册失败、
///     接收端一律落入主机内存；
///   - `registration`：`eager` 或 `lazy`，见 [`RegistrationMode`]；
///   - `chunk_size`：本端愿意接受的最大 put 分块，实际值取两端最小值；
///   - `handshake_timeout_ms`：带外握手的最长等待；
///   - `contact_host`：监听在通配地址时对外公布的主机名；
/// - **Trade-offs**：分块越大单次 put 越高效，但关闭与超时的响应粒度也越粗。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FabricOptions {
    pub create_device_context: bool,
    pub device_memory: bool,
    pub registration: RegistrationMode,
    pub chunk_size: usize,
    pub handshake_timeout_ms: u64,
    pub contact_host: Option<String>,
}

impl Default for FabricOptions {
    fn default() -> Self {
        Self {
            create_device_context: false,
            device_memory: true,
            registration: RegistrationMode::Eager,
            chunk_size: DEFAULT_CHUNK_SIZE,
            handshake_timeout_ms: 10_000,
            contact_host: None,
        }
    }
}

impl FabricOptions {
    /// 解析并校验不透明选项。
    pub fn from_backend(options: &BackendOptions) -> Result<Self> {
        let parsed: Self = options.parse(SCHEME)?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(CommError::invalid_options(
                SCHEME,
                format_args!(
                    "chunk_size {} outside [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
                    self.chunk_size
                ),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(CommError::invalid_options(
                SCHEME,
                "handshake_timeout_ms must be positive",
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwire_core::ErrorKind;

    #[test]
    fn defaults() {
        let parsed = FabricOptions::from_backend(&BackendOptions::new()).expect("defaults");
        assert_eq!(parsed, FabricOptions::default());
        assert_eq!(parsed.registration, RegistrationMode::Eager);
        assert!(parsed.device_memory);
        assert!(!parsed.create_device_context);
        assert_eq!(parsed.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn overrides() {
        let parsed = FabricOptions::from_backend(
            &BackendOptions::new()
                .set("registration", "lazy")
                .set("chunk_size", 8192)
                .set("device_memory", false),
        )
        .expect("overrides");
        assert_eq!(parsed.registration, RegistrationMode::Lazy);
        assert_eq!(parsed.chunk_size, 8192);
        assert!(!parsed.device_memory);
    }

    #[test]
    fn rejects_small_chunks_and_unknown_keys() {
        let err = FabricOptions::from_backend(&BackendOptions::new().set("chunk_size", 512))
            .expect_err("too small");
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);

        let err = FabricOptions::from_backend(&BackendOptions::new().set("create_cuda_context", true))
            .expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);

        let err = FabricOptions::from_backend(&BackendOptions::new().set("registration", "sometimes"))
            .expect_err("bad mode");
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
    }
}
