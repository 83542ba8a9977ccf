#![deny(unsafe_code)]
#![doc = "taskwire-transport-fabric: 远程直接搬运后端，实现 `fabric://host:port` 地址。"]
#![doc = ""]
#![doc = "== 组成 =="]
#![doc = "1. 带外握手：交换端点标识、协议版本、分块上限与设备内存能力；"]
#![doc = "2. 进程级上下文：首次使用时创建、最后一个引用释放时销毁，持有缓冲注册表；"]
#![doc = "3. 操作流：头部先行，负载以注册键 + 偏移的分块 put 搬运，COMPLETE 收尾。"]
#![doc = ""]
#![doc = "本 crate 的提供者在 TCP 带外通道上以软件方式执行 put，注册、资格检查与边界校验"]
#![doc = "与硬件提供者保持同一套语义，设备缓冲不可注册时显式失败。"]

mod channel;
mod config;
mod context;
mod error;
mod handshake;
mod listener;
mod protocol;
mod util;

use async_trait::async_trait;
use taskwire_core::backend::{Backend, Connector, ListenerFactory};
use taskwire_core::comm::BoxComm;
use taskwire_core::error::Result;
use taskwire_core::listener::{CommHandler, Listener};
use taskwire_core::options::{ConnectOptions, ListenOptions};

pub use channel::FabricComm;
pub use config::{DEFAULT_CHUNK_SIZE, FabricOptions, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, RegistrationMode};
pub use context::{FabricContext, MemoryRegion, Registration};
pub use listener::{FabricAcceptor, FabricIncoming, listen};

/// 本后端注册使用的 scheme。
pub const SCHEME: &str = "fabric";

/// Fabric 后端描述符。进程级资源由 [`FabricContext`] 按需管理，描述符本身无状态。
#[derive(Clone, Copy, Debug, Default)]
pub struct FabricBackend;

impl FabricBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for FabricBackend {
    async fn connect(&self, location: &str, options: &ConnectOptions) -> Result<BoxComm> {
        Ok(Box::new(FabricComm::connect(location, options).await?))
    }
}

#[async_trait]
impl ListenerFactory for FabricBackend {
    async fn bind(
        &self,
        location: &str,
        handler: CommHandler,
        options: &ListenOptions,
    ) -> Result<Listener> {
        listen(location, handler, options).await
    }
}

impl Backend for FabricBackend {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn connector(&self) -> &dyn Connector {
        self
    }

    fn listener_factory(&self) -> &dyn ListenerFactory {
        self
    }
}
