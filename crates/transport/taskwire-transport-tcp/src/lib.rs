#![deny(unsafe_code)]
#![doc = "taskwire-transport-tcp: 基于 Tokio 的 TCP 传输，实现 `tcp://host:port` 地址。"]
#![doc = ""]
#![doc = "线路格式：`[u32 头部长度][头部][u32 负载数量][负载...]`，负载紧随头部以 vectored 写发送。"]
#![doc = "本后端是其余后端行为一致性的基线。"]

mod channel;
mod config;
mod error;
mod listener;
mod util;

use async_trait::async_trait;
use taskwire_core::backend::{Backend, Connector, ListenerFactory};
use taskwire_core::comm::BoxComm;
use taskwire_core::error::Result;
use taskwire_core::listener::{CommHandler, Listener};
use taskwire_core::options::{ConnectOptions, ListenOptions};

pub use channel::TcpComm;
pub use config::{TcpOptions, TcpSocketConfig};
pub use listener::{TcpAcceptor, TcpIncoming, listen};

/// 本后端注册使用的 scheme。
pub const SCHEME: &str = "tcp";

/// TCP 后端描述符，无状态，可在注册表中共享。
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpBackend;

impl TcpBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for TcpBackend {
    async fn connect(&self, location: &str, options: &ConnectOptions) -> Result<BoxComm> {
        Ok(Box::new(TcpComm::connect(location, options).await?))
    }
}

#[async_trait]
impl ListenerFactory for TcpBackend {
    async fn bind(
        &self,
        location: &str,
        handler: CommHandler,
        options: &ListenOptions,
    ) -> Result<Listener> {
        listen(location, handler, options).await
    }
}

impl Backend for TcpBackend {
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
