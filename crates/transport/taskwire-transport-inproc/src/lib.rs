#![deny(unsafe_code)]
#![doc = "taskwire-transport-inproc: 进程内后端，实现 `inproc://<位置>` 地址。"]
#![doc = ""]
#![doc = "监听器在进程级地址表中登记位置段，连接方直接拿到一对内存通道；"]
#![doc = "消息对象（包括负载缓冲句柄）原样移交，没有序列化与网络 IO，"]
#![doc = "Comm 的生命周期、关闭与错误语义与其它后端保持一致。"]

mod channel;
mod config;
mod listener;
mod routes;

use async_trait::async_trait;
use taskwire_core::backend::{Backend, Connector, ListenerFactory};
use taskwire_core::comm::BoxComm;
use taskwire_core::error::Result;
use taskwire_core::listener::{CommHandler, Listener};
use taskwire_core::options::{ConnectOptions, ListenOptions};

pub use channel::InprocComm;
pub use config::InprocOptions;
pub use listener::{InprocAcceptor, InprocIncoming, listen};

/// 本后端注册使用的 scheme。
pub const SCHEME: &str = "inproc";

/// 进程内后端描述符。
#[derive(Clone, Copy, Debug, Default)]
pub struct InprocBackend;

impl InprocBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for InprocBackend {
    async fn connect(&self, location: &str, options: &ConnectOptions) -> Result<BoxComm> {
        Ok(Box::new(InprocComm::connect(location, options).await?))
    }
}

#[async_trait]
impl ListenerFactory for InprocBackend {
    async fn bind(
        &self,
        location: &str,
        handler: CommHandler,
        options: &ListenOptions,
    ) -> Result<Listener> {
        listen(location, handler, options).await
    }
}

impl Backend for InprocBackend {
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
