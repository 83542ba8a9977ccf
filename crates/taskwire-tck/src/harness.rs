use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use taskwire_core::address::Address;
use taskwire_core::backend::Backend;
use taskwire_core::comm::BoxComm;
use taskwire_core::error::{CommError, ErrorKind, Result};
use taskwire_core::listener::{CommHandler, HandlerError, Listener, handler_fn};
use taskwire_core::memory::{DeviceAllocator, EmulatedDevice};
use taskwire_core::message::Value;
use taskwire_core::options::{ConnectOptions, ListenOptions};

/// 单个断言步骤允许的最长等待时间。
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// 被测后端及其建连/监听参数。
///
/// # 教案式说明
/// - **Why**：断言函数与具体后端解耦，同一套用例可以在 TCP、Fabric、进程内后端上重放；
/// - **How**：后端 crate 在 `tests/tck.rs` 中构造 `Harness`，按需挂上模拟设备与后端选项；
/// - **What**：`listen_location` 为监听位置段（TCP/Fabric 通常是 `127.0.0.1:0`，
///   进程内后端为空串以自动分配地址）。
#[derive(Clone)]
pub struct Harness {
    backend: Arc<dyn Backend>,
    listen_location: String,
    connect_options: ConnectOptions,
    listen_options: ListenOptions,
    device: Option<EmulatedDevice>,
}

impl Harness {
    pub fn new(backend: Arc<dyn Backend>, listen_location: impl Into<String>) -> Self {
        Self {
            backend,
            listen_location: listen_location.into(),
            connect_options: ConnectOptions::default(),
            listen_options: ListenOptions::default(),
            device: None,
        }
    }

    /// 在两端挂上模拟设备，启用设备内存用例。
    pub fn with_device(mut self, device: EmulatedDevice) -> Self {
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(device.clone());
        self.connect_options = self.connect_options.with_device(Arc::clone(&allocator));
        self.listen_options = self.listen_options.with_device(allocator);
        self.device = Some(device);
        self
    }

    pub fn with_connect_options(mut self, f: impl FnOnce(ConnectOptions) -> ConnectOptions) -> Self {
        self.connect_options = f(self.connect_options);
        self
    }

    pub fn with_listen_options(mut self, f: impl FnOnce(ListenOptions) -> ListenOptions) -> Self {
        self.listen_options = f(self.listen_options);
        self
    }

    pub fn scheme(&self) -> &'static str {
        self.backend.scheme()
    }

    pub fn device(&self) -> Option<&EmulatedDevice> {
        self.device.as_ref()
    }

    /// 在默认位置启动监听器。
    pub async fn listen(&self, handler: CommHandler) -> anyhow::Result<Listener> {
        self.listen_at(&self.listen_location, handler).await
    }

    pub async fn listen_at(&self, location: &str, handler: CommHandler) -> anyhow::Result<Listener> {
        tracing::debug!(scheme = self.scheme(), location, "tck binding listener");
        within(
            "bind",
            self.backend
                .listener_factory()
                .bind(location, handler, &self.listen_options),
        )
        .await?
        .with_context(|| format!("{} listener failed to bind `{location}`", self.scheme()))
    }

    /// 连接监听器公布的地址。
    pub async fn connect(&self, listener: &Listener) -> anyhow::Result<BoxComm> {
        within("connect", self.connect_to(listener.contact_address()))
            .await?
            .with_context(|| format!("connect to {} failed", listener.contact_address()))
    }

    /// 连接完整地址，保留原始错误以便断言错误分类。
    pub async fn connect_to(&self, address: &str) -> Result<BoxComm> {
        let address = Address::parse(address)?;
        if address.scheme() != self.scheme() {
            return Err(CommError::malformed_address(
                &address.to_string(),
                "scheme does not match the backend under test",
            ));
        }
        self.backend
            .connector()
            .connect(address.location(), &self.connect_options)
            .await
    }
}

/// 限时等待一个步骤。
pub async fn within<T>(what: &str, future: impl Future<Output = T>) -> anyhow::Result<T> {
    tokio::time::timeout(STEP_TIMEOUT, future)
        .await
        .with_context(|| format!("{what} did not finish within {STEP_TIMEOUT:?}"))
}

/// 回显处理器：原样写回每条消息，直到对端关闭。
pub fn echo_handler() -> CommHandler {
    handler_fn(echo)
}

async fn echo(comm: BoxComm) -> std::result::Result<(), HandlerError> {
    loop {
        match comm.read().await {
            Ok(message) => {
                comm.write(&message).await?;
            }
            Err(err) if err.kind() == ErrorKind::StreamClosed => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

/// ping → pong 处理器：回复 `{"op": "pong", "payload": <原负载>}`。
pub fn pong_handler() -> CommHandler {
    handler_fn(pong)
}

async fn pong(comm: BoxComm) -> std::result::Result<(), HandlerError> {
    loop {
        let mut message = match comm.read().await {
            Ok(message) => message,
            Err(err) if err.kind() == ErrorKind::StreamClosed => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if message.get("op").and_then(Value::as_str) != Some("ping") {
            return Err(format!("unexpected message {message:?}").into());
        }
        let payload = message.remove("payload").unwrap_or_default();
        comm.write(&Value::from([("op", Value::from("pong")), ("payload", payload)]))
            .await?;
    }
}

/// 构造 ping 消息。
pub fn ping(payload: impl Into<Value>) -> Value {
    Value::from([("op", Value::from("ping")), ("payload", payload.into())])
}
