#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "taskwire: 分布式任务运行时的传输层门面。"]
#![doc = ""]
#![doc = "调用方只面对 `connect(address)` / `listen(address, handler)`，"]
#![doc = "由地址的 scheme 在进程级注册表中选出后端（`tcp`、`fabric`、`inproc`）。"]
#![doc = "内置后端在第一次访问注册表时登记，调用方仍可以登记自己的 scheme。"]

pub mod config;
pub mod logging;

use std::sync::{Arc, Once};

use taskwire_transport_fabric::FabricBackend;
use taskwire_transport_inproc::InprocBackend;
use taskwire_transport_tcp::TcpBackend;

pub use config::TransportConfig;
pub use taskwire_core::address::{Address, parse_address, unparse_address};
pub use taskwire_core::backend::Backend;
pub use taskwire_core::comm::{BoxComm, Comm, ExtraInfo, TransferMode};
pub use taskwire_core::error::{CommError, ErrorKind, Result};
pub use taskwire_core::listener::{CommHandler, HandlerError, Listener, ListenerEvent, handler_fn};
pub use taskwire_core::message::{Bulk, Message, Value};
pub use taskwire_core::options::{BackendOptions, ConnectOptions, ListenOptions};
pub use taskwire_core::registry::BackendRegistry;
pub use taskwire_core::prelude;

/// 把内置后端登记进指定注册表。
///
/// # 教案式说明
/// - **Why**：测试与嵌入场景需要独立的注册表；全局表也经由本函数初始化，两条路径行为一致；
/// - **How**：逐个登记，已存在的 scheme（`DuplicateScheme`）视为已完成，其余错误原样返回；
/// - **What**：返回后注册表至少包含 `tcp`、`fabric`、`inproc`。
pub fn register_builtin(registry: &BackendRegistry) -> Result<()> {
    let builtin: [Arc<dyn Backend>; 3] = [
        Arc::new(TcpBackend::new()),
        Arc::new(FabricBackend::new()),
        Arc::new(InprocBackend::new()),
    ];
    for backend in builtin {
        match registry.register(backend.scheme(), backend) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::DuplicateScheme => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// 进程级注册表，首次访问时登记内置后端。
pub fn registry() -> &'static BackendRegistry {
    static BUILTIN: Once = Once::new();
    let registry = BackendRegistry::global();
    BUILTIN.call_once(|| {
        if let Err(err) = register_builtin(registry) {
            tracing::warn!(code = err.code(), error = %err, "builtin backend registration failed");
        }
    });
    registry
}

/// 在全局注册表中登记自定义后端。
pub fn register(backend: Arc<dyn Backend>) -> Result<()> {
    registry().register(backend.scheme(), backend)
}

/// 解析地址并选出后端；地址与注册表错误在任何网络访问之前同步返回。
fn resolve(address: &str) -> Result<(Address, Arc<dyn Backend>)> {
    let address = Address::parse(address)?;
    let backend = address.resolve(registry())?;
    Ok((address, backend))
}

/// 连接 `scheme://location`，返回建立好的 Comm。
pub async fn connect(address: &str, options: ConnectOptions) -> Result<BoxComm> {
    let (address, backend) = resolve(address)?;
    tracing::debug!(scheme = address.scheme(), location = address.location(), "connecting");
    backend
        .connector()
        .connect(address.location(), &options)
        .await
}

/// 在 `scheme://location` 上监听，每个入站会话由独立任务运行 `handler`。
///
/// 返回的 [`Listener`] 是作用域资源：`stop` 或离开作用域都会释放绑定。
pub async fn listen(address: &str, handler: CommHandler, options: ListenOptions) -> Result<Listener> {
    let (address, backend) = resolve(address)?;
    backend
        .listener_factory()
        .bind(address.location(), handler, &options)
        .await
}
