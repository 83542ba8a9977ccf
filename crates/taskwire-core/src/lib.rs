#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "taskwire-core: 分布式任务运行时传输层的统一契约。"]
#![doc = ""]
#![doc = "== 分层 =="]
#![doc = "1. 地址与注册表：`scheme://location` 切分、scheme → 后端实例的进程级映射；"]
#![doc = "2. Comm 契约：分帧读写、幂等关闭、传输故障即关闭的生命周期状态机；"]
#![doc = "3. 帧编解码与零拷贝桥：头部 + 负载描述符，负载缓冲只借用不复制；"]
#![doc = "4. 通用监听运行时：接受循环、每会话独立任务、处理器失败隔离与旁路事件。"]
#![doc = ""]
#![doc = "具体介质（TCP、Fabric、进程内）位于 `crates/transport/` 下的独立 crate，"]
#![doc = "它们只依赖本 crate 暴露的契约。"]

pub use async_trait::async_trait;

pub mod address;
pub mod backend;
pub mod bridge;
pub mod comm;
pub mod context;
pub mod error;
pub mod frame;
pub mod listener;
pub mod memory;
pub mod message;
pub mod options;
pub mod prelude;
pub mod registry;

pub use address::{Address, parse_address, parse_host_port, unparse_address, unparse_host_port};
pub use backend::{Backend, Connector, ListenerFactory};
pub use comm::{BoxComm, CloseHandle, Comm, CommState, ExtraInfo, TransferMode};
pub use context::{CallContext, Cancellation};
pub use error::{CommError, ErrorKind, Result};
pub use listener::{CommHandler, Listener, ListenerEvent, ListenerStats, handler_fn};
pub use message::{Bulk, Message, Value};
pub use options::{BackendOptions, ConnectOptions, ListenOptions};
pub use registry::BackendRegistry;
