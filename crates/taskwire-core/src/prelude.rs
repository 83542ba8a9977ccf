//! 常用类型一次性导入：`use taskwire_core::prelude::*;`。

pub use crate::address::{Address, parse_address, unparse_address};
pub use crate::backend::{Backend, Connector, ListenerFactory};
pub use crate::bridge::{DType, FromBulk, NdArray, ToBulk, from_serialize, to_serialize};
pub use crate::comm::{BoxComm, Comm, ExtraInfo, TransferMode};
pub use crate::context::{CallContext, Cancellation};
pub use crate::error::{CommError, ErrorKind, Result};
pub use crate::listener::{CommHandler, HandlerError, Listener, ListenerEvent, handler_fn};
pub use crate::memory::{Buffer, DeviceAllocator, DeviceBuffer, EmulatedDevice, MemoryKind};
pub use crate::message::{Bulk, Message, Value};
pub use crate::options::{BackendOptions, ConnectOptions, ListenOptions};
pub use crate::registry::BackendRegistry;
