//! Comm：双向分帧通道的统一契约。
//!
//! # 设计背景（Why）
//! - 调度器、Worker 与客户端只通过 `write`/`read` 交换消息，介质差异（TCP 字节流、Fabric
//!   远程写、进程内直接移交）全部收敛在实现内部；
//! - 生命周期语义必须在各后端一致：`close` 幂等、关闭后操作返回 `CommClosed`、
//!   传输级故障使 Comm 进入关闭态。[`CommState`] 把这部分逻辑抽成可复用的状态机，
//!   后端只需在每个挂起点经过 [`CommState::run`]。
//!
//! # 契约说明（What）
//! - 同一 Comm 上允许一个读者与一个写者并发；多个写者（或读者）由实现内部的锁串行化；
//! - 每个 Comm 内消息保序，跨 Comm 不作任何保证；
//! - `write` 返回写入线路的字节数（进程内后端返回 0，因为没有序列化）。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{CallContext, Cancellation, run_with_context};
use crate::error::{CommError, Result};
use crate::message::Message;

/// 后端负载的搬运方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// 负载紧随头部写入字节流。
    Stream,
    /// 进程内直接移交，不经过序列化。
    InMemory,
    /// 负载经注册的内存区域以 put 原语搬运。
    RemoteDirect,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::Stream => "stream",
            TransferMode::InMemory => "in_memory",
            TransferMode::RemoteDirect => "remote_direct",
        }
    }
}

/// 后端附加信息。
///
/// # 契约 (What)
/// - `transfer_mode`：所有后端必填；
/// - `chunk_size`：Fabric 协商后的分块大小，其它后端为 `None`；
/// - `peer_endpoint`：Fabric 对端端点标识，其它后端为 `None`。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraInfo {
    pub transfer_mode: TransferMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_endpoint: Option<u64>,
}

impl ExtraInfo {
    /// 仅包含搬运方式的附加信息。
    pub fn new(transfer_mode: TransferMode) -> Self {
        Self {
            transfer_mode,
            chunk_size: None,
            peer_endpoint: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_peer_endpoint(mut self, endpoint: u64) -> Self {
        self.peer_endpoint = Some(endpoint);
        self
    }

    /// 渲染为 JSON 对象，只输出存在的键。
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "transfer_mode".to_owned(),
            serde_json::Value::from(self.transfer_mode.as_str()),
        );
        if let Some(chunk_size) = self.chunk_size {
            map.insert("chunk_size".to_owned(), serde_json::Value::from(chunk_size));
        }
        if let Some(endpoint) = self.peer_endpoint {
            map.insert("peer_endpoint".to_owned(), serde_json::Value::from(endpoint));
        }
        serde_json::Value::Object(map)
    }
}

/// 一条已建立的会话。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以对象安全的 trait 表达会话，注册表与监听器可以统一处理 `Box<dyn Comm>`；
///
/// ## 契约 (What)
/// - `write_with`：挂起直到消息完整交给传输；返回线路字节数；
/// - `read_with`：挂起直到头部与全部声明的负载到齐；对端干净关闭返回 `StreamClosed`；
/// - `close`：优雅关闭，幂等；之后的 `read`/`write` 返回 `CommClosed`；
/// - `abort`：立即关闭，不做优雅握手，挂起中的操作以 `CommClosed` 返回；
/// - 地址均为完整的 `scheme://location` 字符串，客户端的 `peer_address` 等于服务端的
///   `local_address`，反之亦然。
///
/// ## 注意事项 (Trade-offs)
/// - 传输故障（见 [`crate::error::ErrorKind::is_transport_fault`]）之后 Comm 不可恢复，
///   本层不做重试。
#[async_trait]
pub trait Comm: Send + Sync + fmt::Debug {
    /// 在给定上下文下写入一条消息。
    async fn write_with(&self, message: &Message, ctx: &CallContext) -> Result<usize>;

    /// 在给定上下文下读取一条消息。
    async fn read_with(&self, ctx: &CallContext) -> Result<Message>;

    /// 不限时写入。
    async fn write(&self, message: &Message) -> Result<usize> {
        self.write_with(message, &CallContext::default()).await
    }

    /// 不限时读取。
    async fn read(&self) -> Result<Message> {
        self.read_with(&CallContext::default()).await
    }

    /// 优雅关闭；重复调用无副作用。
    async fn close(&self) -> Result<()>;

    /// 立即关闭。
    fn abort(&self);

    /// 是否已关闭。
    fn closed(&self) -> bool;

    /// 本端地址。
    fn local_address(&self) -> &str;

    /// 对端地址。
    fn peer_address(&self) -> &str;

    /// 服务端 Comm 所属监听器对外公布的地址；客户端 Comm 为 `None`。
    fn contact_address(&self) -> Option<&str>;

    /// 后端附加信息。
    fn extra_info(&self) -> &ExtraInfo;

    /// 可跨任务持有的关闭句柄。
    fn close_handle(&self) -> CloseHandle;
}

/// 装箱的 Comm。
pub type BoxComm = Box<dyn Comm>;

#[derive(Debug, Default)]
struct StateInner {
    closed: AtomicBool,
    signal: Cancellation,
}

/// Comm 的关闭状态机。
///
/// # 逻辑 (How)
/// - `closed` 标志保证关闭只发生一次；
/// - `signal` 在关闭时触发，正在挂起的读写通过 `select!` 立即返回 `CommClosed`；
/// - [`CommState::run`] 在操作失败且错误属于传输故障时把 Comm 转为关闭态。
#[derive(Clone, Debug, Default)]
pub struct CommState {
    inner: Arc<StateInner>,
}

impl CommState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 标记关闭并唤醒挂起的操作；返回 `true` 表示本次调用完成了关闭。
    pub fn mark_closed(&self) -> bool {
        let first = self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.signal.cancel();
        }
        first
    }

    /// 已关闭时返回 `CommClosed`。
    pub fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.is_closed() {
            return Err(CommError::comm_closed(operation));
        }
        Ok(())
    }

    /// 派生关闭句柄。
    pub fn handle(&self) -> CloseHandle {
        CloseHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 等待关闭信号。
    pub async fn wait_closed(&self) {
        self.inner.signal.cancelled().await
    }

    /// 在关闭信号、调用上下文与业务 Future 之间竞速执行一次操作。
    pub async fn run<F, T>(&self, ctx: &CallContext, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.ensure_open(operation)?;
        let result = tokio::select! {
            biased;
            _ = self.inner.signal.cancelled() => Err(CommError::comm_closed(operation)),
            result = run_with_context(ctx, operation, future) => result,
        };
        if let Err(err) = &result
            && err.kind().is_transport_fault()
            && self.mark_closed()
        {
            tracing::debug!(
                operation,
                kind = %err.kind(),
                code = err.code(),
                "comm closed after transport fault"
            );
        }
        result
    }
}

/// 从 Comm 之外触发关闭的句柄。
///
/// 监听器在处理器失败时借助它关闭对应会话；句柄不持有底层传输资源。
#[derive(Clone, Debug)]
pub struct CloseHandle {
    inner: Arc<StateInner>,
}

impl CloseHandle {
    /// 关闭 Comm；返回 `true` 表示本次调用完成了关闭。
    pub fn close(&self) -> bool {
        let first = self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.signal.cancel();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
