//! 传输层统一错误域。
//!
//! # 设计背景（Why）
//! - TCP、Fabric 与进程内三种介质产生的故障差异巨大，但调用方（调度器、Worker、客户端）
//!   只关心“能否重试、连接是否仍可用”，因此所有实现都必须把故障归一到 [`ErrorKind`]。
//! - 每个错误同时携带稳定错误码 `code`（`taskwire.<域>.<语义>`），日志与告警据此聚合，
//!   不依赖易变的自然语言消息。
//!
//! # 契约说明（What）
//! - [`CommError::kind`] 是机器可读的分类，覆盖地址、注册表、建连、读写、零拷贝注册等环节；
//! - [`ErrorKind::is_transport_fault`] 为真时，发生该错误的 Comm 必须转入关闭态；
//! - 错误可安全跨线程移动（`Send + Sync + 'static`）。

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// 底层原因的装箱类型。
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 传输层错误分类。
///
/// # 教案式说明
/// - **意图 (Why)**：将三种介质的异构故障折叠成一个封闭集合，调用方可穷举匹配；
/// - **契约 (What)**：前三项为同步的本地错误（地址/注册表），其余在 IO 过程中产生；
///   `Cancelled` 与 `InvalidOptions` 分别对应调用方主动取消与后端选项校验失败；
/// - **风险 (Trade-offs)**：分类粒度刻意保持粗糙，需要细节时请查看 `code` 与 `source`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 地址缺少 `scheme://` 前缀或位置段非法。
    MalformedAddress,
    /// 注册表中不存在该 scheme。
    UnknownScheme,
    /// 同一 scheme 被重复注册。
    DuplicateScheme,
    /// 对端拒绝或不可达。
    ConnectionRefused,
    /// 截止时间到期。
    Timeout,
    /// 传输级握手失败（协议不匹配、对端提前断开等）。
    HandshakeFailed,
    /// 传输在读写过程中被重置或截断。
    ConnectionReset,
    /// 帧或头部损坏。
    DecodeError,
    /// 对端已干净地关闭会话。
    StreamClosed,
    /// 在本端关闭后继续操作。
    CommClosed,
    /// 零拷贝缓冲注册失败。
    BufferRegistrationFailed,
    /// 调用方通过取消令牌终止了操作。
    Cancelled,
    /// 后端选项无法通过校验。
    InvalidOptions,
}

impl ErrorKind {
    /// 该错误是否意味着底层会话已不可用，需要把 Comm 转为关闭态。
    pub fn is_transport_fault(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionReset
                | ErrorKind::DecodeError
                | ErrorKind::StreamClosed
                | ErrorKind::Timeout
                | ErrorKind::Cancelled
        )
    }

    /// 是否值得由更高层在重新建连后重试。
    ///
    /// 本层从不自动重试，该判定只作为给上层的提示。
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionRefused
                | ErrorKind::Timeout
                | ErrorKind::ConnectionReset
                | ErrorKind::StreamClosed
        )
    }

    /// 稳定的蛇形名称，用于日志字段。
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedAddress => "malformed_address",
            ErrorKind::UnknownScheme => "unknown_scheme",
            ErrorKind::DuplicateScheme => "duplicate_scheme",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Timeout => "timeout",
            ErrorKind::HandshakeFailed => "handshake_failed",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::DecodeError => "decode_error",
            ErrorKind::StreamClosed => "stream_closed",
            ErrorKind::CommClosed => "comm_closed",
            ErrorKind::BufferRegistrationFailed => "buffer_registration_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidOptions => "invalid_options",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 传输层跨 crate 共享的错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 与 `kind` 搭配稳定错误码，既能驱动程序化处理，又能在日志中精确定位失败的操作；
/// - 保留底层 `source`，排障时可以看到原始 `io::Error` 或编解码错误。
///
/// ## 契约 (What)
/// - `code`：`'static` 字符串，各后端在 `OperationKind` 表中登记；
/// - `message`：面向排障人员的描述，不包含敏感内容；
/// - **后置条件**：构造后不可变，`with_source` 以 Builder 风格附加原因。
#[derive(Debug, Error)]
#[error("{message} [{code}]")]
pub struct CommError {
    kind: ErrorKind,
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    source: Option<ErrorCause>,
}

impl CommError {
    /// 构造错误。
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// 附带底层原因。
    pub fn with_source(mut self, source: impl Into<ErrorCause>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// 错误分类。
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 地址语法错误。
    pub fn malformed_address(address: &str, reason: &str) -> Self {
        Self::new(
            ErrorKind::MalformedAddress,
            codes::ADDRESS_MALFORMED,
            format!("malformed address `{address}`: {reason}"),
        )
    }

    /// 本端已关闭。
    pub fn comm_closed(operation: &str) -> Self {
        Self::new(
            ErrorKind::CommClosed,
            codes::COMM_CLOSED,
            format!("{operation} on closed comm"),
        )
    }

    /// 以统一错误码构造解码错误，供各后端的帧读取路径复用。
    pub fn decode(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::DecodeError, codes::FRAME_DECODE, message)
    }

    /// 对端干净关闭。
    pub fn stream_closed(operation: &str) -> Self {
        Self::new(
            ErrorKind::StreamClosed,
            codes::STREAM_CLOSED,
            format!("{operation}: stream closed by peer"),
        )
    }

    /// 后端选项校验失败。
    pub fn invalid_options(scheme: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidOptions,
            codes::OPTIONS_INVALID,
            format!("invalid options for `{scheme}` backend: {detail}"),
        )
    }
}

/// 核心层登记的稳定错误码。
///
/// 后端自有的错误码在各自 crate 的 `error.rs` 中登记，命名保持 `taskwire.transport.<介质>.*`。
pub mod codes {
    pub const ADDRESS_MALFORMED: &str = "taskwire.address.malformed";
    pub const REGISTRY_UNKNOWN_SCHEME: &str = "taskwire.registry.unknown_scheme";
    pub const REGISTRY_DUPLICATE_SCHEME: &str = "taskwire.registry.duplicate_scheme";
    pub const COMM_CLOSED: &str = "taskwire.comm.closed";
    pub const STREAM_CLOSED: &str = "taskwire.comm.stream_closed";
    pub const CALL_TIMEOUT: &str = "taskwire.comm.timeout";
    pub const CALL_CANCELLED: &str = "taskwire.comm.cancelled";
    pub const FRAME_ENCODE: &str = "taskwire.frame.encode_failed";
    pub const FRAME_DECODE: &str = "taskwire.frame.decode_failed";
    pub const MEMORY_ALLOCATE: &str = "taskwire.memory.allocate_failed";
    pub const MEMORY_COPY: &str = "taskwire.memory.copy_failed";
    pub const BRIDGE_MISMATCH: &str = "taskwire.bridge.mismatch";
    pub const OPTIONS_INVALID: &str = "taskwire.options.invalid";
}

/// 传输层通用 `Result` 别名。
pub type Result<T, E = CommError> = std::result::Result<T, E>;
