use std::io;

use taskwire_core::error::{CommError, ErrorKind};

/// 描述一次底层操作对应的稳定错误码、默认文案与兜底分类。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
    /// 无法从 `io::ErrorKind` 判定时使用的分类：建连阶段视为拒绝，读写阶段视为重置。
    pub fallback: ErrorKind,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.resolve_failed",
    message: "tcp resolve",
    fallback: ErrorKind::ConnectionRefused,
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.bind_failed",
    message: "tcp bind",
    fallback: ErrorKind::ConnectionRefused,
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.accept_failed",
    message: "tcp accept",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.connect_failed",
    message: "tcp connect",
    fallback: ErrorKind::ConnectionRefused,
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.read_failed",
    message: "tcp read",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.write_failed",
    message: "tcp write",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const WRITE_VECTORED: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.writev_failed",
    message: "tcp write_vectored",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "taskwire.transport.tcp.configure_failed",
    message: "tcp configure",
    fallback: ErrorKind::ConnectionRefused,
};

/// 将 IO 错误映射到传输层错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CommError {
    CommError::new(
        categorize_io_error(kind, &error),
        kind.code,
        format!("{}: {}", kind.message, error),
    )
    .with_source(error)
}

fn categorize_io_error(kind: OperationKind, error: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match error.kind() {
        Io::TimedOut => ErrorKind::Timeout,
        Io::ConnectionRefused | Io::AddrNotAvailable | Io::AddrInUse | Io::PermissionDenied => {
            ErrorKind::ConnectionRefused
        }
        Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::UnexpectedEof
        | Io::WriteZero => ErrorKind::ConnectionReset,
        _ => kind.fallback,
    }
}
