use std::io;

use taskwire_core::error::{CommError, ErrorKind};

/// 一次底层操作对应的稳定错误码、默认文案与兜底分类。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
    pub fallback: ErrorKind,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.resolve_failed",
    message: "fabric resolve",
    fallback: ErrorKind::ConnectionRefused,
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.bind_failed",
    message: "fabric bind",
    fallback: ErrorKind::ConnectionRefused,
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.accept_failed",
    message: "fabric accept",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.connect_failed",
    message: "fabric connect",
    fallback: ErrorKind::ConnectionRefused,
};
pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.handshake_failed",
    message: "fabric handshake",
    fallback: ErrorKind::HandshakeFailed,
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.read_failed",
    message: "fabric read",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const PUT: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.put_failed",
    message: "fabric put",
    fallback: ErrorKind::ConnectionReset,
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "taskwire.transport.fabric.configure_failed",
    message: "fabric configure",
    fallback: ErrorKind::ConnectionRefused,
};

pub(crate) const CODE_REGISTRATION: &str = "taskwire.transport.fabric.registration_failed";
pub(crate) const CODE_PROTOCOL: &str = "taskwire.transport.fabric.protocol_violation";

/// 将 IO 错误映射到传输层错误分类。
///
/// 握手阶段的 EOF、重置一律视为握手失败：此时会话尚未建立，调用方看到的应是
/// “对端不是可用的 Fabric 端点”。
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
        _ if kind.fallback == ErrorKind::HandshakeFailed => ErrorKind::HandshakeFailed,
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

/// 握手协议错误（魔数、版本、长度不符）。
pub(crate) fn handshake_failed(detail: impl Into<String>) -> CommError {
    CommError::new(
        ErrorKind::HandshakeFailed,
        HANDSHAKE.code,
        format!("fabric handshake: {}", detail.into()),
    )
}

/// 缓冲注册失败。
pub(crate) fn registration_failed(detail: impl Into<String>) -> CommError {
    CommError::new(
        ErrorKind::BufferRegistrationFailed,
        CODE_REGISTRATION,
        format!("fabric registration: {}", detail.into()),
    )
}

/// 已建立会话上的协议违例，按解码错误处理并关闭 Comm。
pub(crate) fn protocol_violation(detail: impl Into<String>) -> CommError {
    CommError::new(ErrorKind::DecodeError, CODE_PROTOCOL, detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_io_errors_stay_handshake_failures() {
        let err = map_io_error(HANDSHAKE, io::ErrorKind::UnexpectedEof.into());
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed);
        assert_eq!(err.code(), HANDSHAKE.code);

        let err = map_io_error(HANDSHAKE, io::ErrorKind::TimedOut.into());
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn session_io_errors_follow_tcp_mapping() {
        assert_eq!(
            map_io_error(READ, io::ErrorKind::UnexpectedEof.into()).kind(),
            ErrorKind::ConnectionReset
        );
        assert_eq!(
            map_io_error(CONNECT, io::ErrorKind::ConnectionRefused.into()).kind(),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            map_io_error(CONNECT, io::Error::other("weird")).kind(),
            ErrorKind::ConnectionRefused
        );
    }

    #[test]
    fn protocol_violation_is_transport_fault() {
        assert!(protocol_violation("bad op").kind().is_transport_fault());
        assert!(!registration_failed("pinned").kind().is_transport_fault());
    }
}
