use std::io;
use std::time::Duration;

use serde::Deserialize;
use socket2::SockRef;
use tokio::net::TcpStream;

/// `tcp` 后端接受的选项。
///
/// # 契约（What）
/// - `nodelay`：是否关闭 Nagle 算法，默认开启以降低控制消息延迟；
/// - `linger_ms`：`SO_LINGER` 超时，`None` 沿用内核默认；
/// - `contact_host`：监听在通配地址时对外公布的主机名，缺省为回环地址；
/// - 未知键会被拒绝，拼写错误不会被静默忽略。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpOptions {
    pub nodelay: bool,
    pub linger_ms: Option<u64>,
    pub contact_host: Option<String>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            nodelay: true,
            linger_ms: None,
            contact_host: None,
        }
    }
}

impl TcpOptions {
    /// 转换为套接字配置。
    pub fn socket_config(&self) -> TcpSocketConfig {
        TcpSocketConfig::new()
            .with_nodelay(self.nodelay)
            .with_linger(self.linger_ms.map(Duration::from_millis))
    }
}

/// TCP 套接字级配置项，实现对内核行为的显式控制。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 小而频繁的控制消息对延迟敏感，默认关闭 Nagle；
/// - 将“关闭时最多等待多久”显式配置化，避免调用方直接操作 `socket2`。
///
/// ## 核心逻辑（How）
/// - `linger` 为 `Some(dur)` 时通过 `SockRef::set_linger` 写入 `SO_LINGER`，
///   `close`/`drop` 阶段在 `dur` 后仍未发送完就发送 RST；
/// - `nodelay` 通过 Tokio 的 `set_nodelay` 落地。
///
/// ## 注意事项（Trade-offs）
/// - `SO_LINGER` 在 Linux 上取整到秒，过小的取值可能导致尾部数据被丢弃。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub(crate) fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if self.linger.is_some() {
            SockRef::from(stream).set_linger(self.linger)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwire_core::options::BackendOptions;

    #[test]
    fn defaults_and_overrides() {
        let parsed: TcpOptions = BackendOptions::new().parse("tcp").expect("defaults");
        assert_eq!(parsed, TcpOptions::default());
        assert!(parsed.socket_config().nodelay());

        let parsed: TcpOptions = BackendOptions::new()
            .set("nodelay", false)
            .set("linger_ms", 1500)
            .parse("tcp")
            .expect("overrides");
        let config = parsed.socket_config();
        assert!(!config.nodelay());
        assert_eq!(config.linger(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = BackendOptions::new()
            .set("no_delay", true)
            .parse::<TcpOptions>("tcp")
            .expect_err("unknown");
        assert_eq!(err.kind(), taskwire_core::ErrorKind::InvalidOptions);
    }
}
