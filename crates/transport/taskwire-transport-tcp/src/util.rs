use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use taskwire_core::address::{parse_host_port, unparse_address, unparse_host_port};
use taskwire_core::error::Result;

use crate::SCHEME;

/// `tcp://ip:port`；IPv6 由 `SocketAddr` 的 `Display` 加上方括号。
pub(crate) fn format_address(addr: SocketAddr) -> String {
    unparse_address(SCHEME, &addr.to_string())
}

/// 解析监听位置段：缺省端口为 0，空主机绑定所有 IPv4 接口。
pub(crate) fn bind_target(location: &str) -> Result<(String, u16)> {
    if location.is_empty() {
        return Ok((Ipv4Addr::UNSPECIFIED.to_string(), 0));
    }
    let (host, port) = parse_host_port(location, Some(0))?;
    if host.is_empty() {
        return Ok((Ipv4Addr::UNSPECIFIED.to_string(), port));
    }
    Ok((host, port))
}

/// 对外公布的地址：端口取实际绑定值，通配主机替换为 `contact_host` 或回环地址。
pub(crate) fn contact_address(bound: SocketAddr, contact_host: Option<&str>) -> String {
    let host = match (bound.ip(), contact_host) {
        (ip, _) if !ip.is_unspecified() => ip.to_string(),
        (_, Some(host)) => host.to_owned(),
        (IpAddr::V4(_), None) => Ipv4Addr::LOCALHOST.to_string(),
        (IpAddr::V6(_), None) => Ipv6Addr::LOCALHOST.to_string(),
    };
    unparse_address(SCHEME, &unparse_host_port(&host, Some(bound.port())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_host_is_replaced() {
        let bound: SocketAddr = "0.0.0.0:8786".parse().expect("addr");
        assert_eq!(contact_address(bound, None), "tcp://127.0.0.1:8786");
        assert_eq!(contact_address(bound, Some("node-a")), "tcp://node-a:8786");
        let bound: SocketAddr = "[::]:9000".parse().expect("addr");
        assert_eq!(contact_address(bound, None), "tcp://[::1]:9000");
        let bound: SocketAddr = "10.1.2.3:9000".parse().expect("addr");
        assert_eq!(contact_address(bound, Some("ignored")), "tcp://10.1.2.3:9000");
    }

    #[test]
    fn bind_target_defaults() {
        assert_eq!(bind_target("").expect("empty"), ("0.0.0.0".into(), 0));
        assert_eq!(bind_target(":0").expect("no host"), ("0.0.0.0".into(), 0));
        assert_eq!(bind_target("127.0.0.1").expect("no port"), ("127.0.0.1".into(), 0));
        assert_eq!(bind_target("[::1]:7").expect("v6"), ("::1".into(), 7));
    }
}
