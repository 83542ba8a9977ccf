use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::SockRef;
use taskwire_core::address::{parse_host_port, unparse_address, unparse_host_port};
use taskwire_core::error::Result;
use tokio::net::TcpStream;

use crate::SCHEME;

/// 带外通道套接字缓冲的下限。
const MIN_SOCKET_BUFFER: usize = 256 * 1024;

pub(crate) fn format_address(addr: SocketAddr) -> String {
    unparse_address(SCHEME, &addr.to_string())
}

/// 监听位置段：缺省端口为 0，空主机绑定所有 IPv4 接口。
pub(crate) fn bind_target(location: &str) -> Result<(String, u16)> {
    let (host, port) = if location.is_empty() {
        (String::new(), 0)
    } else {
        parse_host_port(location, Some(0))?
    };
    if host.is_empty() {
        return Ok((Ipv4Addr::UNSPECIFIED.to_string(), port));
    }
    Ok((host, port))
}

pub(crate) fn contact_address(bound: SocketAddr, contact_host: Option<&str>) -> String {
    let host = match (bound.ip(), contact_host) {
        (ip, _) if !ip.is_unspecified() => ip.to_string(),
        (_, Some(host)) => host.to_owned(),
        (IpAddr::V4(_), None) => Ipv4Addr::LOCALHOST.to_string(),
        (IpAddr::V6(_), None) => Ipv6Addr::LOCALHOST.to_string(),
    };
    unparse_address(SCHEME, &unparse_host_port(&host, Some(bound.port())))
}

/// 关闭 Nagle，并把收发缓冲提升到至少一个分块（不低于 256 KiB），从不调小内核默认值。
pub(crate) fn configure_stream(stream: &TcpStream, chunk_size: usize) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let wanted = chunk_size.max(MIN_SOCKET_BUFFER);
    let socket = SockRef::from(stream);
    if socket.send_buffer_size()? < wanted {
        socket.set_send_buffer_size(wanted)?;
    }
    if socket.recv_buffer_size()? < wanted {
        socket.set_recv_buffer_size(wanted)?;
    }
    Ok(())
}
