//! 地址解析：`<scheme>://<location>`。
//!
//! # 设计初衷（Why）
//! - 调用方只面对字符串地址，由 scheme 决定交给哪个后端；位置段的语法完全由后端定义，
//!   因此本模块只做纯语法切分，不做任何网络访问。
//! - 解析必须可逆：`unparse_address(parse_address(s)) == s`，地址因此可以安全地在日志、
//!   握手与配置之间来回传递。
//!
//! # 契约说明（What）
//! - scheme 非空，首字符为 ASCII 字母，其余字符限定为字母、数字与 `+ - .`；
//! - 位置段原样保留（可以为空，例如进程内后端的自动分配）；
//! - `host:port` 的辅助解析覆盖 IPv4、带方括号的 IPv6 与主机名。

use std::fmt;
use std::str::FromStr;

use crate::error::{CommError, Result};

const SEPARATOR: &str = "://";

/// 已解析的传输地址，构造后不可变。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    scheme: String,
    location: String,
}

impl Address {
    /// 由 scheme 与位置段构造地址，并校验 scheme 语法。
    pub fn new(scheme: impl Into<String>, location: impl Into<String>) -> Result<Self> {
        let scheme = scheme.into();
        let location = location.into();
        if let Err(reason) = validate_scheme(&scheme) {
            return Err(CommError::malformed_address(
                &unparse_address(&scheme, &location),
                reason,
            ));
        }
        Ok(Self { scheme, location })
    }

    /// 解析完整地址字符串。
    pub fn parse(address: &str) -> Result<Self> {
        let Some((scheme, location)) = address.split_once(SEPARATOR) else {
            return Err(CommError::malformed_address(
                address,
                "missing `scheme://` prefix",
            ));
        };
        validate_scheme(scheme).map_err(|reason| CommError::malformed_address(address, reason))?;
        Ok(Self {
            scheme: scheme.to_owned(),
            location: location.to_owned(),
        })
    }

    /// 传输协议标识。
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// 后端自定义的位置段。
    pub fn location(&self) -> &str {
        &self.location
    }

    /// 拆解为 `(scheme, location)`。
    pub fn into_parts(self) -> (String, String) {
        (self.scheme, self.location)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.scheme, SEPARATOR, self.location)
    }
}

impl FromStr for Address {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// 将地址切分为 `(scheme, location)`。
pub fn parse_address(address: &str) -> Result<(String, String)> {
    Address::parse(address).map(Address::into_parts)
}

/// [`parse_address`] 的逆操作。
pub fn unparse_address(scheme: &str, location: &str) -> String {
    format!("{scheme}{SEPARATOR}{location}")
}

/// 解析 `host[:port]` 形式的位置段。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - TCP 与 Fabric 后端共享同一套主机/端口语法，集中实现避免各自处理 IPv6 方括号的细节。
///
/// ## 契约 (What)
/// - `[::1]:8786`、`127.0.0.1:8786`、`node-a:8786` 均可解析；
/// - 无方括号且包含多个 `:` 的位置段视为不带端口的 IPv6 地址；
/// - 缺少端口时使用 `default_port`，若其为 `None` 则返回 `MalformedAddress`。
pub fn parse_host_port(location: &str, default_port: Option<u16>) -> Result<(String, u16)> {
    let missing_port = || {
        CommError::malformed_address(location, "missing port and no default available")
    };
    let parse_port = |raw: &str| {
        raw.parse::<u16>()
            .map_err(|_| CommError::malformed_address(location, "invalid port"))
    };

    if let Some(rest) = location.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(CommError::malformed_address(location, "unterminated `[`"));
        };
        let port = match tail {
            "" => default_port.ok_or_else(missing_port)?,
            _ => match tail.strip_prefix(':') {
                Some(raw) => parse_port(raw)?,
                None => {
                    return Err(CommError::malformed_address(
                        location,
                        "unexpected characters after `]`",
                    ));
                }
            },
        };
        return Ok((host.to_owned(), port));
    }

    if location.matches(':').count() > 1 {
        return Ok((location.to_owned(), default_port.ok_or_else(missing_port)?));
    }

    match location.split_once(':') {
        Some((host, raw)) => Ok((host.to_owned(), parse_port(raw)?)),
        None => Ok((location.to_owned(), default_port.ok_or_else(missing_port)?)),
    }
}

/// 将主机与端口格式化为位置段；IPv6 主机自动加方括号。
pub fn unparse_host_port(host: &str, port: Option<u16>) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_owned()
    };
    match port {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

pub(crate) fn validate_scheme(scheme: &str) -> std::result::Result<(), &'static str> {
    let mut chars = scheme.chars();
    match chars.next() {
        None => return Err("empty scheme"),
        Some(first) if !first.is_ascii_alphabetic() => {
            return Err("scheme must start with an ASCII letter");
        }
        Some(_) => {}
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        Ok(())
    } else {
        Err("scheme contains invalid characters")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn parses_scheme_and_location() {
        let (scheme, location) = parse_address("tcp://127.0.0.1:8786").expect("parse");
        assert_eq!(scheme, "tcp");
        assert_eq!(location, "127.0.0.1:8786");
    }

    #[test]
    fn missing_separator_is_malformed() {
        let err = parse_address("127.0.0.1:8786").expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::MalformedAddress);
        let err = parse_address("://host").expect_err("empty scheme");
        assert_eq!(err.kind(), ErrorKind::MalformedAddress);
        let err = parse_address("1tcp://host").expect_err("digit scheme");
        assert_eq!(err.kind(), ErrorKind::MalformedAddress);
    }

    #[test]
    fn empty_location_is_allowed() {
        let address = Address::parse("inproc://").expect("parse");
        assert_eq!(address.location(), "");
        assert_eq!(address.to_string(), "inproc://");
    }

    #[test]
    fn host_port_variants() {
        assert_eq!(
            parse_host_port("127.0.0.1:80", None).expect("v4"),
            ("127.0.0.1".to_owned(), 80)
        );
        assert_eq!(
            parse_host_port("[::1]:81", None).expect("v6"),
            ("::1".to_owned(), 81)
        );
        assert_eq!(
            parse_host_port("::1", Some(0)).expect("bare v6"),
            ("::1".to_owned(), 0)
        );
        assert_eq!(
            parse_host_port("node-a", Some(8786)).expect("default"),
            ("node-a".to_owned(), 8786)
        );
        assert_eq!(
            parse_host_port("node-a", None).expect_err("no port").kind(),
            ErrorKind::MalformedAddress
        );
        assert_eq!(
            parse_host_port("node-a:http", None)
                .expect_err("bad port")
                .kind(),
            ErrorKind::MalformedAddress
        );
    }

    #[test]
    fn host_port_round_trip() {
        assert_eq!(unparse_host_port("::1", Some(9)), "[::1]:9");
        assert_eq!(unparse_host_port("10.0.0.1", Some(9)), "10.0.0.1:9");
        assert_eq!(unparse_host_port("node", None), "node");
    }

    proptest! {
        #[test]
        fn parse_then_unparse_is_identity(
            scheme in "[a-z][a-z0-9+.-]{0,8}",
            location in "[a-zA-Z0-9:/._\\[\\]-]{0,32}",
        ) {
            let text = unparse_address(&scheme, &location);
            let (parsed_scheme, parsed_location) = parse_address(&text).expect("valid address");
            prop_assert_eq!(&parsed_scheme, &scheme);
            prop_assert_eq!(&parsed_location, &location);
            prop_assert_eq!(unparse_address(&parsed_scheme, &parsed_location), text);
        }
    }
}
