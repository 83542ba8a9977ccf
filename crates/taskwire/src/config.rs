//! 传输配置面：把调用方已经反序列化好的文档转换为建连/监听选项。
//!
//! # 设计背景（Why）
//! - 配置文件的读取（路径、格式、热更新）属于宿主；本模块只接管“文档 → 选项”这一步，
//!   因此任何 serde 支持的格式都可以喂进来；
//! - 各后端的选项仍以不透明对象下发，由后端自己的强类型结构校验，门面不重复定义字段。
//!
//! # 文档形状（What）
//! ```text
//! {
//!   "connect_timeout_ms": 5000,
//!   "limits": { "max_header_len": 1048576, "max_payloads": 1024, "max_payload_bytes": 1073741824 },
//!   "backends": {
//!     "tcp":    { "nodelay": true },
//!     "fabric": { "chunk_size": 1048576, "registration": "lazy" }
//!   }
//! }
//! ```
//! 所有字段都有默认值，空文档等价于 `TransportConfig::default()`。

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use taskwire_core::address::Address;
use taskwire_core::error::{CommError, Result};
use taskwire_core::frame::FrameLimits;
use taskwire_core::options::{BackendOptions, ConnectOptions, ListenOptions};

/// 门面级传输配置。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// 建连超时；缺省表示不限时。
    pub connect_timeout_ms: Option<u64>,
    /// 解码上限，同时作用于建连与监听两侧。
    pub limits: FrameLimits,
    /// scheme → 后端自定义选项。
    pub backends: BTreeMap<String, Map<String, JsonValue>>,
}

impl TransportConfig {
    /// 由 JSON 文档构造，未知字段或类型错误返回 `InvalidOptions`。
    pub fn from_json(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| CommError::invalid_options("taskwire", &err).with_source(err))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// 指定 scheme 的后端选项；未配置时为空对象。
    pub fn backend_options(&self, scheme: &str) -> BackendOptions {
        self.backends
            .get(scheme)
            .map(|entries| {
                entries
                    .iter()
                    .fold(BackendOptions::new(), |options, (key, value)| {
                        options.set(key.clone(), value.clone())
                    })
            })
            .unwrap_or_default()
    }

    /// 为目标地址生成建连选项。
    pub fn connect_options(&self, address: &str) -> Result<ConnectOptions> {
        let scheme = Address::parse(address)?.scheme().to_owned();
        let mut options = ConnectOptions::new()
            .with_limits(self.limits)
            .with_backend_options(self.backend_options(&scheme));
        if let Some(timeout) = self.connect_timeout() {
            options = options.with_timeout(timeout);
        }
        Ok(options)
    }

    /// 为监听地址生成监听选项。
    pub fn listen_options(&self, address: &str) -> Result<ListenOptions> {
        let scheme = Address::parse(address)?.scheme().to_owned();
        Ok(ListenOptions::new()
            .with_limits(self.limits)
            .with_backend_options(self.backend_options(&scheme)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskwire_core::error::ErrorKind;

    #[test]
    fn empty_document_is_default() {
        let config = TransportConfig::from_json(json!({})).expect("empty");
        assert_eq!(config, TransportConfig::default());
        assert!(config.connect_timeout().is_none());
        assert!(config.backend_options("tcp").is_empty());
    }

    #[test]
    fn backend_section_reaches_only_its_scheme() {
        let config = TransportConfig::from_json(json!({
            "connect_timeout_ms": 250,
            "limits": { "max_payloads": 8, "max_payload_bytes": 1024 },
            "backends": { "fabric": { "chunk_size": 65536 } }
        }))
        .expect("config");

        let options = config.connect_options("fabric://10.0.0.1:7000").expect("fabric");
        assert_eq!(options.backend().get("chunk_size"), Some(&json!(65536)));
        assert_eq!(options.limits().max_payloads, 8);
        assert_eq!(options.limits().max_payload_bytes, 1024);
        assert_eq!(options.limits().max_header_len, FrameLimits::default().max_header_len);
        assert!(options.context().deadline().is_some());

        let options = config.listen_options("tcp://0.0.0.0:0").expect("tcp");
        assert!(options.backend().is_empty());
    }

    #[test]
    fn unknown_field_is_invalid_options() {
        let err = TransportConfig::from_json(json!({ "conect_timeout_ms": 1 })).expect_err("typo");
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
    }

    #[test]
    fn malformed_address_is_reported() {
        let err = TransportConfig::default()
            .connect_options("localhost:8786")
            .expect_err("no scheme");
        assert_eq!(err.kind(), ErrorKind::MalformedAddress);
    }
}
