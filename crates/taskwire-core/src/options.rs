//! 建连与监听选项。
//!
//! # 设计背景（Why）
//! - 通用部分（调用上下文、设备内存分配能力、帧上限）对所有后端含义相同，以强类型字段承载；
//! - 介质特有的选项以不透明的 JSON 对象传入，由后端反序列化为各自的强类型结构并校验，
//!   未知键或类型错误统一报告为 `InvalidOptions`。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::context::CallContext;
use crate::error::{CommError, Result};
use crate::frame::FrameLimits;
use crate::memory::DeviceAllocator;

/// 后端自定义选项：一个 JSON 对象。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendOptions {
    entries: Map<String, JsonValue>,
}

impl BackendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由 JSON 值构造；非对象输入返回 `InvalidOptions`。
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(entries) => Ok(Self { entries }),
            JsonValue::Null => Ok(Self::default()),
            other => Err(CommError::invalid_options(
                "*",
                format_args!("expected a JSON object, got `{other}`"),
            )),
        }
    }

    /// 设置一个键。
    pub fn set(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 反序列化为后端的强类型选项。
    ///
    /// 目标类型应标注 `#[serde(deny_unknown_fields)]`，拼写错误的键才会被拒绝。
    pub fn parse<T: DeserializeOwned>(&self, scheme: &str) -> Result<T> {
        serde_json::from_value(JsonValue::Object(self.entries.clone()))
            .map_err(|err| CommError::invalid_options(scheme, &err).with_source(err))
    }
}

/// 建连选项。
#[derive(Clone, Default)]
pub struct ConnectOptions {
    context: CallContext,
    device: Option<Arc<dyn DeviceAllocator>>,
    limits: FrameLimits,
    backend: BackendOptions,
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建连使用的调用上下文。
    pub fn with_context(mut self, context: CallContext) -> Self {
        self.context = context;
        self
    }

    /// 以相对超时设置建连上下文。
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_context(CallContext::with_timeout(timeout))
    }

    /// 接收设备负载时使用的分配器。
    pub fn with_device(mut self, device: Arc<dyn DeviceAllocator>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_backend_options(mut self, backend: BackendOptions) -> Self {
        self.backend = backend;
        self
    }

    /// 追加单个后端选项。
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.backend = self.backend.set(key, value);
        self
    }

    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceAllocator>> {
        self.device.as_ref()
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    pub fn backend(&self) -> &BackendOptions {
        &self.backend
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("context", &self.context)
            .field("device", &self.device.is_some())
            .field("limits", &self.limits)
            .field("backend", &self.backend)
            .finish()
    }
}

/// 监听选项。
#[derive(Clone, Default)]
pub struct ListenOptions {
    device: Option<Arc<dyn DeviceAllocator>>,
    limits: FrameLimits,
    backend: BackendOptions,
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceAllocator>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_limits(mut self, limits: FrameLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_backend_options(mut self, backend: BackendOptions) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.backend = self.backend.set(key, value);
        self
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceAllocator>> {
        self.device.as_ref()
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    pub fn backend(&self) -> &BackendOptions {
        &self.backend
    }
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenOptions")
            .field("device", &self.device.is_some())
            .field("limits", &self.limits)
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        #[serde(default)]
        nodelay: bool,
    }

    #[test]
    fn typed_parse_and_unknown_key() {
        let ok = BackendOptions::new().set("nodelay", true);
        assert_eq!(ok.parse::<Sample>("tcp").expect("parse"), Sample { nodelay: true });

        let err = BackendOptions::new()
            .set("nodelai", true)
            .parse::<Sample>("tcp")
            .expect_err("typo");
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
    }

    #[test]
    fn non_object_is_rejected() {
        let err = BackendOptions::from_json(serde_json::json!([1, 2])).expect_err("array");
        assert_eq!(err.kind(), ErrorKind::InvalidOptions);
        assert!(BackendOptions::from_json(JsonValue::Null).expect("null").is_empty());
    }
}
