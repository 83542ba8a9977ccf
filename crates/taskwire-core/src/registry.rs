//! 进程级后端注册表。
//!
//! # 设计背景（Why）
//! - scheme 到后端实例的映射在启动阶段写入、之后只读；读路径由多个任务并发访问，
//!   因此采用 `parking_lot::RwLock`，读锁之间互不阻塞；
//! - 写入与读取竞争时，读锁保证读者只会看到完整插入前或插入后的表。
//!
//! # 契约说明（What）
//! - `register`：重复 scheme 返回 `DuplicateScheme`，非法 scheme 返回 `MalformedAddress`；
//! - `get`：不存在时返回 `UnknownScheme`，不触发任何网络访问；
//! - `list_schemes`：按字典序返回已注册的 scheme。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::address::{Address, validate_scheme};
use crate::backend::Backend;
use crate::error::{CommError, ErrorKind, Result, codes};

/// scheme → 后端实例的映射表。
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    /// 创建空注册表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级全局注册表。
    pub fn global() -> &'static BackendRegistry {
        static GLOBAL: OnceLock<BackendRegistry> = OnceLock::new();
        GLOBAL.get_or_init(BackendRegistry::new)
    }

    /// 注册后端。
    pub fn register(&self, scheme: &str, backend: Arc<dyn Backend>) -> Result<()> {
        validate_scheme(scheme)
            .map_err(|reason| CommError::malformed_address(&format!("{scheme}://"), reason))?;
        let mut backends = self.backends.write();
        if backends.contains_key(scheme) {
            return Err(CommError::new(
                ErrorKind::DuplicateScheme,
                codes::REGISTRY_DUPLICATE_SCHEME,
                format!("scheme `{scheme}` is already registered"),
            ));
        }
        backends.insert(scheme.to_owned(), backend);
        tracing::debug!(scheme, "backend registered");
        Ok(())
    }

    /// 查找后端。
    pub fn get(&self, scheme: &str) -> Result<Arc<dyn Backend>> {
        self.backends.read().get(scheme).cloned().ok_or_else(|| {
            CommError::new(
                ErrorKind::UnknownScheme,
                codes::REGISTRY_UNKNOWN_SCHEME,
                format!("no backend registered for scheme `{scheme}`"),
            )
        })
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.backends.read().contains_key(scheme)
    }

    /// 已注册的 scheme 列表。
    pub fn list_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.backends.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.list_schemes())
            .finish()
    }
}

impl Address {
    /// 在注册表中解析该地址对应的后端。
    pub fn resolve(&self, registry: &BackendRegistry) -> Result<Arc<dyn Backend>> {
        registry.get(self.scheme())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connector, ListenerFactory};
    use crate::comm::BoxComm;
    use crate::listener::{CommHandler, Listener};
    use crate::options::{ConnectOptions, ListenOptions};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, location: &str, _: &ConnectOptions) -> Result<BoxComm> {
            Err(CommError::new(
                ErrorKind::ConnectionRefused,
                "test.refused",
                format!("nothing at {location}"),
            ))
        }
    }

    #[async_trait]
    impl ListenerFactory for Unreachable {
        async fn bind(&self, location: &str, _: CommHandler, _: &ListenOptions) -> Result<Listener> {
            Err(CommError::new(
                ErrorKind::ConnectionRefused,
                "test.refused",
                format!("cannot bind {location}"),
            ))
        }
    }

    impl Backend for Unreachable {
        fn scheme(&self) -> &'static str {
            "void"
        }

        fn connector(&self) -> &dyn Connector {
            self
        }

        fn listener_factory(&self) -> &dyn ListenerFactory {
            self
        }
    }

    #[test]
    fn register_get_and_list() {
        let registry = BackendRegistry::new();
        registry.register("void", Arc::new(Unreachable)).expect("register");
        registry.register("alpha", Arc::new(Unreachable)).expect("register");
        assert_eq!(registry.list_schemes(), vec!["alpha", "void"]);
        assert_eq!(registry.get("void").expect("get").scheme(), "void");

        let err = registry
            .register("void", Arc::new(Unreachable))
            .expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::DuplicateScheme);

        let err = registry.get("bogus").expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::UnknownScheme);
    }

    #[test]
    fn address_resolves_through_registry() {
        let registry = BackendRegistry::new();
        registry.register("void", Arc::new(Unreachable)).expect("register");
        let addr = Address::parse("void://somewhere").expect("parse");
        assert!(addr.resolve(&registry).is_ok());
        let addr = Address::parse("bogus://host").expect("parse");
        assert_eq!(
            addr.resolve(&registry).expect_err("unknown").kind(),
            ErrorKind::UnknownScheme
        );
    }

    #[test]
    fn concurrent_reads_during_registration() {
        let registry = Arc::new(BackendRegistry::new());
        registry.register("void", Arc::new(Unreachable)).expect("register");
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        assert!(registry.get("void").is_ok());
                    }
                })
            })
            .collect();
        for i in 0..32 {
            registry
                .register(&format!("extra{i}"), Arc::new(Unreachable))
                .expect("register");
        }
        for reader in readers {
            reader.join().expect("reader");
        }
        assert_eq!(registry.list_schemes().len(), 33);
    }
}
