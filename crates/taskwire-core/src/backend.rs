//! 后端能力集合：Connector 与 ListenerFactory。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每种介质只需提供“主动建连”与“被动监听”两项能力，注册表按 scheme 分派；
//! - 以 trait 对象承载，调用方可以在运行期注册自定义后端，无需改动核心枚举。
//!
//! ## 契约（What）
//! - `Connector::connect` 接收去掉 scheme 的位置段，失败时返回
//!   `ConnectionRefused`/`Timeout`/`HandshakeFailed`/`InvalidOptions`；
//! - `ListenerFactory::bind` 绑定后立即开始接受会话，返回的 [`Listener`] 可查询解析后的地址；
//! - 后端实例本身无会话状态，可被多个任务共享。

use std::fmt;

use async_trait::async_trait;

use crate::comm::BoxComm;
use crate::error::Result;
use crate::listener::{CommHandler, Listener};
use crate::options::{ConnectOptions, ListenOptions};

/// 主动建连能力。
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, location: &str, options: &ConnectOptions) -> Result<BoxComm>;
}

/// 被动监听能力。
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn bind(
        &self,
        location: &str,
        handler: CommHandler,
        options: &ListenOptions,
    ) -> Result<Listener>;
}

/// 一种传输介质。
pub trait Backend: Send + Sync + fmt::Debug {
    /// 默认注册的 scheme。
    fn scheme(&self) -> &'static str;

    fn connector(&self) -> &dyn Connector;

    fn listener_factory(&self) -> &dyn ListenerFactory;
}
