//! 日志装配：按 `TASKWIRE_LOG` 安装全局 `tracing` 订阅者。
//!
//! # 教案式说明
//! - **Why**：传输层各 crate 只发出 `tracing` 事件，从不安装订阅者；
//!   没有自己日志栈的可执行程序与示例需要一个一行启用的入口；
//! - **How**：`tracing-subscriber` 的 `fmt` 层 + `EnvFilter`，过滤规则取自 `TASKWIRE_LOG`，
//!   缺省为 `info`；宿主若已安装订阅者则不覆盖；
//! - **What**：幂等，重复调用返回第一次的结果。

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::EnvFilter;

/// 过滤规则所在的环境变量。
pub const LOG_ENV: &str = "TASKWIRE_LOG";

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// 安装全局订阅者。返回值表示当前生效的订阅者是否由本函数安装。
pub fn init_from_env() -> bool {
    *INSTALLED.get_or_init(|| {
        if dispatcher::has_been_set() {
            return false;
        }
        tracing_subscriber::fmt()
            .with_env_filter(build_env_filter())
            .with_target(true)
            .try_init()
            .is_ok()
    })
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let first = init_from_env();
        assert_eq!(init_from_env(), first);
        tracing::info!("logging installed");
    }
}
