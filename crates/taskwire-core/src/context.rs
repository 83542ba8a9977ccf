//! 调用上下文：截止时间与取消令牌。
//!
//! # 设计背景（Why）
//! - connect/read/write 均可能长时间挂起，调用方需要逐次指定超时并能够从外部取消；
//! - 参照 `CallContext` 的取舍：上下文是廉价可克隆的值对象，由调用方在每次调用时传入，
//!   传输实现只负责在挂起点尊重它。
//!
//! # 契约说明（What）
//! - 截止时间到期返回 [`ErrorKind::Timeout`]，取消返回 [`ErrorKind::Cancelled`]；
//! - [`CallContext::default`] 不设截止时间、不可被外部取消（令牌无人持有）。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{CommError, ErrorKind, Result, codes};

/// 可在任务间共享的取消令牌。
///
/// 与轮询式实现不同，这里通过 [`Notify`] 唤醒等待者，关闭 Comm 或停止监听器时挂起的操作
/// 能够立即返回。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒所有等待者。
    ///
    /// 返回 `true` 表示本次调用首次触发取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生共享同一状态的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 等待直到令牌被取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 单次调用的执行上下文。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“这次调用最多等多久、谁可以提前终止它”显式化，避免在 Comm 上挂全局超时；
///
/// ## 契约 (What)
/// - `deadline`：绝对截止时间（Tokio 单调时钟），`None` 表示不限；
/// - `cancellation`：外部可触发的取消令牌；
/// - **后置条件**：上下文不可变，派生新上下文请使用 [`CallContext::builder`]。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancellation: Cancellation,
}

impl CallContext {
    /// 创建 Builder。
    pub fn builder() -> CallContextBuilder {
        CallContextBuilder::default()
    }

    /// 以相对超时快速构造上下文。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::builder().timeout(timeout).build()
    }

    /// 截止时间。
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 取消令牌。
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// 距截止时间的剩余时长；无截止时间时为 `None`。
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// 截止时间是否已经过去。
    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| deadline <= Instant::now())
    }
}

/// [`CallContext`] 的建造器。
#[derive(Debug, Default)]
pub struct CallContextBuilder {
    deadline: Option<Instant>,
    cancellation: Option<Cancellation>,
}

impl CallContextBuilder {
    /// 设置相对超时。
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// 设置绝对截止时间。
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 绑定外部取消令牌。
    pub fn cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// 生成上下文。
    pub fn build(self) -> CallContext {
        CallContext {
            deadline: self.deadline,
            cancellation: self.cancellation.unwrap_or_default(),
        }
    }
}

/// 构造超时错误。
pub fn timeout_error(operation: &str) -> CommError {
    CommError::new(
        ErrorKind::Timeout,
        codes::CALL_TIMEOUT,
        format!("{operation} timed out"),
    )
}

/// 构造取消错误。
pub fn cancelled_error(operation: &str) -> CommError {
    CommError::new(
        ErrorKind::Cancelled,
        codes::CALL_CANCELLED,
        format!("{operation} cancelled"),
    )
}

/// 在保留取消/超时语义的前提下执行 Future。
///
/// # 逻辑 (How)
/// - 先同步检查截止与取消，已失效的上下文不会触发任何 IO；
/// - 之后以 `biased` 的 `select!` 组合取消、截止与业务 Future，取消优先。
pub async fn run_with_context<F, T>(ctx: &CallContext, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if ctx.is_expired() {
        return Err(timeout_error(operation));
    }
    if ctx.cancellation().is_cancelled() {
        return Err(cancelled_error(operation));
    }

    let cancel = ctx.cancellation().cancelled();
    tokio::pin!(cancel);
    tokio::pin!(future);

    match ctx.deadline() {
        Some(deadline) => {
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);
            tokio::select! {
                biased;
                _ = &mut cancel => Err(cancelled_error(operation)),
                _ = &mut sleep => Err(timeout_error(operation)),
                result = &mut future => result,
            }
        }
        None => {
            tokio::select! {
                biased;
                _ = &mut cancel => Err(cancelled_error(operation)),
                result = &mut future => result,
            }
        }
    }
}
