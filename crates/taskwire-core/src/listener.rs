//! 通用监听运行时。
//!
//! # 设计背景（Why）
//! - 三种后端的“接受循环 + 每会话一个处理任务 + 失败隔离”逻辑完全相同，差异只在于
//!   如何接受一个入站会话、如何完成握手。核心层因此只要求后端实现 [`Acceptor`] 与
//!   [`Establish`]，其余由 [`Listener`] 统一完成；
//! - 握手放在会话任务内执行：慢速或恶意的对端不会阻塞接受循环。
//!
//! # 契约说明（What）
//! - 每个入站会话获得一个独立任务运行处理器；处理器失败或 panic 时，对应会话被关闭、
//!   事件写入旁路通道并记录 `warn!` 日志，接受循环继续；
//! - 绑定的资源（`Acceptor`）只会被释放一次：`stop` 等待接受任务退出后返回，
//!   `Drop` 则中止接受任务；两者都不会中断正在运行的处理器。
//!
//! # 风险提示（Trade-offs）
//! - 旁路通道容量有限，调用方长时间不消费时多余事件会被丢弃（日志仍然保留）。

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::{Address, parse_host_port};
use crate::comm::BoxComm;
use crate::context::Cancellation;
use crate::error::{ErrorKind, Result};

const EVENT_CAPACITY: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// 处理器返回的错误。
pub type HandlerError = Box<dyn Error + Send + Sync + 'static>;

/// 处理器为每个会话返回的 Future。
pub type HandlerFuture = BoxFuture<'static, std::result::Result<(), HandlerError>>;

/// 会话处理器：每个入站会话调用一次。
pub type CommHandler = Arc<dyn Fn(BoxComm) -> HandlerFuture + Send + Sync>;

/// 由闭包构造 [`CommHandler`]。
pub fn handler_fn<F, Fut, E>(handler: F) -> CommHandler
where
    F: Fn(BoxComm) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<HandlerError>,
{
    Arc::new(move |comm| {
        let fut = handler(comm);
        Box::pin(async move { fut.await.map_err(Into::into) })
    })
}

/// 后端提供的接受能力。
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// 尚未完成握手的入站会话。
    type Incoming: Establish;

    /// 接受一个入站会话；返回 `CommClosed` 表示接受端已失效，循环随之退出。
    async fn accept(&self) -> Result<Self::Incoming>;

    /// 实际绑定的地址（端口 0 已解析）。
    fn listen_address(&self) -> &str;

    /// 对外公布的地址。
    fn contact_address(&self) -> &str;
}

/// 入站会话的建立过程（握手等）。
#[async_trait]
pub trait Establish: Send + 'static {
    /// 用于日志的对端描述。
    fn peer_hint(&self) -> String;

    async fn establish(self) -> Result<BoxComm>;
}

/// 监听器旁路事件。
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ListenerEvent {
    /// 处理器返回错误。
    HandlerFailed { peer: String, error: String },
    /// 处理器 panic。
    HandlerPanicked { peer: String, message: String },
    /// 会话建立（握手）失败。
    EstablishFailed {
        peer: String,
        kind: ErrorKind,
        error: String,
    },
    /// 接受失败。
    AcceptFailed { kind: ErrorKind, error: String },
}

/// 监听器计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub accepted: u64,
    pub active_handlers: u64,
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    active: AtomicU64,
    failures: AtomicU64,
}

struct ActiveGuard(Arc<Counters>);

impl ActiveGuard {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counters))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<ListenerEvent>,
}

impl EventSink {
    fn emit(&self, event: ListenerEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            tracing::debug!(?event, "listener event channel full, dropping event");
        }
    }
}

/// 运行中的监听器句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 作为作用域资源持有接受循环：显式 `stop` 或离开作用域都会释放绑定的端口/地址；
///
/// ## 契约 (What)
/// - `listen_address`：实际绑定地址；`contact_address`：对外公布地址；
/// - `take_events`：取走旁路事件接收端，只能成功一次；
/// - `stop`：幂等，返回时绑定资源已释放。
pub struct Listener {
    scheme: &'static str,
    listen_address: String,
    contact_address: String,
    shutdown: Cancellation,
    accept_task: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    events: Option<mpsc::Receiver<ListenerEvent>>,
}

impl Listener {
    /// 启动接受循环。必须在 Tokio 运行时内调用。
    pub fn spawn<A: Acceptor>(scheme: &'static str, acceptor: A, handler: CommHandler) -> Self {
        let listen_address = acceptor.listen_address().to_owned();
        let contact_address = acceptor.contact_address().to_owned();
        let shutdown = Cancellation::new();
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let accept_task = tokio::spawn(accept_loop(
            scheme,
            acceptor,
            handler,
            shutdown.child(),
            Arc::clone(&counters),
            EventSink { tx },
        ));
        tracing::info!(
            scheme,
            listen = %listen_address,
            contact = %contact_address,
            "listener started"
        );
        Self {
            scheme,
            listen_address,
            contact_address,
            shutdown,
            accept_task: Some(accept_task),
            counters,
            events: Some(rx),
        }
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// 实际绑定的地址。
    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    /// 对外公布的地址。
    pub fn contact_address(&self) -> &str {
        &self.contact_address
    }

    /// 对外公布地址中的主机与端口；位置段不是 `host:port` 时返回 `MalformedAddress`。
    pub fn host_port(&self) -> Result<(String, u16)> {
        let address = Address::parse(&self.contact_address)?;
        parse_host_port(address.location(), None)
    }

    /// 计数快照。
    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            accepted: self.counters.accepted.load(Ordering::Acquire),
            active_handlers: self.counters.active.load(Ordering::Acquire),
            handler_failures: self.counters.failures.load(Ordering::Acquire),
        }
    }

    /// 取走旁路事件接收端。
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ListenerEvent>> {
        self.events.take()
    }

    /// 是否仍在接受会话。
    pub fn is_running(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// 停止接受并释放绑定资源；正在运行的处理器不受影响。
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await
                && err.is_panic()
            {
                tracing::warn!(scheme = self.scheme, "accept loop panicked");
            }
            tracing::info!(
                scheme = self.scheme,
                listen = %self.listen_address,
                "listener stopped"
            );
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("scheme", &self.scheme)
            .field("listen_address", &self.listen_address)
            .field("contact_address", &self.contact_address)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn accept_loop<A: Acceptor>(
    scheme: &'static str,
    acceptor: A,
    handler: CommHandler,
    shutdown: Cancellation,
    counters: Arc<Counters>,
    events: EventSink,
) {
    loop {
        let incoming = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            incoming = acceptor.accept() => incoming,
        };
        match incoming {
            Ok(incoming) => {
                counters.accepted.fetch_add(1, Ordering::AcqRel);
                tokio::spawn(run_session(
                    scheme,
                    incoming,
                    Arc::clone(&handler),
                    Arc::clone(&counters),
                    events.clone(),
                ));
            }
            Err(err) if err.kind() == ErrorKind::CommClosed => {
                tracing::debug!(scheme, "acceptor closed");
                break;
            }
            Err(err) => {
                tracing::warn!(scheme, code = err.code(), error = %err, "accept failed");
                events.emit(ListenerEvent::AcceptFailed {
                    kind: err.kind(),
                    error: err.to_string(),
                });
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}

async fn run_session<I: Establish>(
    scheme: &'static str,
    incoming: I,
    handler: CommHandler,
    counters: Arc<Counters>,
    events: EventSink,
) {
    let peer = incoming.peer_hint();
    let comm = match incoming.establish().await {
        Ok(comm) => comm,
        Err(err) => {
            tracing::warn!(scheme, %peer, code = err.code(), error = %err, "session establishment failed");
            events.emit(ListenerEvent::EstablishFailed {
                peer,
                kind: err.kind(),
                error: err.to_string(),
            });
            return;
        }
    };
    tracing::debug!(scheme, %peer, local = comm.local_address(), "session established");

    let close = comm.close_handle();
    let _active = ActiveGuard::enter(&counters);
    match tokio::spawn(handler(comm)).await {
        Ok(Ok(())) => tracing::debug!(scheme, %peer, "handler finished"),
        Ok(Err(err)) => {
            close.close();
            counters.failures.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(scheme, %peer, error = %err, "handler failed, session closed");
            events.emit(ListenerEvent::HandlerFailed {
                peer,
                error: err.to_string(),
            });
        }
        Err(join) if join.is_panic() => {
            close.close();
            counters.failures.fetch_add(1, Ordering::AcqRel);
            let message = panic_message(join.into_panic());
            tracing::warn!(scheme, %peer, %message, "handler panicked, session closed");
            events.emit(ListenerEvent::HandlerPanicked { peer, message });
        }
        Err(_) => {
            close.close();
            tracing::debug!(scheme, %peer, "handler task cancelled");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{CloseHandle, Comm, CommState, ExtraInfo, TransferMode};
    use crate::context::CallContext;
    use crate::error::CommError;
    use crate::message::Message;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Debug)]
    struct IdleComm {
        state: CommState,
        info: ExtraInfo,
    }

    #[async_trait]
    impl Comm for IdleComm {
        async fn write_with(&self, _: &Message, ctx: &CallContext) -> Result<usize> {
            self.state.run(ctx, "write", async { Ok(0) }).await
        }

        async fn read_with(&self, ctx: &CallContext) -> Result<Message> {
            self.state
                .run(ctx, "read", std::future::pending::<Result<Message>>())
                .await
        }

        async fn close(&self) -> Result<()> {
            self.state.mark_closed();
            Ok(())
        }

        fn abort(&self) {
            self.state.mark_closed();
        }

        fn closed(&self) -> bool {
            self.state.is_closed()
        }

        fn local_address(&self) -> &str {
            "test://local"
        }

        fn peer_address(&self) -> &str {
            "test://peer"
        }

        fn contact_address(&self) -> Option<&str> {
            Some("test://127.0.0.1:9")
        }

        fn extra_info(&self) -> &ExtraInfo {
            &self.info
        }

        fn close_handle(&self) -> CloseHandle {
            self.state.handle()
        }
    }

    struct Incoming(Arc<IdleComm>);

    #[async_trait]
    impl Establish for Incoming {
        fn peer_hint(&self) -> String {
            "test://peer".to_owned()
        }

        async fn establish(self) -> Result<BoxComm> {
            Ok(Box::new(IdleComm {
                state: self.0.state.clone(),
                info: ExtraInfo::new(TransferMode::InMemory),
            }))
        }
    }

    /// 从通道里取出预先构造的会话，释放时设置标志。
    struct QueueAcceptor {
        queue: AsyncMutex<mpsc::UnboundedReceiver<Arc<IdleComm>>>,
        released: Arc<AtomicBool>,
    }

    impl Drop for QueueAcceptor {
        fn drop(&mut self) {
            assert!(!self.released.swap(true, Ordering::AcqRel), "released twice");
        }
    }

    #[async_trait]
    impl Acceptor for QueueAcceptor {
        type Incoming = Incoming;

        async fn accept(&self) -> Result<Incoming> {
            match self.queue.lock().await.recv().await {
                Some(comm) => Ok(Incoming(comm)),
                None => Err(CommError::comm_closed("accept")),
            }
        }

        fn listen_address(&self) -> &str {
            "test://0.0.0.0:9"
        }

        fn contact_address(&self) -> &str {
            "test://127.0.0.1:9"
        }
    }

    fn fixture() -> (
        mpsc::UnboundedSender<Arc<IdleComm>>,
        QueueAcceptor,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let acceptor = QueueAcceptor {
            queue: AsyncMutex::new(rx),
            released: Arc::clone(&released),
        };
        (tx, acceptor, released)
    }

    fn session() -> Arc<IdleComm> {
        Arc::new(IdleComm {
            state: CommState::new(),
            info: ExtraInfo::new(TransferMode::InMemory),
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_failure_is_isolated_and_reported() {
        let (tx, acceptor, _released) = fixture();
        let handler = handler_fn(|comm: BoxComm| async move {
            if comm.peer_address() == "test://peer" {
                return Err::<(), HandlerError>("boom".into());
            }
            Ok(())
        });
        let mut listener = Listener::spawn("test", acceptor, handler);
        let mut events = listener.take_events().expect("events");
        assert!(listener.take_events().is_none());

        let first = session();
        tx.send(Arc::clone(&first)).expect("send");
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(
            event,
            ListenerEvent::HandlerFailed {
                peer: "test://peer".into(),
                error: "boom".into()
            }
        );
        assert!(first.state.is_closed(), "failed session is closed");

        let second = session();
        tx.send(Arc::clone(&second)).expect("send");
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(matches!(event, ListenerEvent::HandlerFailed { .. }));
        assert_eq!(listener.stats().accepted, 2);
        assert_eq!(listener.stats().handler_failures, 2);
        listener.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_panic_is_caught() {
        let (tx, acceptor, _released) = fixture();
        let handler = handler_fn(|_comm: BoxComm| async move {
            if true {
                panic!("handler exploded");
            }
            Ok::<(), HandlerError>(())
        });
        let mut listener = Listener::spawn("test", acceptor, handler);
        let mut events = listener.take_events().expect("events");
        let comm = session();
        tx.send(Arc::clone(&comm)).expect("send");
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(
            event,
            ListenerEvent::HandlerPanicked {
                peer: "test://peer".into(),
                message: "handler exploded".into()
            }
        );
        assert!(comm.state.is_closed());
        assert!(listener.is_running());
        listener.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_releases_acceptor_once_and_spares_handlers() {
        let (tx, acceptor, released) = fixture();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |comm: BoxComm| {
            let done_tx = done_tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = done_tx.send(comm.local_address().to_owned());
                Ok::<(), HandlerError>(())
            }
        });
        let mut listener = Listener::spawn("test", acceptor, handler);
        assert_eq!(listener.host_port().expect("host port"), ("127.0.0.1".into(), 9));
        tx.send(session()).expect("send");
        tokio::time::sleep(Duration::from_millis(10)).await;

        listener.stop().await;
        assert!(released.load(Ordering::Acquire), "acceptor released on stop");
        listener.stop().await;

        let finished = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("in-flight handler finished");
        assert_eq!(finished.as_deref(), Some("test://local"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drop_aborts_accept_loop() {
        let (_tx, acceptor, released) = fixture();
        let listener = Listener::spawn("test", acceptor, handler_fn(|_c: BoxComm| async {
            Ok::<(), HandlerError>(())
        }));
        drop(listener);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !released.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("acceptor released after drop");
    }
}
