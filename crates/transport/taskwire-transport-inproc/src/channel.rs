use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskwire_core::comm::{CloseHandle, Comm, CommState, ExtraInfo, TransferMode};
use taskwire_core::context::{CallContext, run_with_context};
use taskwire_core::error::{CommError, Result};
use taskwire_core::message::Message;
use taskwire_core::options::ConnectOptions;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

use crate::config::InprocOptions;
use crate::routes::{deliver, format_address, fresh_location};

/// 进程内 Comm：一对无界通道直接移交消息对象。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 同进程内的调度器与 Worker 不需要序列化，也不需要任何网络 IO；
///
/// ## 逻辑 (How)
/// - 每个方向一条 `mpsc::unbounded_channel`，写入即把消息（连同负载缓冲的引用计数句柄）
///   移交给对端，负载字节从不复制；
/// - 关闭时丢弃发送端，对端 `recv` 得到 `None`，表现为 `StreamClosed`。
///
/// ## 契约 (What)
/// - `write` 返回 0：没有字节进入任何传输介质；
/// - 关闭、超时与传输故障语义与其它后端一致，均经过 [`CommState::run`]。
pub struct InprocComm {
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Message>>>,
    state: CommState,
    local: String,
    peer: String,
    contact: Option<String>,
    info: ExtraInfo,
}

impl InprocComm {
    /// 构造一对互为对端的 Comm：`(client, server)`。
    pub(crate) fn pair(client_address: String, server_address: String, contact: Option<String>) -> (Self, Self) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let client = Self::new(to_server, from_server, client_address.clone(), server_address.clone(), None);
        let server = Self::new(to_client, from_client, server_address, client_address, contact);
        (client, server)
    }

    fn new(
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
        local: String,
        peer: String,
        contact: Option<String>,
    ) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(Some(rx)),
            state: CommState::new(),
            local,
            peer,
            contact,
            info: ExtraInfo::new(TransferMode::InMemory),
        }
    }

    /// 连接已绑定的进程内地址。位置段即监听器的 `<pid>/<n>` 或自定义名称。
    pub async fn connect(location: &str, options: &ConnectOptions) -> Result<Self> {
        options.backend().parse::<InprocOptions>(crate::SCHEME)?;
        let server_address = format_address(location);
        run_with_context(options.context(), "inproc connect", async {
            let (client, server) = InprocComm::pair(
                format_address(&fresh_location()),
                server_address.clone(),
                Some(server_address.clone()),
            );
            deliver(&server_address, server)?;
            tracing::debug!(local = %client.local, peer = %client.peer, "inproc comm connected");
            Ok(client)
        })
        .await
    }
}

impl fmt::Debug for InprocComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InprocComm")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

#[async_trait]
impl Comm for InprocComm {
    async fn write_with(&self, message: &Message, ctx: &CallContext) -> Result<usize> {
        self.state
            .run(ctx, "inproc write", async {
                let tx = self.tx.lock().clone();
                let tx = tx.ok_or_else(|| CommError::comm_closed("inproc write"))?;
                tx.send(message.clone())
                    .map_err(|_| CommError::stream_closed("inproc write"))?;
                Ok(0)
            })
            .await
    }

    async fn read_with(&self, ctx: &CallContext) -> Result<Message> {
        let result = self
            .state
            .run(ctx, "inproc read", async {
                let mut guard = self.rx.lock().await;
                let rx = guard
                    .as_mut()
                    .ok_or_else(|| CommError::comm_closed("inproc read"))?;
                rx.recv()
                    .await
                    .ok_or_else(|| CommError::stream_closed("inproc read"))
            })
            .await;
        if self.state.is_closed() {
            self.rx.lock().await.take();
        }
        result
    }

    async fn close(&self) -> Result<()> {
        let first = self.state.mark_closed();
        self.tx.lock().take();
        self.rx.lock().await.take();
        if first {
            tracing::debug!(local = %self.local, peer = %self.peer, "inproc comm closed");
        }
        Ok(())
    }

    /// 挂起读取持有的接收端在该读取退出时丢弃。
    fn abort(&self) {
        self.state.mark_closed();
        self.tx.lock().take();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.take();
        }
    }

    fn closed(&self) -> bool {
        self.state.is_closed()
    }

    fn local_address(&self) -> &str {
        &self.local
    }

    fn peer_address(&self) -> &str {
        &self.peer
    }

    fn contact_address(&self) -> Option<&str> {
        self.contact.as_deref()
    }

    fn extra_info(&self) -> &ExtraInfo {
        &self.info
    }

    fn close_handle(&self) -> CloseHandle {
        self.state.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use taskwire_core::ErrorKind;
    use taskwire_core::memory::Buffer;
    use taskwire_core::message::{Bulk, Value};

    #[tokio::test(flavor = "multi_thread")]
    async fn payloads_are_handed_over_without_copy() {
        let (client, server) = InprocComm::pair("inproc://a".into(), "inproc://b".into(), None);
        let data = Bytes::from(vec![9u8; 1 << 16]);
        let message = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(data.clone())]));
        assert_eq!(client.write(&message).await.expect("write"), 0);
        let received = server.read().await.expect("read");
        let frame = received.as_bulk().expect("bulk").frames[0].as_host().expect("host").clone();
        assert_eq!(frame.as_ptr(), data.as_ptr());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn abort_drops_receiver_held_by_pending_read() {
        let (client, server) = InprocComm::pair("inproc://a".into(), "inproc://b".into(), None);
        let server = std::sync::Arc::new(server);
        let reader = tokio::spawn({
            let server = std::sync::Arc::clone(&server);
            async move { server.read().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        server.abort();
        let err = reader.await.expect("join").expect_err("aborted");
        assert_eq!(err.kind(), ErrorKind::CommClosed);
        assert!(server.rx.lock().await.is_none());
        let err = client.write(&Value::Null).await.expect_err("receiver dropped");
        assert_eq!(err.kind(), ErrorKind::StreamClosed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_seen_as_stream_closed() {
        let (client, server) = InprocComm::pair("inproc://a".into(), "inproc://b".into(), None);
        client.close().await.expect("close");
        let err = server.read().await.expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::StreamClosed);
        assert!(server.closed());
        let err = server.write(&Value::Null).await.expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::CommClosed);
    }
}
