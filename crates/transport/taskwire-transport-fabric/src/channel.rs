use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskwire_core::address::parse_host_port;
use taskwire_core::comm::{CloseHandle, Comm, CommState, ExtraInfo, TransferMode};
use taskwire_core::context::{CallContext, run_with_context};
use taskwire_core::error::{CommError, ErrorKind, Result};
use taskwire_core::frame::{FrameLimits, FrameSet};
use taskwire_core::memory::DeviceAllocator;
use taskwire_core::message::Message;
use taskwire_core::options::ConnectOptions;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{FabricOptions, RegistrationMode};
use crate::context::FabricContext;
use crate::error::{self, map_io_error};
use crate::handshake::{Hello, Role, exchange};
use crate::protocol::{RecvParams, SendParams, read_message, write_close, write_message};
use crate::util::{configure_stream, format_address};

/// 关闭通知允许占用的最长时间。
const CLOSE_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// 建立会话所需的本端参数。
#[derive(Clone)]
pub(crate) struct SessionSetup {
    pub options: FabricOptions,
    pub device: Option<Arc<dyn DeviceAllocator>>,
    pub limits: FrameLimits,
    pub contact: Option<String>,
}

struct FabricWriter {
    half: OwnedWriteHalf,
    /// 上一条消息是否完整写出；被打断的写入之后不能再追加关闭通知。
    clean: bool,
}

struct FabricCommInner {
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<FabricWriter>>,
    state: CommState,
    context: Mutex<Option<Arc<FabricContext>>>,
    local: String,
    peer: String,
    info: ExtraInfo,
    setup: SessionSetup,
    chunk_size: usize,
}

impl FabricCommInner {
    fn context(&self, operation: &str) -> Result<Arc<FabricContext>> {
        self.context
            .lock()
            .clone()
            .ok_or_else(|| CommError::comm_closed(operation))
    }

    fn send_params(&self, context: Arc<FabricContext>) -> SendParams {
        SendParams {
            context,
            device_memory: self.setup.options.device_memory,
            registration: self.setup.options.registration,
            chunk_size: self.chunk_size,
        }
    }

    fn recv_params(&self, context: Arc<FabricContext>) -> RecvParams {
        RecvParams {
            context,
            device: self.setup.device.clone(),
            device_memory: self.setup.options.device_memory,
            limits: self.setup.limits,
            chunk_size: self.chunk_size,
        }
    }

    /// 帧已部分写出或部分读入时的注册失败会让流失去同步，只能关闭。
    fn close_after_partial(&self, operation: &str, err: &CommError) {
        if err.kind() == ErrorKind::BufferRegistrationFailed && self.state.mark_closed() {
            tracing::debug!(
                operation,
                peer = %self.peer,
                code = err.code(),
                "fabric comm closed after mid-message registration failure"
            );
        }
    }
}

/// Fabric 上的 Comm 实现。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 大块负载（尤其是设备内存）按注册区域分块 put 给对端，接收端预先分配并注册同尺寸
///   缓冲，负载不经过发送端的额外序列化；
///
/// ## 逻辑 (How)
/// - 建连后先完成带外握手，得到对端端点标识与协商后的分块大小；
/// - 写路径：编码头部，`eager` 模式在触碰套接字前注册全部负载，随后写出
///   MESSAGE、逐块 PUT 与 COMPLETE；`lazy` 模式逐个负载注册；
/// - 读路径：读取头部后按描述符分配并注册接收缓冲，校验每个 put 的序号、偏移、
///   注册键与边界，收到 COMPLETE 才返回。
///
/// ## 契约 (What)
/// - `eager` 注册失败返回 `BufferRegistrationFailed` 且 Comm 保持可用；
///   帧中途的注册失败关闭 Comm；
/// - `close` 在流处于帧边界时发送关闭通知，对端读到 `StreamClosed`；
/// - 关闭后释放对进程级 [`FabricContext`] 的引用。
pub struct FabricComm {
    inner: Arc<FabricCommInner>,
}

impl FabricComm {
    /// 在已连通的带外通道上完成握手并建立会话。
    pub(crate) async fn establish(
        mut stream: TcpStream,
        role: Role,
        context: Arc<FabricContext>,
        setup: SessionSetup,
    ) -> Result<Self> {
        configure_stream(&stream, setup.options.chunk_size)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        if setup.options.create_device_context {
            context.ensure_device_context();
        }

        let hello = Hello::new(
            context.next_endpoint_id(),
            format_address(local),
            setup.options.chunk_size,
            setup.options.device_memory,
        );
        let negotiated = exchange(&mut stream, &hello, role, setup.options.handshake_timeout()).await?;
        tracing::debug!(
            local = %hello.worker_address,
            peer = %negotiated.peer_worker,
            endpoint = hello.endpoint,
            peer_endpoint = negotiated.peer_endpoint,
            peer_device_memory = negotiated.peer_device_memory,
            chunk_size = negotiated.chunk_size,
            "fabric session established"
        );

        let (reader, writer) = stream.into_split();
        Ok(Self {
            inner: Arc::new(FabricCommInner {
                reader: AsyncMutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(FabricWriter {
                    half: writer,
                    clean: true,
                })),
                state: CommState::new(),
                context: Mutex::new(Some(context)),
                local: hello.worker_address,
                peer: format_address(peer),
                info: ExtraInfo::new(TransferMode::RemoteDirect)
                    .with_chunk_size(negotiated.chunk_size)
                    .with_peer_endpoint(negotiated.peer_endpoint),
                chunk_size: negotiated.chunk_size,
                setup,
            }),
        })
    }

    /// 按位置段建立连接。
    pub async fn connect(location: &str, options: &ConnectOptions) -> Result<Self> {
        let fabric = FabricOptions::from_backend(options.backend())?;
        let (host, port) = parse_host_port(location, None)?;
        let setup = SessionSetup {
            options: fabric,
            device: options.device().cloned(),
            limits: options.limits(),
            contact: None,
        };
        run_with_context(options.context(), "fabric connect", async {
            let stream = connect_stream(&host, port).await?;
            Self::establish(stream, Role::Initiator, FabricContext::acquire(), setup).await
        })
        .await
    }

    /// 当前会话协商出的分块大小。
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    async fn release(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if writer.clean {
                match tokio::time::timeout(CLOSE_NOTICE_TIMEOUT, write_close(&mut writer.half)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(peer = %self.inner.peer, error = %err, "fabric close notice failed")
                    }
                    Err(_) => tracing::debug!(peer = %self.inner.peer, "fabric close notice timed out"),
                }
            }
            if let Err(err) = writer.half.shutdown().await {
                tracing::debug!(peer = %self.inner.peer, error = %err, "fabric shutdown failed");
            }
        }
        self.inner.reader.lock().await.take();
        self.inner.context.lock().take();
    }
}

async fn connect_stream(host: &str, port: u16) -> Result<TcpStream> {
    let targets = tokio::net::lookup_host((host, port))
        .await
        .map_err(|err| map_io_error(error::RESOLVE, err))?;
    let mut last_error = None;
    for target in targets {
        match TcpStream::connect(target).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(map_io_error(
        error::CONNECT,
        last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("`{host}` resolved to nothing"))
        }),
    ))
}

impl fmt::Debug for FabricComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricComm")
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("chunk_size", &self.inner.chunk_size)
            .field("closed", &self.inner.state.is_closed())
            .finish()
    }
}

#[async_trait]
impl Comm for FabricComm {
    async fn write_with(&self, message: &Message, ctx: &CallContext) -> Result<usize> {
        let inner = &self.inner;
        inner.state.ensure_open("fabric write")?;
        let params = inner.send_params(inner.context("fabric write")?);
        let frames = FrameSet::encode(message)?;
        let eager = match params.registration {
            RegistrationMode::Eager => Some(params.register_all(&frames)?),
            RegistrationMode::Lazy => None,
        };
        let result = inner
            .state
            .run(ctx, "fabric write", async {
                let mut guard = inner.writer.lock().await;
                let writer = guard
                    .as_mut()
                    .ok_or_else(|| CommError::comm_closed("fabric write"))?;
                writer.clean = false;
                let written = write_message(&mut writer.half, &frames, eager, &params).await?;
                writer.clean = true;
                Ok(written)
            })
            .await;
        if let Err(err) = &result {
            inner.close_after_partial("fabric write", err);
        }
        if inner.state.is_closed() {
            inner.writer.lock().await.take();
        }
        result
    }

    async fn read_with(&self, ctx: &CallContext) -> Result<Message> {
        let inner = &self.inner;
        inner.state.ensure_open("fabric read")?;
        let params = inner.recv_params(inner.context("fabric read")?);
        let result = inner
            .state
            .run(ctx, "fabric read", async {
                let mut guard = inner.reader.lock().await;
                let reader = guard
                    .as_mut()
                    .ok_or_else(|| CommError::comm_closed("fabric read"))?;
                read_message(reader, &params).await
            })
            .await;
        if let Err(err) = &result {
            inner.close_after_partial("fabric read", err);
        }
        if inner.state.is_closed() {
            inner.reader.lock().await.take();
        }
        result
    }

    async fn close(&self) -> Result<()> {
        // 传输故障已把状态置为关闭时，套接字仍待释放。
        let first = self.inner.state.mark_closed();
        self.release().await;
        if first {
            tracing::debug!(local = %self.inner.local, peer = %self.inner.peer, "fabric comm closed");
        }
        Ok(())
    }

    /// 空闲的半边立即丢弃；挂起操作持有的半边在该操作退出时丢弃。
    fn abort(&self) {
        self.inner.state.mark_closed();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.inner.reader.try_lock() {
            reader.take();
        }
        self.inner.context.lock().take();
    }

    fn closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    fn local_address(&self) -> &str {
        &self.inner.local
    }

    fn peer_address(&self) -> &str {
        &self.inner.peer
    }

    fn contact_address(&self) -> Option<&str> {
        self.inner.setup.contact.as_deref()
    }

    fn extra_info(&self) -> &ExtraInfo {
        &self.inner.info
    }

    fn close_handle(&self) -> CloseHandle {
        self.inner.state.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwire_tck::corrupt;
    use tokio::net::TcpListener;

    use crate::config::DEFAULT_CHUNK_SIZE;
    use crate::protocol::OP_MESSAGE;

    /// 完成握手后写出 `[MESSAGE][frame]` 的裸对端；写完保持连接，错误只能来自解码。
    async fn read_forged(frame: Vec<u8>) {
        let acceptor = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = acceptor.local_addr().expect("addr").port();
        let peer = tokio::spawn(async move {
            let (mut stream, _) = acceptor.accept().await.expect("accept");
            let hello = Hello::new(7, format!("fabric://127.0.0.1:{port}"), DEFAULT_CHUNK_SIZE, true);
            exchange(&mut stream, &hello, Role::Responder, Duration::from_secs(5))
                .await
                .expect("handshake");
            stream.write_all(&[OP_MESSAGE]).await.expect("op");
            stream.write_all(&frame).await.expect("send forged frame");
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let comm = FabricComm::connect(&format!("127.0.0.1:{port}"), &ConnectOptions::default())
            .await
            .expect("connect");
        let err = tokio::time::timeout(Duration::from_secs(10), comm.read())
            .await
            .expect("read finished")
            .expect_err("forged frame must not decode");
        assert_eq!(err.kind(), ErrorKind::DecodeError, "{err}");
        assert!(comm.closed());
        assert!(comm.inner.reader.lock().await.is_none());
        let err = comm.read().await.expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::CommClosed);
        peer.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forged_payload_length_is_decode_error() {
        for len in [1u64 << 63, 1u64 << 40] {
            read_forged(corrupt::forged_payload_len_frame(len).expect("forge")).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deeply_nested_header_is_decode_error() {
        read_forged(corrupt::deeply_nested_frame(2_000_000)).await;
    }
}
