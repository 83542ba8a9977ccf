use std::fmt;
use std::io::{self, IoSlice};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use taskwire_core::address::parse_host_port;
use taskwire_core::comm::{CloseHandle, Comm, CommState, ExtraInfo, TransferMode};
use taskwire_core::context::{CallContext, run_with_context};
use taskwire_core::error::{CommError, Result};
use taskwire_core::frame::{DecodedHeader, FrameLimits, FrameSet, LEN_PREFIX, freeze_all};
use taskwire_core::memory::{Buffer, DeviceAllocator, DeviceRegion, RecvBuffer};
use taskwire_core::message::Message;
use taskwire_core::options::ConnectOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{TcpOptions, TcpSocketConfig};
use crate::error::{self, map_io_error};
use crate::util::format_address;
use crate::SCHEME;

/// 设备负载经主机暂存时每次拷贝的字节数。
const STAGING_CHUNK: usize = 1024 * 1024;

/// 会话级参数：接收设备负载的分配器与解码上限。
#[derive(Clone, Default)]
pub(crate) struct SessionParams {
    pub device: Option<Arc<dyn DeviceAllocator>>,
    pub limits: FrameLimits,
    pub contact: Option<String>,
}

struct TcpCommInner {
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    state: CommState,
    local: String,
    peer: String,
    info: ExtraInfo,
    params: SessionParams,
}

/// TCP 上的 Comm 实现。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 作为一致性基线：其余后端的行为以本实现为准；
///
/// ## 逻辑 (How)
/// - 套接字拆为读写两半，各自由 `tokio::sync::Mutex` 保护，实现一个读者与一个写者并发，
///   多个写者（或读者）依锁排队；
/// - 写路径先编码头部（编码失败不触碰套接字），随后以 vectored 写把前缀与主机负载
///   一次交给内核；设备负载按 1 MiB 分块经主机暂存；
/// - 读路径先读前缀与头部，按描述符预分配接收缓冲，再逐个 `read_exact`。
///
/// ## 契约 (What)
/// - 在帧边界遇到 EOF 返回 `StreamClosed`，帧内 EOF 返回 `ConnectionReset`；
/// - 所有挂起点经过 [`CommState::run`]，关闭与传输故障语义与其它后端一致。
///
/// ## 注意事项 (Trade-offs)
/// - 设备负载需要一次主机暂存拷贝；需要真正零拷贝的部署应选择 Fabric 后端。
pub struct TcpComm {
    inner: Arc<TcpCommInner>,
}

impl TcpComm {
    pub(crate) fn from_stream(
        stream: TcpStream,
        config: &TcpSocketConfig,
        params: SessionParams,
    ) -> Result<Self> {
        config
            .apply(&stream)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            inner: Arc::new(TcpCommInner {
                reader: AsyncMutex::new(Some(reader)),
                writer: AsyncMutex::new(Some(writer)),
                state: CommState::new(),
                local: format_address(local),
                peer: format_address(peer),
                info: ExtraInfo::new(TransferMode::Stream),
                params,
            }),
        })
    }

    /// 按位置段建立连接。
    pub async fn connect(location: &str, options: &ConnectOptions) -> Result<Self> {
        let tcp: TcpOptions = options.backend().parse(SCHEME)?;
        let (host, port) = parse_host_port(location, None)?;
        let stream = run_with_context(options.context(), "tcp connect", async {
            let targets = tokio::net::lookup_host((host.as_str(), port))
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
        })
        .await?;
        let comm = Self::from_stream(
            stream,
            &tcp.socket_config(),
            SessionParams {
                device: options.device().cloned(),
                limits: options.limits(),
                contact: None,
            },
        )?;
        tracing::debug!(local = %comm.inner.local, peer = %comm.inner.peer, "tcp comm connected");
        Ok(comm)
    }

    async fn release(&self) {
        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer
            && let Err(err) = writer.shutdown().await
        {
            tracing::debug!(peer = %self.inner.peer, error = %err, "tcp shutdown failed");
        }
        self.inner.reader.lock().await.take();
    }
}

impl fmt::Debug for TcpComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpComm")
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .field("closed", &self.inner.state.is_closed())
            .finish()
    }
}

#[async_trait]
impl Comm for TcpComm {
    async fn write_with(&self, message: &Message, ctx: &CallContext) -> Result<usize> {
        self.inner.state.ensure_open("tcp write")?;
        let frames = FrameSet::encode(message)?;
        let inner = &self.inner;
        let result = inner
            .state
            .run(ctx, "tcp write", async {
                let mut guard = inner.writer.lock().await;
                let writer = guard
                    .as_mut()
                    .ok_or_else(|| CommError::comm_closed("tcp write"))?;
                write_frames(writer, &frames).await
            })
            .await;
        if inner.state.is_closed() {
            inner.writer.lock().await.take();
        }
        result
    }

    async fn read_with(&self, ctx: &CallContext) -> Result<Message> {
        let inner = &self.inner;
        let result = inner
            .state
            .run(ctx, "tcp read", async {
                let mut guard = inner.reader.lock().await;
                let reader = guard
                    .as_mut()
                    .ok_or_else(|| CommError::comm_closed("tcp read"))?;
                read_message(reader, &inner.params).await
            })
            .await;
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
            tracing::debug!(local = %self.inner.local, peer = %self.inner.peer, "tcp comm closed");
        }
        Ok(())
    }

    /// 同步关闭：空闲的半边立即丢弃；被挂起操作持有的半边由该操作
    /// 观察到关闭信号、释放锁之后自行丢弃（见 `read_with`/`write_with`）。
    fn abort(&self) {
        self.inner.state.mark_closed();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.inner.reader.try_lock() {
            reader.take();
        }
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
        self.inner.params.contact.as_deref()
    }

    fn extra_info(&self) -> &ExtraInfo {
        &self.inner.info
    }

    fn close_handle(&self) -> CloseHandle {
        self.inner.state.handle()
    }
}

async fn write_frames(writer: &mut OwnedWriteHalf, frames: &FrameSet) -> Result<usize> {
    let mut pending: Vec<Bytes> = vec![frames.prefix()];
    let mut written = 0;
    for payload in frames.payloads() {
        match payload {
            Buffer::Host(bytes) => {
                if !bytes.is_empty() {
                    pending.push(bytes.clone());
                }
            }
            Buffer::Device(region) => {
                written += write_vectored_all(writer, &pending).await?;
                pending.clear();
                written += write_staged(writer, region.as_ref()).await?;
            }
        }
    }
    written += write_vectored_all(writer, &pending).await?;
    Ok(written)
}

async fn write_vectored_all(writer: &mut OwnedWriteHalf, segments: &[Bytes]) -> Result<usize> {
    let total = segments.iter().map(Bytes::len).sum();
    let mut slices: Vec<IoSlice<'_>> = segments.iter().map(|b| IoSlice::new(b)).collect();
    let mut remaining: &mut [IoSlice<'_>] = &mut slices;
    while !remaining.is_empty() {
        let n = writer
            .write_vectored(remaining)
            .await
            .map_err(|err| map_io_error(error::WRITE_VECTORED, err))?;
        if n == 0 {
            return Err(map_io_error(
                error::WRITE_VECTORED,
                io::ErrorKind::WriteZero.into(),
            ));
        }
        IoSlice::advance_slices(&mut remaining, n);
    }
    Ok(total)
}

async fn write_staged(writer: &mut OwnedWriteHalf, region: &dyn DeviceRegion) -> Result<usize> {
    let len = region.len();
    let mut staging = vec![0u8; len.min(STAGING_CHUNK)];
    let mut offset = 0;
    while offset < len {
        let n = (len - offset).min(STAGING_CHUNK);
        region.copy_to_host(offset, &mut staging[..n])?;
        writer
            .write_all(&staging[..n])
            .await
            .map_err(|err| map_io_error(error::WRITE, err))?;
        offset += n;
    }
    Ok(len)
}

/// 读取帧起始的长度前缀；对端在帧边界干净关闭时返回 `None`。
async fn read_frame_start(reader: &mut OwnedReadHalf) -> Result<Option<u32>> {
    let mut buf = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|err| map_io_error(error::READ, err))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(map_io_error(
                error::READ,
                io::Error::new(io::ErrorKind::UnexpectedEof, "eof inside frame prefix"),
            ));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

async fn read_message(reader: &mut OwnedReadHalf, params: &SessionParams) -> Result<Message> {
    let Some(header_len) = read_frame_start(reader).await? else {
        return Err(CommError::stream_closed("tcp read"));
    };
    params.limits.check_header_len(header_len)?;
    let mut header = vec![0u8; header_len as usize];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    let decoded = DecodedHeader::decode(&header, &params.limits)?;
    let count = reader
        .read_u32()
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    decoded.check_count(count)?;

    let mut buffers = decoded.allocate(params.device.as_deref())?;
    for buffer in &mut buffers {
        read_payload(reader, buffer).await?;
    }
    decoded.assemble(freeze_all(buffers))
}

async fn read_payload(reader: &mut OwnedReadHalf, buffer: &mut RecvBuffer) -> Result<()> {
    if let Some(host) = buffer.host_mut() {
        reader
            .read_exact(host)
            .await
            .map_err(|err| map_io_error(error::READ, err))?;
        return Ok(());
    }
    let len = buffer.len();
    let mut staging = vec![0u8; len.min(STAGING_CHUNK)];
    let mut offset = 0;
    while offset < len {
        let n = (len - offset).min(STAGING_CHUNK);
        reader
            .read_exact(&mut staging[..n])
            .await
            .map_err(|err| map_io_error(error::READ, err))?;
        buffer.write_at(offset, &staging[..n])?;
        offset += n;
    }
    Ok(())
}
