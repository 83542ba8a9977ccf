//! 带外握手：交换端点地址、协议版本与分块能力。
//!
//! 发起方先写 `Hello` 再读，接受方先读再写。帧格式为 `[u32 长度][bincode(Hello)]`，
//! 长度超过 [`MAX_HELLO_LEN`] 的输入直接判定为非 Fabric 对端。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskwire_core::error::{CommError, ErrorKind, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MIN_CHUNK_SIZE;
use crate::error::{self, handshake_failed, map_io_error};

pub(crate) const MAGIC: [u8; 4] = *b"TWFB";
pub(crate) const PROTOCOL_VERSION: u16 = 1;
const MAX_HELLO_LEN: u32 = 4096;

/// 握手消息。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub magic: [u8; 4],
    pub version: u16,
    pub endpoint: u64,
    pub worker_address: String,
    pub chunk_size: u64,
    pub device_memory: bool,
}

impl Hello {
    pub fn new(endpoint: u64, worker_address: String, chunk_size: usize, device_memory: bool) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            endpoint,
            worker_address,
            chunk_size: chunk_size as u64,
            device_memory,
        }
    }
}

/// 握手结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Negotiated {
    pub peer_endpoint: u64,
    pub peer_worker: String,
    pub peer_device_memory: bool,
    /// 两端分块上限的较小值。
    pub chunk_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Initiator,
    Responder,
}

/// 在限定时间内完成握手。
pub(crate) async fn exchange<S>(
    stream: &mut S,
    local: &Hello,
    role: Role,
    timeout: Duration,
) -> Result<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer = tokio::time::timeout(timeout, async {
        match role {
            Role::Initiator => {
                send_hello(stream, local).await?;
                recv_hello(stream).await
            }
            Role::Responder => {
                let peer = recv_hello(stream).await?;
                send_hello(stream, local).await?;
                Ok(peer)
            }
        }
    })
    .await
    .map_err(|_| {
        CommError::new(
            ErrorKind::Timeout,
            error::HANDSHAKE.code,
            format!("fabric handshake did not complete within {timeout:?}"),
        )
    })??;
    negotiate(local, peer)
}

fn negotiate(local: &Hello, peer: Hello) -> Result<Negotiated> {
    if peer.magic != MAGIC {
        return Err(handshake_failed(format!("unexpected magic {:02x?}", peer.magic)));
    }
    if peer.version != PROTOCOL_VERSION {
        return Err(handshake_failed(format!(
            "protocol version {} not supported (local {PROTOCOL_VERSION})",
            peer.version
        )));
    }
    let chunk_size = local.chunk_size.min(peer.chunk_size);
    if chunk_size < MIN_CHUNK_SIZE as u64 {
        return Err(handshake_failed(format!(
            "peer chunk size {} below minimum {MIN_CHUNK_SIZE}",
            peer.chunk_size
        )));
    }
    tracing::debug!(
        peer_endpoint = peer.endpoint,
        peer_worker = %peer.worker_address,
        chunk_size,
        "fabric handshake negotiated"
    );
    Ok(Negotiated {
        peer_endpoint: peer.endpoint,
        peer_worker: peer.worker_address,
        peer_device_memory: peer.device_memory,
        chunk_size: usize::try_from(chunk_size).unwrap_or(usize::MAX),
    })
}

async fn send_hello<S: AsyncWrite + Unpin>(stream: &mut S, hello: &Hello) -> Result<()> {
    let body = bincode::serialize(hello)
        .map_err(|err| handshake_failed(format!("encode hello: {err}")))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    stream
        .write_all(&frame)
        .await
        .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
    stream
        .flush()
        .await
        .map_err(|err| map_io_error(error::HANDSHAKE, err))
}

async fn recv_hello<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Hello> {
    let len = stream
        .read_u32()
        .await
        .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
    if len == 0 || len > MAX_HELLO_LEN {
        return Err(handshake_failed(format!("hello length {len} out of range")));
    }
    let mut body = vec![0u8; len as usize];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|err| map_io_error(error::HANDSHAKE, err))?;
    bincode::deserialize(&body).map_err(|err| handshake_failed(format!("decode hello: {err}")))
}
