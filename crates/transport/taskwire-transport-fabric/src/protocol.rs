//! 会话内的操作流：消息头、分块 put、完成标记与关闭通知。
//!
//! ```text
//! MESSAGE  [op=1][u32 头部长度][头部][u32 负载数量]
//! PUT      [op=2][u32 负载序号][u64 注册键][u64 偏移][u32 长度][字节...]
//! COMPLETE [op=3][u32 负载数量]
//! CLOSE    [op=4]
//! ```
//!
//! 头部（含每个负载的精确尺寸）总是先于任何 put 到达，接收端据此预分配并注册接收缓冲。
//! 每个非空负载按序号递增、偏移连续的 put 填满；零长度负载没有 put。

use std::io::{self, IoSlice};
use std::sync::Arc;

use bytes::Bytes;
use taskwire_core::error::{CommError, Result};
use taskwire_core::frame::{DecodedHeader, FrameLimits, FrameSet, freeze_all};
use taskwire_core::memory::{Buffer, DeviceAllocator, RecvBuffer};
use taskwire_core::message::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::RegistrationMode;
use crate::context::{FabricContext, MemoryRegion};
use crate::error::{self, map_io_error, protocol_violation};

pub(crate) const OP_MESSAGE: u8 = 1;
pub(crate) const OP_PUT: u8 = 2;
pub(crate) const OP_COMPLETE: u8 = 3;
pub(crate) const OP_CLOSE: u8 = 4;

const PUT_FIELDS_LEN: usize = 4 + 8 + 8 + 4;

/// put 操作的定位字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PutHeader {
    pub index: u32,
    pub key: u64,
    pub offset: u64,
    pub len: u32,
}

impl PutHeader {
    fn encode(&self) -> [u8; 1 + PUT_FIELDS_LEN] {
        let mut out = [0u8; 1 + PUT_FIELDS_LEN];
        out[0] = OP_PUT;
        out[1..5].copy_from_slice(&self.index.to_be_bytes());
        out[5..13].copy_from_slice(&self.key.to_be_bytes());
        out[13..21].copy_from_slice(&self.offset.to_be_bytes());
        out[21..25].copy_from_slice(&self.len.to_be_bytes());
        out
    }

    fn decode(raw: &[u8; PUT_FIELDS_LEN]) -> Self {
        let u32_at = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let u64_at = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[at..at + 8]);
            u64::from_be_bytes(bytes)
        };
        Self {
            index: u32_at(0),
            key: u64_at(4),
            offset: u64_at(12),
            len: u32_at(20),
        }
    }
}

/// 发送侧参数。
#[derive(Clone, Debug)]
pub(crate) struct SendParams {
    pub context: Arc<FabricContext>,
    pub device_memory: bool,
    pub registration: RegistrationMode,
    pub chunk_size: usize,
}

impl SendParams {
    /// 注册消息的全部负载；任意一个失败即整体失败，已注册的区域随返回值释放。
    pub fn register_all(&self, frames: &FrameSet) -> Result<Vec<MemoryRegion>> {
        frames
            .payloads()
            .iter()
            .map(|payload| self.context.register(payload, self.device_memory))
            .collect()
    }
}

/// 接收侧参数。
#[derive(Clone, Debug)]
pub(crate) struct RecvParams {
    pub context: Arc<FabricContext>,
    pub device: Option<Arc<dyn DeviceAllocator>>,
    pub device_memory: bool,
    pub limits: FrameLimits,
    pub chunk_size: usize,
}

/// 写出一条消息。`eager` 为预先注册好的区域，`None` 表示按负载懒注册。
pub(crate) async fn write_message<W>(
    writer: &mut W,
    frames: &FrameSet,
    eager: Option<Vec<MemoryRegion>>,
    params: &SendParams,
) -> Result<usize>
where
    W: AsyncWrite + Unpin + Send,
{
    let prefix = frames.prefix();
    let mut written = write_vectored_all(writer, &[Bytes::from_static(&[OP_MESSAGE]), prefix]).await?;
    let mut eager = eager.map(Vec::into_iter);

    for (index, payload) in frames.payloads().iter().enumerate() {
        let region = match eager.as_mut().and_then(|regions| regions.next()) {
            Some(region) => region,
            None => params.context.register(payload, params.device_memory)?,
        };
        if payload.is_empty() {
            continue;
        }
        written += put_payload(writer, index as u32, &region, payload, params.chunk_size).await?;
    }

    let mut complete = [0u8; 5];
    complete[0] = OP_COMPLETE;
    complete[1..].copy_from_slice(&(frames.payloads().len() as u32).to_be_bytes());
    writer
        .write_all(&complete)
        .await
        .map_err(|err| map_io_error(error::PUT, err))?;
    Ok(written + complete.len())
}

async fn put_payload<W>(
    writer: &mut W,
    index: u32,
    region: &MemoryRegion,
    payload: &Buffer,
    chunk_size: usize,
) -> Result<usize>
where
    W: AsyncWrite + Unpin + Send,
{
    let len = payload.len();
    let mut offset = 0;
    let mut written = 0;
    while offset < len {
        let n = (len - offset).min(chunk_size);
        let header = PutHeader {
            index,
            key: region.key(),
            offset: offset as u64,
            len: n as u32,
        };
        let data = match payload {
            Buffer::Host(bytes) => bytes.slice(offset..offset + n),
            Buffer::Device(device) => {
                let mut chunk = vec![0u8; n];
                device.copy_to_host(offset, &mut chunk)?;
                Bytes::from(chunk)
            }
        };
        written += write_vectored_all(writer, &[Bytes::copy_from_slice(&header.encode()), data]).await?;
        offset += n;
    }
    Ok(written)
}

/// 写出关闭通知。
pub(crate) async fn write_close<W: AsyncWrite + Unpin>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&[OP_CLOSE]).await?;
    writer.flush().await
}

async fn write_vectored_all<W>(writer: &mut W, segments: &[Bytes]) -> Result<usize>
where
    W: AsyncWrite + Unpin + Send,
{
    let total = segments.iter().map(Bytes::len).sum();
    let mut slices: Vec<IoSlice<'_>> = segments.iter().map(|b| IoSlice::new(b)).collect();
    let mut remaining: &mut [IoSlice<'_>] = &mut slices;
    while !remaining.is_empty() {
        let n = writer
            .write_vectored(remaining)
            .await
            .map_err(|err| map_io_error(error::PUT, err))?;
        if n == 0 {
            return Err(map_io_error(error::PUT, io::ErrorKind::WriteZero.into()));
        }
        IoSlice::advance_slices(&mut remaining, n);
    }
    Ok(total)
}

async fn read_op<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u8>> {
    let mut op = [0u8; 1];
    let n = reader
        .read(&mut op)
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    Ok((n == 1).then_some(op[0]))
}

fn truncated(what: &str) -> CommError {
    map_io_error(
        error::READ,
        io::Error::new(io::ErrorKind::UnexpectedEof, format!("peer went away {what}")),
    )
}

/// 读取一条完整消息：头部、全部 put 与完成标记。
pub(crate) async fn read_message<R>(reader: &mut R, params: &RecvParams) -> Result<Message>
where
    R: AsyncRead + Unpin + Send,
{
    match read_op(reader).await? {
        None | Some(OP_CLOSE) => return Err(CommError::stream_closed("fabric read")),
        Some(OP_MESSAGE) => {}
        Some(op) => return Err(protocol_violation(format!("expected MESSAGE, got op {op}"))),
    }
    let header_len = reader
        .read_u32()
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
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

    let device = if params.device_memory {
        params.device.as_deref()
    } else {
        None
    };
    let mut buffers = decoded.allocate(device)?;
    let registrations = register_receive(&params.context, &buffers, params.device_memory)?;

    let mut staging = Vec::new();
    for (index, buffer) in buffers.iter_mut().enumerate() {
        let mut filled = 0usize;
        let mut key = None;
        while filled < buffer.len() {
            let put = read_put(reader).await?;
            check_put(&put, index, filled, buffer.len(), params.chunk_size, &mut key)?;
            let n = put.len as usize;
            if let Some(host) = buffer.host_mut() {
                reader
                    .read_exact(&mut host[filled..filled + n])
                    .await
                    .map_err(|err| map_io_error(error::READ, err))?;
            } else {
                staging.resize(n, 0);
                reader
                    .read_exact(&mut staging[..n])
                    .await
                    .map_err(|err| map_io_error(error::READ, err))?;
                buffer.write_at(filled, &staging[..n])?;
            }
            filled += n;
        }
    }

    match read_op(reader).await? {
        Some(OP_COMPLETE) => {}
        None => return Err(truncated("before completion")),
        Some(op) => return Err(protocol_violation(format!("expected COMPLETE, got op {op}"))),
    }
    let completed = reader
        .read_u32()
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    if completed as usize != buffers.len() {
        return Err(protocol_violation(format!(
            "completion covers {completed} payloads, header declared {}",
            buffers.len()
        )));
    }
    drop(registrations);
    decoded.assemble(freeze_all(buffers))
}

fn register_receive(
    context: &Arc<FabricContext>,
    buffers: &[RecvBuffer],
    device_memory: bool,
) -> Result<Vec<MemoryRegion>> {
    buffers
        .iter()
        .map(|buffer| context.register_receive(buffer, device_memory))
        .collect()
}

async fn read_put<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PutHeader> {
    match read_op(reader).await? {
        Some(OP_PUT) => {}
        Some(OP_CLOSE) | None => return Err(truncated("in the middle of a message")),
        Some(op) => return Err(protocol_violation(format!("expected PUT, got op {op}"))),
    }
    let mut raw = [0u8; PUT_FIELDS_LEN];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|err| map_io_error(error::READ, err))?;
    Ok(PutHeader::decode(&raw))
}

fn check_put(
    put: &PutHeader,
    index: usize,
    filled: usize,
    capacity: usize,
    chunk_size: usize,
    key: &mut Option<u64>,
) -> Result<()> {
    if put.index as usize != index {
        return Err(protocol_violation(format!(
            "put targets payload {}, expected {index}",
            put.index
        )));
    }
    if put.offset != filled as u64 {
        return Err(protocol_violation(format!(
            "put offset {} not contiguous with {filled} bytes received",
            put.offset
        )));
    }
    let len = put.len as usize;
    if len == 0 || len > chunk_size {
        return Err(protocol_violation(format!(
            "put of {len} bytes outside negotiated chunk size {chunk_size}"
        )));
    }
    if filled + len > capacity {
        return Err(protocol_violation(format!(
            "put [{}, +{len}) exceeds payload {index} of {capacity} bytes",
            put.offset
        )));
    }
    match key {
        Some(expected) if *expected != put.key => Err(protocol_violation(format!(
            "payload {index} switched registration key {expected} -> {}",
            put.key
        ))),
        Some(_) => Ok(()),
        None => {
            *key = Some(put.key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwire_core::ErrorKind;
    use taskwire_core::memory::{EmulatedDevice, MemoryKind};
    use taskwire_core::message::{Bulk, Value};

    fn send_params(chunk_size: usize) -> SendParams {
        SendParams {
            context: FabricContext::acquire(),
            device_memory: true,
            registration: RegistrationMode::Eager,
            chunk_size,
        }
    }

    fn recv_params(chunk_size: usize, device: Option<EmulatedDevice>) -> RecvParams {
        RecvParams {
            context: FabricContext::acquire(),
            device: device.map(|d| Arc::new(d) as Arc<dyn DeviceAllocator>),
            device_memory: true,
            limits: FrameLimits::default(),
            chunk_size,
        }
    }

    #[test]
    fn put_header_layout() {
        let header = PutHeader {
            index: 3,
            key: 0xdead_beef,
            offset: 4096,
            len: 17,
        };
        let encoded = header.encode();
        assert_eq!(encoded[0], OP_PUT);
        let mut fields = [0u8; PUT_FIELDS_LEN];
        fields.copy_from_slice(&encoded[1..]);
        assert_eq!(PutHeader::decode(&fields), header);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunked_message_round_trips() {
        let device = EmulatedDevice::new();
        let host: Bytes = (0..10_000u32).map(|i| i as u8).collect::<Vec<u8>>().into();
        let on_device = device.upload(&[7u8; 9_000]).expect("upload");
        let message = Value::from([
            ("a", Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(host.clone())]))),
            ("b", Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Device(on_device)]))),
            ("c", Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::new())]))),
        ]);
        let frames = FrameSet::encode(&message).expect("encode");
        let params = send_params(4096);
        let regions = params.register_all(&frames).expect("register");

        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            write_message(&mut a, &frames, Some(regions), &params).await
        });
        let received = read_message(&mut b, &recv_params(4096, Some(device)))
            .await
            .expect("read");
        writer.await.expect("join").expect("write");

        assert_eq!(received, message);
        let b_frame = &received.get("b").and_then(Value::as_bulk).expect("b").frames[0];
        assert_eq!(b_frame.kind(), MemoryKind::Device);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_bounds_put_is_rejected() {
        let message = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::from_static(b"0123"))]));
        let frames = FrameSet::encode(&message).expect("encode");
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        a.write_all(&[OP_MESSAGE]).await.expect("op");
        a.write_all(&frames.prefix()).await.expect("prefix");
        let bogus = PutHeader {
            index: 0,
            key: 1,
            offset: 0,
            len: 8,
        };
        a.write_all(&bogus.encode()).await.expect("put");
        a.write_all(b"01234567").await.expect("data");

        let err = read_message(&mut b, &recv_params(4096, None))
            .await
            .expect_err("oversized put");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_notice_and_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_close(&mut a).await.expect("close");
        let err = read_message(&mut b, &recv_params(4096, None))
            .await
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::StreamClosed);

        let message = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::from_static(b"0123"))]));
        let frames = FrameSet::encode(&message).expect("encode");
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[OP_MESSAGE]).await.expect("op");
        a.write_all(&frames.prefix()).await.expect("prefix");
        drop(a);
        let err = read_message(&mut b, &recv_params(4096, None))
            .await
            .expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lazy_registration_failure_surfaces_mid_message() {
        let ineligible = EmulatedDevice::new().with_fabric_eligible(false);
        let message = Value::List(vec![
            Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::from_static(b"ok"))])),
            Value::Bulk(Bulk::new(
                Value::Null,
                vec![Buffer::Device(ineligible.upload(b"nope").expect("upload"))],
            )),
        ]);
        let frames = FrameSet::encode(&message).expect("encode");
        let mut params = send_params(4096);
        params.registration = RegistrationMode::Lazy;
        let (mut a, _b) = tokio::io::duplex(64 * 1024);
        let err = write_message(&mut a, &frames, None, &params)
            .await
            .expect_err("lazy failure");
        assert_eq!(err.kind(), ErrorKind::BufferRegistrationFailed);
    }
}
