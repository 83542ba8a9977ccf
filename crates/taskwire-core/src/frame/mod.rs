//! 帧编解码与零拷贝桥。
//!
//! # 设计背景（Why）
//! - 一条消息被拆成“控制头部 + 零个或多个负载帧”：头部携带结构化内容与每个负载的
//!   精确尺寸，接收端据此在负载到达前分配好缓冲，这是零拷贝接收的前提；
//! - 负载帧在发送端只被借用（`Bytes`/设备缓冲的引用计数克隆），编码过程不复制负载字节。
//!
//! # 线路格式（What）
//! ```text
//! [header_length: u32 BE][header_bytes][payload_count: u32 BE][payload_0]...[payload_N-1]
//! ```
//! - `header_bytes` 为 bincode 编码的 `{version, body, descriptors}`；
//! - `payload_count` 必须与头部声明的描述符数量一致，否则视为帧损坏；
//! - 各后端可以把负载切块传输，但 `read` 只在全部负载到齐后返回。
//!
//! # 执行逻辑（How）
//! 1. [`FrameSet::encode`]：第一遍遍历消息，用占位符替换大块负载并收集描述符；
//!    第二遍把头部编码为字节并生成线路前缀；
//! 2. [`DecodedHeader::decode`]：先解头部，再由 [`DecodedHeader::allocate`] 按描述符分配接收缓冲；
//! 3. [`DecodedHeader::assemble`]：负载到齐后替换占位符，还原消息原貌。

mod wire;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CommError, ErrorKind, Result, codes};
use crate::memory::{Buffer, DeviceAllocator, MemoryKind, RecvBuffer};
use crate::message::Message;

use wire::{WireHeader, WireValue};

/// 头部格式版本。
pub const FRAME_VERSION: u8 = 1;

/// 长度前缀字节数。
pub const LEN_PREFIX: usize = 4;

/// 单个负载的描述：长度与期望的内存种类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub len: u64,
    pub kind: MemoryKind,
}

/// 解码侧的防御性上限。
///
/// 头部长度、负载数量与负载字节数都来自对端，超过上限直接判定为帧损坏，
/// 避免一次恶意前缀触发巨量分配。`max_payload_bytes` 约束单条消息全部负载之和，
/// 在分配任何接收缓冲之前检查。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLimits {
    pub max_header_len: u32,
    pub max_payloads: u32,
    pub max_payload_bytes: u64,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_len: 64 * 1024 * 1024,
            max_payloads: 65_536,
            max_payload_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl FrameLimits {
    /// 校验对端声明的头部长度。
    pub fn check_header_len(&self, len: u32) -> Result<()> {
        if len > self.max_header_len {
            return Err(CommError::decode(format!(
                "header length {len} exceeds limit {}",
                self.max_header_len
            )));
        }
        Ok(())
    }

    /// 校验对端声明的负载数量。
    pub fn check_payload_count(&self, count: u32) -> Result<()> {
        if count > self.max_payloads {
            return Err(CommError::decode(format!(
                "payload count {count} exceeds limit {}",
                self.max_payloads
            )));
        }
        Ok(())
    }

    /// 校验描述符声明的负载总字节数。
    pub fn check_payload_bytes(&self, descriptors: &[PayloadDescriptor]) -> Result<()> {
        let total = descriptors
            .iter()
            .try_fold(0u64, |total, descriptor| total.checked_add(descriptor.len));
        match total {
            Some(total) if total <= self.max_payload_bytes => Ok(()),
            Some(total) => Err(CommError::decode(format!(
                "payloads declare {total} bytes, limit is {}",
                self.max_payload_bytes
            ))),
            None => Err(CommError::decode("declared payload length overflows u64")),
        }
    }
}

/// 一条消息的线路分解。
#[derive(Clone, Debug)]
pub struct FrameSet {
    header: Bytes,
    descriptors: Vec<PayloadDescriptor>,
    payloads: Vec<Buffer>,
}

impl FrameSet {
    /// 两遍编码消息。
    pub fn encode(message: &Message) -> Result<Self> {
        let mut descriptors = Vec::new();
        let mut payloads = Vec::new();
        let body = wire::lower(message, &mut descriptors, &mut payloads, 0)?;
        let header = WireHeader {
            version: FRAME_VERSION,
            body,
            descriptors,
        };
        let encoded = bincode::serialize(&header).map_err(|err| {
            CommError::new(
                ErrorKind::DecodeError,
                codes::FRAME_ENCODE,
                format!("header encoding failed: {err}"),
            )
            .with_source(err)
        })?;
        if u32::try_from(encoded.len()).is_err() {
            return Err(CommError::new(
                ErrorKind::DecodeError,
                codes::FRAME_ENCODE,
                format!("header of {} bytes does not fit the length prefix", encoded.len()),
            ));
        }
        Ok(Self {
            header: Bytes::from(encoded),
            descriptors: header.descriptors,
            payloads,
        })
    }

    /// 编码后的头部字节。
    pub fn header(&self) -> &Bytes {
        &self.header
    }

    /// 负载描述符，顺序与负载一致。
    pub fn descriptors(&self) -> &[PayloadDescriptor] {
        &self.descriptors
    }

    /// 被借用的负载缓冲。
    pub fn payloads(&self) -> &[Buffer] {
        &self.payloads
    }

    /// 线路前缀：`[header_length][header][payload_count]`。
    pub fn prefix(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.header.len() + 2 * LEN_PREFIX);
        out.put_u32(self.header.len() as u32);
        out.put_slice(&self.header);
        out.put_u32(self.payloads.len() as u32);
        out.freeze()
    }

    /// 负载总字节数。
    pub fn payload_bytes(&self) -> u64 {
        self.descriptors.iter().map(|d| d.len).sum()
    }

    /// 整条消息在线路上的字节数。
    pub fn wire_len(&self) -> u64 {
        (self.header.len() + 2 * LEN_PREFIX) as u64 + self.payload_bytes()
    }
}

/// 已解码、尚未拼装负载的头部。
#[derive(Debug)]
pub struct DecodedHeader {
    body: WireValue,
    descriptors: Vec<PayloadDescriptor>,
}

impl DecodedHeader {
    /// 解码头部字节。
    ///
    /// 头部中的嵌套深度、字符串与序列长度在反序列化过程中即受约束，
    /// 描述符声明的负载总量在返回前对照 `limits` 检查，之后的 [`allocate`](Self::allocate)
    /// 只会看到已经通过上限检查的长度。
    pub fn decode(header: &[u8], limits: &FrameLimits) -> Result<Self> {
        let decoded: WireHeader = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(header.len() as u64)
            .deserialize(header)
            .map_err(|err| {
                CommError::decode(format!("header decoding failed: {err}")).with_source(err)
            })?;
        if decoded.version != FRAME_VERSION {
            return Err(CommError::decode(format!(
                "unsupported frame version {}",
                decoded.version
            )));
        }
        let count = u32::try_from(decoded.descriptors.len())
            .map_err(|_| CommError::decode("descriptor count overflows u32"))?;
        limits.check_payload_count(count)?;
        limits.check_payload_bytes(&decoded.descriptors)?;
        Ok(Self {
            body: decoded.body,
            descriptors: decoded.descriptors,
        })
    }

    /// 头部声明的负载描述符。
    pub fn descriptors(&self) -> &[PayloadDescriptor] {
        &self.descriptors
    }

    /// 校验线路上的负载数量与头部声明一致。
    pub fn check_count(&self, count: u32) -> Result<()> {
        if count as usize != self.descriptors.len() {
            return Err(CommError::decode(format!(
                "frame declares {count} payloads but header describes {}",
                self.descriptors.len()
            )));
        }
        Ok(())
    }

    /// 为每个描述符分配接收缓冲。
    pub fn allocate(&self, device: Option<&dyn DeviceAllocator>) -> Result<Vec<RecvBuffer>> {
        self.descriptors
            .iter()
            .map(|descriptor| {
                let len = usize::try_from(descriptor.len)
                    .map_err(|_| CommError::decode("payload length overflows usize"))?;
                RecvBuffer::allocate(len, descriptor.kind, device)
            })
            .collect()
    }

    /// 用接收完成的缓冲替换占位符，得到原始消息。
    pub fn assemble(self, payloads: Vec<Buffer>) -> Result<Message> {
        if payloads.len() != self.descriptors.len() {
            return Err(CommError::decode(format!(
                "received {} payloads, header describes {}",
                payloads.len(),
                self.descriptors.len()
            )));
        }
        for (index, (payload, descriptor)) in payloads.iter().zip(&self.descriptors).enumerate() {
            if payload.len() as u64 != descriptor.len {
                return Err(CommError::decode(format!(
                    "payload {index} has {} bytes, header declares {}",
                    payload.len(),
                    descriptor.len
                )));
            }
        }
        let mut slots: Vec<Option<Buffer>> = payloads.into_iter().map(Some).collect();
        let message = wire::raise(self.body, &mut slots, 0)?;
        if let Some(index) = slots.iter().position(Option::is_some) {
            return Err(CommError::decode(format!(
                "payload {index} is not referenced by the header"
            )));
        }
        Ok(message)
    }
}

/// 把 [`RecvBuffer`] 冻结为负载列表。
pub fn freeze_all(buffers: Vec<RecvBuffer>) -> Vec<Buffer> {
    buffers.into_iter().map(RecvBuffer::freeze).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::EmulatedDevice;
    use crate::message::{Bulk, Value};
    use proptest::prelude::*;

    fn round_trip(message: &Message, device: Option<&dyn DeviceAllocator>) -> Message {
        let frames = FrameSet::encode(message).expect("encode");
        let prefix = frames.prefix();
        let header_len = u32::from_be_bytes(prefix[..4].try_into().expect("len")) as usize;
        let header = &prefix[4..4 + header_len];
        let count = u32::from_be_bytes(prefix[4 + header_len..].try_into().expect("count"));
        let decoded = DecodedHeader::decode(header, &FrameLimits::default()).expect("decode");
        decoded.check_count(count).expect("count");
        let mut buffers = decoded.allocate(device).expect("allocate");
        for (buffer, payload) in buffers.iter_mut().zip(frames.payloads()) {
            let bytes = payload.to_host_bytes().expect("stage");
            buffer.write_at(0, &bytes).expect("fill");
        }
        decoded.assemble(freeze_all(buffers)).expect("assemble")
    }

    #[test]
    fn pure_header_message_has_no_payloads() {
        let message = Value::from([("op", "ping")]);
        let frames = FrameSet::encode(&message).expect("encode");
        assert!(frames.descriptors().is_empty());
        assert_eq!(round_trip(&message, None), message);
    }

    #[test]
    fn bulk_payloads_become_descriptors() {
        let bulk = Bulk::new(
            Value::from([("dtype", "u8")]),
            vec![Buffer::from(vec![1u8, 2, 3]), Buffer::from(Vec::new())],
        );
        let message = Value::from([("op", Value::from("put")), ("data", Value::Bulk(bulk))]);
        let frames = FrameSet::encode(&message).expect("encode");
        assert_eq!(
            frames.descriptors(),
            &[
                PayloadDescriptor { len: 3, kind: MemoryKind::Host },
                PayloadDescriptor { len: 0, kind: MemoryKind::Host },
            ]
        );
        assert_eq!(frames.payload_bytes(), 3);
        assert_eq!(round_trip(&message, None), message);
    }

    #[test]
    fn device_payloads_are_received_on_device() {
        let device = EmulatedDevice::new();
        let region = device.upload(&[7u8; 64]).expect("upload");
        let message = Value::from([("data", Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Device(region)])))]);
        let received = round_trip(&message, Some(&device));
        let frame = &received.get("data").and_then(Value::as_bulk).expect("bulk").frames[0];
        assert_eq!(frame.kind(), MemoryKind::Device);
        assert_eq!(received, message);
    }

    #[test]
    fn count_mismatch_is_decode_error() {
        let message = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::from(vec![1u8])]));
        let frames = FrameSet::encode(&message).expect("encode");
        let decoded = DecodedHeader::decode(frames.header(), &FrameLimits::default()).expect("decode");
        assert_eq!(decoded.check_count(2).expect_err("mismatch").kind(), ErrorKind::DecodeError);
        let err = decoded.assemble(vec![Buffer::from(vec![1u8, 2])]).expect_err("size mismatch");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[test]
    fn corrupt_header_is_decode_error() {
        let err = DecodedHeader::decode(&[0xff, 0x00, 0x13], &FrameLimits::default())
            .expect_err("garbage");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        let limits = FrameLimits { max_header_len: 8, ..FrameLimits::default() };
        assert!(limits.check_header_len(9).is_err());
    }

    /// 手工拼出 `List` 嵌套 `depth` 层、最内层为 `Null` 的头部字节。
    fn nested_list_header(depth: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(1 + depth * 12 + 12);
        header.push(FRAME_VERSION);
        for _ in 0..depth {
            header.extend_from_slice(&6u32.to_le_bytes());
            header.extend_from_slice(&1u64.to_le_bytes());
        }
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header
    }

    #[test]
    fn deeply_nested_header_is_decode_error() {
        let header = nested_list_header(2_000_000);
        let err = DecodedHeader::decode(&header, &FrameLimits::default()).expect_err("too deep");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert!(err.to_string().contains("nesting"), "{err}");

        let header = nested_list_header(wire::MAX_DEPTH + 1);
        assert!(DecodedHeader::decode(&header, &FrameLimits::default()).is_err());
    }

    #[test]
    fn nesting_at_the_limit_survives_the_codec() {
        let mut message = Value::Null;
        for _ in 0..wire::MAX_DEPTH {
            message = Value::List(vec![message]);
        }
        assert_eq!(round_trip(&message, None), message);

        let header = nested_list_header(wire::MAX_DEPTH);
        let decoded = DecodedHeader::decode(&header, &FrameLimits::default()).expect("decode");
        assert!(decoded.descriptors().is_empty());
    }

    fn forged_header(len: u64) -> Vec<u8> {
        let header = WireHeader {
            version: FRAME_VERSION,
            body: WireValue::Placeholder {
                meta: Box::new(WireValue::Null),
                first: 0,
                count: 1,
            },
            descriptors: vec![PayloadDescriptor { len, kind: MemoryKind::Host }],
        };
        bincode::serialize(&header).expect("serialize")
    }

    #[test]
    fn forged_payload_length_is_rejected_before_allocation() {
        for len in [1u64 << 63, 1u64 << 40, u64::MAX] {
            let err = DecodedHeader::decode(&forged_header(len), &FrameLimits::default())
                .expect_err("forged length");
            assert_eq!(err.kind(), ErrorKind::DecodeError, "len {len}");
        }
        let decoded = DecodedHeader::decode(&forged_header(16), &FrameLimits::default())
            .expect("honest length");
        assert_eq!(decoded.allocate(None).expect("allocate")[0].len(), 16);
    }

    #[test]
    fn payload_bytes_limit_sums_descriptors() {
        let limits = FrameLimits { max_payload_bytes: 10, ..FrameLimits::default() };
        let descriptor = |len| PayloadDescriptor { len, kind: MemoryKind::Host };
        assert!(limits.check_payload_bytes(&[descriptor(4), descriptor(6)]).is_ok());
        let err = limits
            .check_payload_bytes(&[descriptor(4), descriptor(7)])
            .expect_err("over limit");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        let err = FrameLimits::default()
            .check_payload_bytes(&[descriptor(u64::MAX), descriptor(1)])
            .expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e9f64..1.0e9).prop_map(Value::Float),
            "[a-z]{0,12}".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(|b| Value::Bytes(b.into())),
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(|b| Value::Bulk(Bulk::new(Value::Null, vec![Buffer::from(b)]))),
        ]
    }

    fn nested() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..6).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn nested_values_survive_the_codec(message in nested()) {
            prop_assert_eq!(round_trip(&message, None), message);
        }
    }
}
