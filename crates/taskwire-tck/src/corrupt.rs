//! 伪造帧构造器：供各流式后端在真实套接字上验证解码上限。
//!
//! 产出的都是线路前缀 `[u32 BE 头部长度][头部][u32 BE 负载数量]`，流式后端按各自的
//! 操作码包装后写给被测 Comm。

use anyhow::ensure;
use taskwire_core::frame::{FRAME_VERSION, FrameSet};
use taskwire_core::memory::Buffer;
use taskwire_core::message::{Bulk, Value};

/// `List` 在线路上的变体序号。
const LIST_VARIANT: u32 = 6;
/// `Null` 在线路上的变体序号。
const NULL_VARIANT: u32 = 0;

/// 单负载消息的头部，唯一描述符的长度被改写为 `len`。
///
/// 头部末尾 12 字节是该描述符的 `[len: u64 LE][kind: u32 LE]`。
pub fn header_with_payload_len(len: u64) -> anyhow::Result<Vec<u8>> {
    let message = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::from(vec![7u8])]));
    let mut header = FrameSet::encode(&message)?.header().to_vec();
    ensure!(header.len() >= 12, "header of {} bytes has no descriptor", header.len());
    let at = header.len() - 12;
    header[at..at + 8].copy_from_slice(&len.to_le_bytes());
    Ok(header)
}

/// `List` 嵌套 `depth` 层、最内层为 `Null`、没有描述符的头部。
pub fn header_with_nesting(depth: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(1 + depth * 12 + 12);
    header.push(FRAME_VERSION);
    for _ in 0..depth {
        header.extend_from_slice(&LIST_VARIANT.to_le_bytes());
        header.extend_from_slice(&1u64.to_le_bytes());
    }
    header.extend_from_slice(&NULL_VARIANT.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes());
    header
}

/// 给头部加上长度前缀与负载数量。
pub fn frame_prefix(header: &[u8], count: u32) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(header.len() + 8);
    prefix.extend_from_slice(&(header.len() as u32).to_be_bytes());
    prefix.extend_from_slice(header);
    prefix.extend_from_slice(&count.to_be_bytes());
    prefix
}

/// 声明 `len` 字节负载、实际不带负载的前缀。
pub fn forged_payload_len_frame(len: u64) -> anyhow::Result<Vec<u8>> {
    Ok(frame_prefix(&header_with_payload_len(len)?, 1))
}

/// 嵌套 `depth` 层的前缀。
pub fn deeply_nested_frame(depth: usize) -> Vec<u8> {
    frame_prefix(&header_with_nesting(depth), 0)
}
