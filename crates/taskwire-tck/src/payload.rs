//! 零拷贝负载断言：主机缓冲、设备缓冲、数组与零长度负载。

use anyhow::{Context, ensure};
use bytes::Bytes;
use taskwire_core::bridge::{NdArray, from_serialize, to_serialize};
use taskwire_core::error::ErrorKind;
use taskwire_core::memory::{Buffer, MemoryKind};
use taskwire_core::message::{Bulk, Value};

use crate::harness::{Harness, echo_handler, within};

/// 生成可辨认的字节序列，错位或截断都会导致比较失败。
pub fn pattern(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

/// 每个 N 字节的主机负载精确往返。
pub async fn assert_host_bulk_round_trip(harness: &Harness, sizes: &[usize]) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;

    for (index, len) in sizes.iter().copied().enumerate() {
        let data = pattern(len, index as u8);
        let message = Value::from([
            ("op", Value::from("put")),
            ("nbytes", Value::from(len as i64)),
            (
                "data",
                Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(data.clone())])),
            ),
        ]);
        within("write bulk", comm.write(&message)).await??;
        let mut echoed = within("read bulk", comm.read()).await??;
        let bulk = match echoed.remove("data") {
            Some(Value::Bulk(bulk)) => bulk,
            other => anyhow::bail!("payload of {len} bytes came back as {other:?}"),
        };
        ensure!(bulk.frames.len() == 1, "expected one frame, got {}", bulk.frames.len());
        let frame = bulk.frames[0].to_host_bytes()?;
        ensure!(frame.len() == len, "sent {len} bytes, received {}", frame.len());
        ensure!(frame == data, "payload of {len} bytes corrupted");
        ensure!(
            echoed.get("nbytes").and_then(Value::as_int) == Some(len as i64),
            "inline fields lost next to the payload"
        );
    }

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 同一消息中的多个负载（含零长度负载）各自保持边界。
pub async fn assert_multi_frame_message(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;

    let frames = vec![
        Buffer::Host(pattern(17, 1)),
        Buffer::Host(Bytes::new()),
        Buffer::Host(pattern(4096, 2)),
        Buffer::Host(Bytes::new()),
    ];
    let message = Value::List(vec![
        Value::Bulk(Bulk::new(Value::from("first"), frames.clone())),
        Value::from("between"),
        Value::Bulk(Bulk::new(Value::from("second"), vec![Buffer::Host(pattern(3, 9))])),
    ]);
    within("write", comm.write(&message)).await??;
    let echoed = within("read", comm.read()).await??;
    ensure!(echoed == message, "multi-frame message changed");

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 10×10 数组经序列化桥往返。
pub async fn assert_ndarray_round_trip(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;

    let values: Vec<f64> = (0..100).map(|i| f64::from(i) * 1.5).collect();
    let array = NdArray::from_f64(vec![10, 10], &values)?;
    let message = Value::from([("op", Value::from("array")), ("x", to_serialize(&array)?)]);
    within("write", comm.write(&message)).await??;
    let mut echoed = within("read", comm.read()).await??;
    let back: NdArray = from_serialize(echoed.remove("x").context("array field missing")?)?;
    ensure!(back.shape() == [10, 10], "shape changed to {:?}", back.shape());
    ensure!(back.to_f64_vec()? == values, "array values changed");

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 设备负载往返后仍位于设备内存，内容不变。需要 [`Harness::with_device`]。
pub async fn assert_device_bulk_round_trip(harness: &Harness, len: usize) -> anyhow::Result<()> {
    let device = harness
        .device()
        .context("device round trip requires a harness with an emulated device")?
        .clone();
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;

    let data = pattern(len, 7);
    let region = device.upload(&data)?;
    let message = Value::from([(
        "data",
        Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Device(region)])),
    )]);
    within("write device payload", comm.write(&message)).await??;
    let echoed = within("read device payload", comm.read()).await??;
    let frame = echoed
        .get("data")
        .and_then(Value::as_bulk)
        .and_then(|bulk| bulk.frames.first())
        .context("device payload missing")?;
    ensure!(
        frame.kind() == MemoryKind::Device,
        "device payload arrived as {:?}",
        frame.kind()
    );
    ensure!(frame.to_host_bytes()? == data, "device payload corrupted");

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 发送端给出无法注册的设备缓冲时返回 `BufferRegistrationFailed`，不静默退化为拷贝；
/// 注册先于任何写出，失败后会话保持同步可用。
pub async fn assert_registration_failure_is_explicit(harness: &Harness) -> anyhow::Result<()> {
    let device = harness
        .device()
        .context("registration check requires a harness with an emulated device")?
        .clone()
        .with_fabric_eligible(false);
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;

    let region = device.upload(&pattern(1024, 3))?;
    let message = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Device(region)]));
    match within("write pinned-less payload", comm.write(&message)).await? {
        Ok(_) => anyhow::bail!("unregistrable device buffer was sent"),
        Err(err) => ensure!(
            err.kind() == ErrorKind::BufferRegistrationFailed,
            "expected BufferRegistrationFailed, got {err}"
        ),
    }
    ensure!(!comm.closed(), "comm closed by a registration failure before any byte was sent");
    let follow_up = Value::from([("op", "after-failure")]);
    within("write after failure", comm.write(&follow_up)).await??;
    let echoed = within("read after failure", comm.read()).await??;
    ensure!(echoed == follow_up, "session desynchronised after registration failure");

    comm.close().await?;
    listener.stop().await;
    Ok(())
}
