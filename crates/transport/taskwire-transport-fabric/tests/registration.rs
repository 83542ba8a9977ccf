//! Fabric 特有语义：注册失败、设备内存开关、懒注册与握手失败。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use taskwire_core::error::ErrorKind;
use taskwire_core::listener::ListenerEvent;
use taskwire_core::memory::{Buffer, EmulatedDevice, MemoryKind};
use taskwire_core::message::{Bulk, Value};
use taskwire_tck::{Harness, echo_handler, within};
use taskwire_transport_fabric::FabricBackend;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn harness() -> Harness {
    Harness::new(Arc::new(FabricBackend::new()), "127.0.0.1:0").with_device(EmulatedDevice::new())
}

fn device_message(device: &EmulatedDevice, len: usize) -> Value {
    let region = device.upload(&vec![0x5a; len]).expect("upload");
    Value::from([("x", Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Device(region)])))])
}

/// `device_memory=false` 时发送设备缓冲显式失败，Comm 保持可用。
#[tokio::test(flavor = "multi_thread")]
async fn device_memory_disabled_rejects_device_payloads() {
    let harness = harness().with_connect_options(|options| options.with_option("device_memory", false));
    let mut listener = harness.listen(echo_handler()).await.expect("bind");
    let comm = harness.connect(&listener).await.expect("connect");

    let device = harness.device().expect("device").clone();
    let err = comm
        .write(&device_message(&device, 1024))
        .await
        .expect_err("device payload with device memory disabled");
    assert_eq!(err.kind(), ErrorKind::BufferRegistrationFailed);
    assert!(!comm.closed());

    let host = Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::from_static(b"host"))]));
    comm.write(&host).await.expect("host payload still works");
    assert_eq!(comm.read().await.expect("echo"), host);

    comm.close().await.expect("close");
    listener.stop().await;
}

/// 接收端关闭设备内存时，设备负载落入主机内存，内容不变。
#[tokio::test(flavor = "multi_thread")]
async fn receiver_without_device_memory_lands_in_host() {
    let harness = harness().with_listen_options(|options| options.with_option("device_memory", false));
    let mut listener = harness.listen(echo_handler()).await.expect("bind");
    let comm = harness.connect(&listener).await.expect("connect");

    let device = harness.device().expect("device").clone();
    let message = device_message(&device, 10_000);
    comm.write(&message).await.expect("write");
    let echoed = comm.read().await.expect("read");
    // 服务端以主机内存接收再原样写回，客户端重新落入设备内存。
    let frame = &echoed.get("x").and_then(Value::as_bulk).expect("bulk").frames[0];
    assert_eq!(frame.kind(), MemoryKind::Device);
    assert_eq!(echoed, message);

    comm.close().await.expect("close");
    listener.stop().await;
}

/// 懒注册在帧中途失败时关闭 Comm。
#[tokio::test(flavor = "multi_thread")]
async fn lazy_registration_failure_closes_comm() {
    let harness = harness().with_connect_options(|options| options.with_option("registration", "lazy"));
    let mut listener = harness.listen(echo_handler()).await.expect("bind");
    let comm = harness.connect(&listener).await.expect("connect");

    let ineligible = EmulatedDevice::new().with_fabric_eligible(false);
    let message = Value::List(vec![
        Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::from_static(b"first"))])),
        device_message(&ineligible, 64),
    ]);
    let err = comm.write(&message).await.expect_err("lazy registration failure");
    assert_eq!(err.kind(), ErrorKind::BufferRegistrationFailed);
    assert!(comm.closed(), "partially written frame left the comm open");
    let err = comm.write(&Value::Null).await.expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::CommClosed);

    listener.stop().await;
}

/// 非 Fabric 客户端的连接以 `EstablishFailed` 上报，监听器继续服务。
#[tokio::test(flavor = "multi_thread")]
async fn garbage_handshake_is_reported_and_isolated() {
    let harness = harness();
    let mut listener = harness.listen(echo_handler()).await.expect("bind");
    let mut events = listener.take_events().expect("events");

    let (host, port) = listener.host_port().expect("host_port");
    let mut raw = tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .expect("raw connect");
    raw.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.expect("garbage");

    let event = within("establish failure", events.recv())
        .await
        .expect("step")
        .expect("event");
    match event {
        ListenerEvent::EstablishFailed { kind, .. } => assert_eq!(kind, ErrorKind::HandshakeFailed),
        other => panic!("unexpected event {other:?}"),
    }
    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), raw.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "server kept the garbage connection open");

    let comm = harness.connect(&listener).await.expect("healthy client");
    comm.write(&Value::from("still serving")).await.expect("write");
    assert_eq!(comm.read().await.expect("read"), Value::from("still serving"));
    comm.close().await.expect("close");
    listener.stop().await;
}

/// 握手成功的客户端在 `extra_info` 中看到协商后的分块与对端端点。
#[tokio::test(flavor = "multi_thread")]
async fn chunk_size_is_negotiated_down() {
    let harness = harness()
        .with_connect_options(|options| options.with_option("chunk_size", 1 << 20))
        .with_listen_options(|options| options.with_option("chunk_size", 16 * 1024));
    let mut listener = harness.listen(echo_handler()).await.expect("bind");
    let comm = harness.connect(&listener).await.expect("connect");

    let info = comm.extra_info();
    assert_eq!(info.chunk_size, Some(16 * 1024));
    let endpoint = info.peer_endpoint.expect("peer endpoint");
    assert_eq!(endpoint >> 32, u64::from(std::process::id()));

    comm.close().await.expect("close");
    listener.stop().await;
}
