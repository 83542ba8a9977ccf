//! 对端发送伪造帧时，读取方返回 `DecodeError` 并关闭 Comm，而不是分配巨量内存或耗尽栈。
//!
//! # 教案式说明
//! - **Why**：头部中的负载长度与嵌套结构都来自对端，解码上限必须在分配与递归之前生效；
//! - **How**：裸 `TcpListener` 扮演对端，向真实的 [`TcpComm`] 写入 `taskwire_tck::corrupt` 构造的前缀；
//! - **What**：读取返回 `DecodeError`，Comm 进入关闭态，后续读取返回 `CommClosed`。

use std::time::Duration;

use taskwire_core::comm::Comm;
use taskwire_core::error::ErrorKind;
use taskwire_core::frame::FrameLimits;
use taskwire_core::options::ConnectOptions;
use taskwire_tck::corrupt;
use taskwire_transport_tcp::TcpComm;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// 裸对端：接受一个连接，写出 `bytes` 后保持连接，错误只能来自解码而不是 EOF。
async fn raw_peer(bytes: Vec<u8>) -> (u16, JoinHandle<()>) {
    let acceptor = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = acceptor.local_addr().expect("addr").port();
    let task = tokio::spawn(async move {
        let (mut stream, _) = acceptor.accept().await.expect("accept");
        stream.write_all(&bytes).await.expect("send forged frame");
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    (port, task)
}

async fn read_forged(bytes: Vec<u8>, options: &ConnectOptions) {
    let (port, peer) = raw_peer(bytes).await;
    let comm = TcpComm::connect(&format!("127.0.0.1:{port}"), options)
        .await
        .expect("connect");
    let err = tokio::time::timeout(Duration::from_secs(10), comm.read())
        .await
        .expect("read finished")
        .expect_err("forged frame must not decode");
    assert_eq!(err.kind(), ErrorKind::DecodeError, "{err}");
    assert!(comm.closed(), "comm still open after DecodeError");
    let err = comm.read().await.expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::CommClosed);
    peer.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn forged_payload_length_is_decode_error() {
    for len in [1u64 << 63, 1u64 << 40] {
        let frame = corrupt::forged_payload_len_frame(len).expect("forge");
        read_forged(frame, &ConnectOptions::default()).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn deeply_nested_header_is_decode_error() {
    read_forged(corrupt::deeply_nested_frame(2_000_000), &ConnectOptions::default()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_limit_is_configurable() {
    let mut frame = corrupt::forged_payload_len_frame(1024).expect("forge");
    frame.extend_from_slice(&[0u8; 1024]);
    let options = ConnectOptions::default().with_limits(FrameLimits {
        max_payload_bytes: 512,
        ..FrameLimits::default()
    });
    read_forged(frame, &options).await;
}
