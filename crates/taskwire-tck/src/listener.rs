//! 监听器语义断言：端口 0、失败隔离、停止与拒绝连接。

use anyhow::{Context, bail, ensure};
use taskwire_core::comm::BoxComm;
use taskwire_core::error::ErrorKind;
use taskwire_core::listener::{HandlerError, ListenerEvent, handler_fn};
use taskwire_core::message::Value;

use crate::harness::{Harness, ping, pong_handler, within};

/// 端口 0 解析为具体端口，客户端可经公布地址连通。
pub async fn assert_port_zero_resolves(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(pong_handler()).await?;
    let (host, port) = listener.host_port()?;
    ensure!(port > 0, "listener on port 0 reports port {port}");
    ensure!(!host.is_empty(), "contact host is empty");
    ensure!(
        !listener.listen_address().ends_with(":0"),
        "listen address {} still carries port 0",
        listener.listen_address()
    );

    let comm = harness.connect(&listener).await?;
    within("write", comm.write(&ping(1))).await??;
    within("read", comm.read()).await??;
    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 处理器失败只影响自己的会话：该会话被关闭、失败写入旁路通道，后续会话照常服务。
pub async fn assert_handler_failure_isolated(harness: &Harness) -> anyhow::Result<()> {
    let handler = handler_fn(|comm: BoxComm| async move {
        let message = comm.read().await?;
        if message.get("op").and_then(Value::as_str) == Some("fail") {
            return Err::<(), HandlerError>("requested failure".into());
        }
        comm.write(&Value::from([("op", "pong")])).await?;
        comm.read().await.ok();
        Ok(())
    });
    let mut listener = harness.listen(handler).await?;
    let mut events = listener.take_events().context("event channel already taken")?;

    let failing = harness.connect(&listener).await?;
    within("write fail", failing.write(&Value::from([("op", "fail")]))).await??;
    let event = within("handler failure event", events.recv())
        .await?
        .context("event channel closed")?;
    match event {
        ListenerEvent::HandlerFailed { error, .. } => {
            ensure!(error.contains("requested failure"), "unexpected error text {error}")
        }
        other => bail!("expected HandlerFailed, got {other:?}"),
    }
    match within("read on failed session", failing.read()).await? {
        Ok(message) => bail!("failed session still delivered {message:?}"),
        Err(err) => ensure!(
            matches!(err.kind(), ErrorKind::StreamClosed | ErrorKind::ConnectionReset),
            "failed session surfaced {err}"
        ),
    }

    let healthy = harness.connect(&listener).await?;
    within("write ping", healthy.write(&Value::from([("op", "ping")]))).await??;
    let reply = within("read pong", healthy.read()).await??;
    ensure!(
        reply.get("op").and_then(Value::as_str) == Some("pong"),
        "healthy session got {reply:?}"
    );
    ensure!(listener.stats().handler_failures == 1, "stats {:?}", listener.stats());

    healthy.close().await?;
    listener.stop().await;
    Ok(())
}

/// 停止后绑定资源被释放：再次连接被拒绝。
pub async fn assert_stop_releases_binding(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(pong_handler()).await?;
    let address = listener.contact_address().to_owned();
    listener.stop().await;
    ensure!(!listener.is_running(), "listener still running after stop");
    listener.stop().await;

    match within("connect after stop", harness.connect_to(&address)).await? {
        Ok(comm) => bail!("connected to stopped listener: {comm:?}"),
        Err(err) => ensure!(
            err.kind() == ErrorKind::ConnectionRefused,
            "expected ConnectionRefused, got {err}"
        ),
    }
    Ok(())
}

/// 连接不存在的位置返回 `ConnectionRefused`。
pub async fn assert_connect_refused(harness: &Harness, address: &str) -> anyhow::Result<()> {
    match within("connect", harness.connect_to(address)).await? {
        Ok(comm) => bail!("connected to {address}: {comm:?}"),
        Err(err) => ensure!(
            err.kind() == ErrorKind::ConnectionRefused,
            "expected ConnectionRefused for {address}, got {err}"
        ),
    }
    Ok(())
}
