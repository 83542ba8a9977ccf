//! Comm 生命周期与消息语义断言。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use bytes::Bytes;
use futures::future::try_join_all;
use taskwire_core::comm::{BoxComm, Comm, TransferMode};
use taskwire_core::context::CallContext;
use taskwire_core::error::ErrorKind;
use taskwire_core::listener::{CommHandler, HandlerError, handler_fn};
use taskwire_core::memory::Buffer;
use taskwire_core::message::{Bulk, Value};
use tokio::sync::{Notify, mpsc};

use crate::harness::{Harness, echo_handler, ping, pong_handler, within};

fn ensure_kind(actual: ErrorKind, allowed: &[ErrorKind], what: &str) -> anyhow::Result<()> {
    ensure!(
        allowed.contains(&actual),
        "{what}: expected one of {allowed:?}, got {actual:?}"
    );
    Ok(())
}

/// ping → pong 最小闭环。
pub async fn assert_ping_pong(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(pong_handler()).await?;
    let comm = harness.connect(&listener).await?;

    within("write ping", comm.write(&ping("hello"))).await??;
    let reply = within("read pong", comm.read()).await??;
    ensure!(
        reply == Value::from([("op", "pong"), ("payload", "hello")]),
        "unexpected reply {reply:?}"
    );

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 客户端的 `peer_address` 等于服务端的 `local_address`，反之亦然；
/// 服务端 Comm 携带监听器的 `contact_address`，客户端没有。
pub async fn assert_address_symmetry(harness: &Harness) -> anyhow::Result<()> {
    let handler = handler_fn(|comm: BoxComm| async move {
        comm.read().await?;
        let report = Value::from([
            ("local", Value::from(comm.local_address())),
            ("peer", Value::from(comm.peer_address())),
            (
                "contact",
                comm.contact_address().map(Value::from).unwrap_or_default(),
            ),
        ]);
        comm.write(&report).await?;
        comm.read().await.ok();
        Ok::<(), HandlerError>(())
    });
    let mut listener = harness.listen(handler).await?;
    let comm = harness.connect(&listener).await?;

    within("write", comm.write(&Value::from("who are you"))).await??;
    let report = within("read report", comm.read()).await??;
    let field = |key: &str| {
        report
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .with_context(|| format!("report lacks `{key}`: {report:?}"))
    };

    ensure!(
        comm.peer_address() == field("local")?,
        "client peer {} != server local {}",
        comm.peer_address(),
        field("local")?
    );
    ensure!(
        comm.local_address() == field("peer")?,
        "client local {} != server peer {}",
        comm.local_address(),
        field("peer")?
    );
    ensure!(
        field("contact")? == listener.contact_address(),
        "server comm contact {} != listener contact {}",
        field("contact")?,
        listener.contact_address()
    );
    ensure!(comm.contact_address().is_none(), "client comm has a contact address");
    ensure!(
        comm.local_address().starts_with(&format!("{}://", harness.scheme())),
        "local address {} lacks scheme",
        comm.local_address()
    );

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 嵌套的内联结构原样往返。
pub async fn assert_nested_round_trip(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;

    let nested = Value::from([
        ("op", Value::from("update-graph")),
        (
            "tasks",
            Value::List(vec![
                Value::from([("key", Value::from("x-1")), ("priority", Value::from(-3))]),
                Value::from([("key", Value::from("y-2")), ("deps", Value::List(vec![Value::from("x-1")]))]),
            ]),
        ),
        ("ratio", Value::from(0.25)),
        ("flag", Value::from(true)),
        ("none", Value::Null),
        ("raw", Value::Bytes(bytes::Bytes::from_static(b"\x00\x01inline"))),
        ("empty", Value::map()),
    ]);
    within("write", comm.write(&nested)).await??;
    let echoed = within("read", comm.read()).await??;
    ensure!(echoed == nested, "nested value changed: {echoed:?}");

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 消息只含头部（无负载）时同样可以往返。
pub async fn assert_pure_header_message(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;
    for message in [Value::Null, Value::map(), Value::from("x"), Value::List(Vec::new())] {
        within("write", comm.write(&message)).await??;
        let echoed = within("read", comm.read()).await??;
        ensure!(echoed == message, "expected {message:?}, got {echoed:?}");
    }
    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// `close` 幂等；关闭后读写返回 `CommClosed`。
pub async fn assert_close_idempotent(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm = harness.connect(&listener).await?;
    ensure!(!comm.closed(), "fresh comm reports closed");

    comm.close().await.context("first close")?;
    comm.close().await.context("second close")?;
    ensure!(comm.closed(), "comm not closed after close()");

    let err = match comm.write(&ping("late")).await {
        Ok(_) => bail!("write after close succeeded"),
        Err(err) => err,
    };
    ensure_kind(err.kind(), &[ErrorKind::CommClosed], "write after close")?;
    let err = match comm.read().await {
        Ok(message) => bail!("read after close returned {message:?}"),
        Err(err) => err,
    };
    ensure_kind(err.kind(), &[ErrorKind::CommClosed], "read after close")?;

    listener.stop().await;
    Ok(())
}

/// 关闭 Comm 使挂起中的读取立即以 `CommClosed` 返回。
pub async fn assert_close_unblocks_read(harness: &Harness) -> anyhow::Result<()> {
    let mut listener = harness.listen(echo_handler()).await?;
    let comm: Arc<dyn Comm> = Arc::from(harness.connect(&listener).await?);

    let reader = {
        let comm = Arc::clone(&comm);
        tokio::spawn(async move { comm.read().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    comm.close().await?;

    let err = match within("pending read", reader).await?? {
        Ok(message) => bail!("pending read returned {message:?}"),
        Err(err) => err,
    };
    ensure_kind(err.kind(), &[ErrorKind::CommClosed], "pending read after close")?;
    listener.stop().await;
    Ok(())
}

/// 对端干净关闭后读取返回 `StreamClosed`，本端随之进入关闭态。
pub async fn assert_peer_close_is_stream_closed(harness: &Harness) -> anyhow::Result<()> {
    let handler = handler_fn(|comm: BoxComm| async move {
        comm.close().await?;
        Ok::<(), HandlerError>(())
    });
    let mut listener = harness.listen(handler).await?;
    let comm = harness.connect(&listener).await?;

    let err = match within("read", comm.read()).await? {
        Ok(message) => bail!("read after peer close returned {message:?}"),
        Err(err) => err,
    };
    ensure_kind(err.kind(), &[ErrorKind::StreamClosed], "read after peer close")?;
    ensure!(comm.closed(), "comm still open after StreamClosed");

    listener.stop().await;
    Ok(())
}

/// 读超时返回 `Timeout` 并使 Comm 关闭，之后写入返回 `CommClosed`。
pub async fn assert_read_timeout_closes(harness: &Harness) -> anyhow::Result<()> {
    let handler = handler_fn(|comm: BoxComm| async move {
        comm.read().await.ok();
        Ok::<(), HandlerError>(())
    });
    let mut listener = harness.listen(handler).await?;
    let comm = harness.connect(&listener).await?;

    let ctx = CallContext::with_timeout(Duration::from_millis(50));
    let err = match within("read with timeout", comm.read_with(&ctx)).await? {
        Ok(message) => bail!("silent peer produced {message:?}"),
        Err(err) => err,
    };
    ensure_kind(err.kind(), &[ErrorKind::Timeout], "read with deadline")?;
    ensure!(comm.closed(), "comm still open after timeout");
    let err = match comm.write(&ping("late")).await {
        Ok(_) => bail!("write after timeout succeeded"),
        Err(err) => err,
    };
    ensure_kind(err.kind(), &[ErrorKind::CommClosed], "write after timeout")?;

    listener.stop().await;
    Ok(())
}

/// 足以填满双方内核缓冲的负载大小，对端不读时写入必然挂起。
const STALL_BULK: usize = 64 << 20;

fn large_bulk(len: usize) -> Value {
    Value::from([
        ("op", Value::from("put")),
        (
            "data",
            Value::Bulk(Bulk::new(Value::Null, vec![Buffer::Host(Bytes::from(vec![0u8; len]))])),
        ),
    ])
}

/// 不读取的对端：持有会话直到 `release` 被通知，随后一直读到出错，
/// 并经 `report` 报告结束时的错误类别。
fn stalled_handler(release: Arc<Notify>, report: mpsc::UnboundedSender<ErrorKind>) -> CommHandler {
    handler_fn(move |comm: BoxComm| {
        let release = Arc::clone(&release);
        let report = report.clone();
        async move {
            release.notified().await;
            let kind = loop {
                if let Err(err) = comm.read().await {
                    break err.kind();
                }
            };
            report.send(kind).ok();
            Ok::<(), HandlerError>(())
        }
    })
}

/// 进程内后端的写入只是移交缓冲，不等待对端读取。
fn writes_without_peer(comm: &dyn Comm) -> bool {
    comm.extra_info().transfer_mode == TransferMode::InMemory
}

/// 对端不读取时，带期限的大块写入返回 `Timeout` 并使 Comm 关闭，之后写入返回 `CommClosed`。
///
/// 写入不依赖对端读取的后端会立即完成，此时要求 Comm 保持打开。
pub async fn assert_write_timeout_closes(harness: &Harness) -> anyhow::Result<()> {
    let release = Arc::new(Notify::new());
    let (report, _reports) = mpsc::unbounded_channel();
    let mut listener = harness.listen(stalled_handler(Arc::clone(&release), report)).await?;
    let comm = harness.connect(&listener).await?;

    let ctx = CallContext::with_timeout(Duration::from_millis(200));
    match within("write with timeout", comm.write_with(&large_bulk(STALL_BULK), &ctx)).await? {
        Ok(_) => {
            ensure!(
                writes_without_peer(&*comm),
                "write of {STALL_BULK} bytes to a stalled peer completed"
            );
            ensure!(!comm.closed(), "completed write closed the comm");
        }
        Err(err) => {
            ensure_kind(err.kind(), &[ErrorKind::Timeout], "write with deadline")?;
            ensure!(comm.closed(), "comm still open after write timeout");
            let err = match comm.write(&ping("late")).await {
                Ok(_) => bail!("write after timeout succeeded"),
                Err(err) => err,
            };
            ensure_kind(err.kind(), &[ErrorKind::CommClosed], "write after write timeout")?;
        }
    }

    release.notify_one();
    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// 关闭 Comm 使挂起中的写入以 `CommClosed` 返回。
pub async fn assert_close_unblocks_write(harness: &Harness) -> anyhow::Result<()> {
    let release = Arc::new(Notify::new());
    let (report, _reports) = mpsc::unbounded_channel();
    let mut listener = harness.listen(stalled_handler(Arc::clone(&release), report)).await?;
    let comm: Arc<dyn Comm> = Arc::from(harness.connect(&listener).await?);

    let message = large_bulk(STALL_BULK);
    let writer = {
        let comm = Arc::clone(&comm);
        tokio::spawn(async move { comm.write(&message).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    within("close", comm.close()).await??;

    match within("pending write", writer).await?? {
        Ok(_) => ensure!(
            writes_without_peer(&*comm),
            "write of {STALL_BULK} bytes to a stalled peer completed"
        ),
        Err(err) => ensure_kind(err.kind(), &[ErrorKind::CommClosed], "pending write after close")?,
    }

    release.notify_one();
    listener.stop().await;
    Ok(())
}

/// `abort` 唤醒挂起的写入，写入方持有的流也随之释放：对端读到会话结束，而不是永远等待剩余字节。
pub async fn assert_abort_releases_pending_write(harness: &Harness) -> anyhow::Result<()> {
    let release = Arc::new(Notify::new());
    let (report, mut reports) = mpsc::unbounded_channel();
    let mut listener = harness.listen(stalled_handler(Arc::clone(&release), report)).await?;
    let comm: Arc<dyn Comm> = Arc::from(harness.connect(&listener).await?);

    let message = large_bulk(STALL_BULK);
    let writer = {
        let comm = Arc::clone(&comm);
        tokio::spawn(async move { comm.write(&message).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    comm.abort();
    ensure!(comm.closed(), "comm still open after abort");

    match within("pending write", writer).await?? {
        Ok(_) => ensure!(
            writes_without_peer(&*comm),
            "write of {STALL_BULK} bytes to a stalled peer completed"
        ),
        Err(err) => ensure_kind(err.kind(), &[ErrorKind::CommClosed], "pending write after abort")?,
    }

    release.notify_one();
    let kind = within("peer observes the end of the session", reports.recv())
        .await?
        .context("stalled handler exited without reporting")?;
    ensure_kind(
        kind,
        &[ErrorKind::StreamClosed, ErrorKind::ConnectionReset],
        "peer read after abort",
    )?;

    listener.stop().await;
    Ok(())
}

/// 单个 Comm 内保序；一个读者与一个写者可以并发工作。
pub async fn assert_ordering(harness: &Harness) -> anyhow::Result<()> {
    const COUNT: i64 = 200;
    let mut listener = harness.listen(echo_handler()).await?;
    let comm: Arc<dyn Comm> = Arc::from(harness.connect(&listener).await?);

    let writer = {
        let comm = Arc::clone(&comm);
        tokio::spawn(async move {
            for seq in 0..COUNT {
                comm.write(&Value::from([("seq", seq)])).await?;
            }
            Ok::<(), taskwire_core::error::CommError>(())
        })
    };
    for expected in 0..COUNT {
        let message = within("read in order", comm.read()).await??;
        let seq = message.get("seq").and_then(Value::as_int);
        ensure!(seq == Some(expected), "expected seq {expected}, got {seq:?}");
    }
    within("writer", writer).await???;

    comm.close().await?;
    listener.stop().await;
    Ok(())
}

/// K 个会话并发 ping/pong，负载互不混淆。
pub async fn assert_concurrent_sessions(harness: &Harness, sessions: usize) -> anyhow::Result<()> {
    let mut listener = harness.listen(pong_handler()).await?;
    let listener_ref = &listener;
    let clients = (0..sessions).map(|i| async move {
        let comm = harness.connect(listener_ref).await?;
        let payload = format!("client-{i}-{}", "x".repeat(i));
        for round in 0..3 {
            let body = Value::from([("who", Value::from(payload.clone())), ("round", Value::from(round))]);
            within("write", comm.write(&ping(body.clone()))).await??;
            let reply = within("read", comm.read()).await??;
            ensure!(
                reply.get("payload") == Some(&body),
                "session {i} round {round} received {reply:?}"
            );
        }
        comm.close().await?;
        anyhow::Ok(())
    });
    try_join_all(clients).await?;
    ensure!(
        listener.stats().accepted >= sessions as u64,
        "listener accepted {} of {sessions} sessions",
        listener.stats().accepted
    );
    listener.stop().await;
    Ok(())
}

/// 两端的 `extra_info` 报告相同的搬运方式。
pub async fn assert_extra_info(harness: &Harness, mode: TransferMode) -> anyhow::Result<()> {
    let handler = handler_fn(move |comm: BoxComm| async move {
        comm.read().await?;
        comm.write(&Value::from(comm.extra_info().transfer_mode.as_str()))
            .await?;
        comm.read().await.ok();
        Ok::<(), HandlerError>(())
    });
    let mut listener = harness.listen(handler).await?;
    let comm = harness.connect(&listener).await?;
    ensure!(
        comm.extra_info().transfer_mode == mode,
        "client reports {:?}",
        comm.extra_info()
    );
    within("write", comm.write(&Value::Null)).await??;
    let server_mode = within("read", comm.read()).await??;
    ensure!(
        server_mode.as_str() == Some(mode.as_str()),
        "server reports {server_mode:?}"
    );
    comm.close().await?;
    listener.stop().await;
    Ok(())
}
