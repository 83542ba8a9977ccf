//! 进程级 Fabric 上下文的生命周期。
//!
//! 上下文是进程全局状态，本文件独占一个测试二进制且只含一个用例，避免与其它用例共享。

use std::sync::Arc;
use std::time::Duration;

use taskwire_core::message::Value;
use taskwire_tck::{Harness, echo_handler, within};
use taskwire_transport_fabric::{FabricBackend, FabricContext};

async fn wait_for_teardown() -> bool {
    for _ in 0..250 {
        if FabricContext::current().is_none() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// 首次绑定创建上下文，会话与监听器全部释放后上下文销毁，再次使用时重新创建。
#[tokio::test(flavor = "multi_thread")]
async fn context_follows_last_reference() {
    assert!(FabricContext::current().is_none(), "context exists before first use");

    let harness = Harness::new(Arc::new(FabricBackend::new()), "127.0.0.1:0")
        .with_listen_options(|options| options.with_option("create_device_context", true));
    let mut listener = harness.listen(echo_handler()).await.expect("bind");
    {
        let context = FabricContext::current().expect("bind creates the context");
        assert!(context.has_device_context());
    }

    let comm = harness.connect(&listener).await.expect("connect");
    let message = Value::from([("op", "hello")]);
    within("write", comm.write(&message))
        .await
        .expect("step")
        .expect("write");
    let echoed = within("read", comm.read())
        .await
        .expect("step")
        .expect("read");
    assert_eq!(echoed, message);
    assert_eq!(
        FabricContext::current().expect("live").registered(),
        0,
        "registrations outlived the message"
    );

    comm.close().await.expect("close");
    assert!(
        FabricContext::current().is_some(),
        "listener still references the context"
    );
    listener.stop().await;
    drop(comm);
    assert!(wait_for_teardown().await, "context survived its last session");

    let plain = Harness::new(Arc::new(FabricBackend::new()), "127.0.0.1:0");
    let mut listener = plain.listen(echo_handler()).await.expect("rebind");
    let context = FabricContext::current().expect("recreated");
    assert!(!context.has_device_context(), "recreated context carries stale state");
    drop(context);
    listener.stop().await;
    assert!(wait_for_teardown().await);
}
