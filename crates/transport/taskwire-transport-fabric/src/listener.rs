use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use taskwire_core::comm::BoxComm;
use taskwire_core::error::Result;
use taskwire_core::listener::{Acceptor, CommHandler, Establish, Listener};
use taskwire_core::options::ListenOptions;
use tokio::net::{TcpListener, TcpStream};

use crate::SCHEME;
use crate::channel::{FabricComm, SessionSetup};
use crate::config::FabricOptions;
use crate::context::FabricContext;
use crate::error::{self, map_io_error};
use crate::handshake::Role;
use crate::util::{bind_target, contact_address, format_address};

/// 已绑定的 Fabric 接受端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 带外通道只承载握手与操作流，接受循环与失败隔离同样交给核心层的 [`Listener`]；
///
/// ## 契约（What）
/// - 绑定期间持有进程级 [`FabricContext`] 的引用，监听器停止后释放；
/// - 握手在会话任务中进行，握手失败作为 `EstablishFailed` 事件上报，不影响其它连接。
pub struct FabricAcceptor {
    inner: TcpListener,
    listen: String,
    contact: String,
    setup: SessionSetup,
    context: Arc<FabricContext>,
}

impl FabricAcceptor {
    pub async fn bind(location: &str, options: &ListenOptions) -> Result<Self> {
        let fabric = FabricOptions::from_backend(options.backend())?;
        let (host, port) = bind_target(location)?;
        let inner = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local = inner
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let contact = contact_address(local, fabric.contact_host.as_deref());
        let context = FabricContext::acquire();
        if fabric.create_device_context {
            context.ensure_device_context();
        }
        Ok(Self {
            inner,
            listen: format_address(local),
            setup: SessionSetup {
                options: fabric,
                device: options.device().cloned(),
                limits: options.limits(),
                contact: Some(contact.clone()),
            },
            contact,
            context,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))
    }
}

/// 等待握手的入站连接。
pub struct FabricIncoming {
    stream: TcpStream,
    peer: SocketAddr,
    setup: SessionSetup,
    context: Arc<FabricContext>,
}

#[async_trait]
impl Acceptor for FabricAcceptor {
    type Incoming = FabricIncoming;

    async fn accept(&self) -> Result<FabricIncoming> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        Ok(FabricIncoming {
            stream,
            peer,
            setup: self.setup.clone(),
            context: Arc::clone(&self.context),
        })
    }

    fn listen_address(&self) -> &str {
        &self.listen
    }

    fn contact_address(&self) -> &str {
        &self.contact
    }
}

#[async_trait]
impl Establish for FabricIncoming {
    fn peer_hint(&self) -> String {
        format_address(self.peer)
    }

    async fn establish(self) -> Result<BoxComm> {
        let comm = FabricComm::establish(self.stream, Role::Responder, self.context, self.setup).await?;
        Ok(Box::new(comm))
    }
}

/// 绑定并启动监听器。
pub async fn listen(location: &str, handler: CommHandler, options: &ListenOptions) -> Result<Listener> {
    let acceptor = FabricAcceptor::bind(location, options).await?;
    Ok(Listener::spawn(SCHEME, acceptor, handler))
}
