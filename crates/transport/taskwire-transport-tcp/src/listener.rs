use std::net::SocketAddr;

use async_trait::async_trait;
use taskwire_core::comm::BoxComm;
use taskwire_core::error::Result;
use taskwire_core::listener::{Acceptor, CommHandler, Establish, Listener};
use taskwire_core::options::ListenOptions;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

use crate::SCHEME;
use crate::channel::{SessionParams, TcpComm};
use crate::config::{TcpOptions, TcpSocketConfig};
use crate::error::{self, map_io_error};
use crate::util::{bind_target, contact_address, format_address};

/// 已绑定的 TCP 接受端。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 只负责“绑定 + 接受”，接受循环、会话任务与失败隔离交给核心层的 [`Listener`]；
///
/// ## 契约（What）
/// - `bind` 成功后端口 0 已解析，`listen_address` 为实际绑定地址；
/// - `contact_address` 把通配主机替换为 `contact_host` 或回环地址；
/// - 接受到的连接在会话任务中完成套接字配置，配置失败只影响该会话。
pub struct TcpAcceptor {
    inner: TokioTcpListener,
    listen: String,
    contact: String,
    socket: TcpSocketConfig,
    params: SessionParams,
}

impl TcpAcceptor {
    /// 绑定位置段。
    pub async fn bind(location: &str, options: &ListenOptions) -> Result<Self> {
        let tcp: TcpOptions = options.backend().parse(SCHEME)?;
        let (host, port) = bind_target(location)?;
        let inner = TokioTcpListener::bind((host.as_str(), port))
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local = inner
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let contact = contact_address(local, tcp.contact_host.as_deref());
        Ok(Self {
            inner,
            listen: format_address(local),
            params: SessionParams {
                device: options.device().cloned(),
                limits: options.limits(),
                contact: Some(contact.clone()),
            },
            contact,
            socket: tcp.socket_config(),
        })
    }

    /// 实际绑定的套接字地址。
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))
    }
}

/// 尚未配置的入站连接。
pub struct TcpIncoming {
    stream: TcpStream,
    peer: SocketAddr,
    socket: TcpSocketConfig,
    params: SessionParams,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Incoming = TcpIncoming;

    async fn accept(&self) -> Result<TcpIncoming> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        Ok(TcpIncoming {
            stream,
            peer,
            socket: self.socket.clone(),
            params: self.params.clone(),
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
impl Establish for TcpIncoming {
    fn peer_hint(&self) -> String {
        format_address(self.peer)
    }

    async fn establish(self) -> Result<BoxComm> {
        let comm = TcpComm::from_stream(self.stream, &self.socket, self.params)?;
        Ok(Box::new(comm))
    }
}

/// 绑定并启动监听器。
pub async fn listen(location: &str, handler: CommHandler, options: &ListenOptions) -> Result<Listener> {
    let acceptor = TcpAcceptor::bind(location, options).await?;
    Ok(Listener::spawn(SCHEME, acceptor, handler))
}
