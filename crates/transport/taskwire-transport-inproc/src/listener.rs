use async_trait::async_trait;
use taskwire_core::comm::{BoxComm, Comm};
use taskwire_core::error::{CommError, Result};
use taskwire_core::listener::{Acceptor, CommHandler, Establish, Listener};
use taskwire_core::options::ListenOptions;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;

use crate::SCHEME;
use crate::channel::InprocComm;
use crate::config::InprocOptions;
use crate::routes::Route;

/// 地址表中的一条绑定及其入站队列。
///
/// 接受端被丢弃时绑定随之解除，之后的连接返回 `ConnectionRefused`。
pub struct InprocAcceptor {
    route: Route,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<InprocComm>>,
}

impl InprocAcceptor {
    pub fn bind(location: &str, options: &ListenOptions) -> Result<Self> {
        options.backend().parse::<InprocOptions>(SCHEME)?;
        let (route, incoming) = Route::bind(location)?;
        Ok(Self {
            route,
            incoming: AsyncMutex::new(incoming),
        })
    }
}

/// 已经配对完成的服务端 Comm。
pub struct InprocIncoming(InprocComm);

#[async_trait]
impl Acceptor for InprocAcceptor {
    type Incoming = InprocIncoming;

    async fn accept(&self) -> Result<InprocIncoming> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .map(InprocIncoming)
            .ok_or_else(|| CommError::comm_closed("inproc accept"))
    }

    fn listen_address(&self) -> &str {
        self.route.address()
    }

    fn contact_address(&self) -> &str {
        self.route.address()
    }
}

#[async_trait]
impl Establish for InprocIncoming {
    fn peer_hint(&self) -> String {
        self.0.peer_address().to_owned()
    }

    async fn establish(self) -> Result<BoxComm> {
        Ok(Box::new(self.0))
    }
}

/// 绑定并启动监听器；空位置段自动分配 `<pid>/<n>`。
pub async fn listen(location: &str, handler: CommHandler, options: &ListenOptions) -> Result<Listener> {
    let acceptor = InprocAcceptor::bind(location, options)?;
    tracing::debug!(address = acceptor.route.address(), "inproc route bound");
    Ok(Listener::spawn(SCHEME, acceptor, handler))
}
