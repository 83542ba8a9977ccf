//! 进程内地址表：地址 → 监听器的入站队列。

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use taskwire_core::address::unparse_address;
use taskwire_core::error::{CommError, ErrorKind, Result};
use tokio::sync::mpsc;

use crate::SCHEME;
use crate::channel::InprocComm;

pub(crate) const CODE_NO_LISTENER: &str = "taskwire.transport.inproc.no_listener";
pub(crate) const CODE_ADDRESS_IN_USE: &str = "taskwire.transport.inproc.address_in_use";

static ROUTES: LazyLock<DashMap<String, mpsc::UnboundedSender<InprocComm>>> =
    LazyLock::new(DashMap::new);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 生成本进程内唯一的位置段 `<pid>/<n>`。
pub(crate) fn fresh_location() -> String {
    format!(
        "{}/{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    )
}

pub(crate) fn format_address(location: &str) -> String {
    unparse_address(SCHEME, location)
}

/// 地址表中的一条绑定；析构时解除。
#[derive(Debug)]
pub(crate) struct Route {
    address: String,
}

impl Route {
    /// 绑定位置段，空位置自动分配。返回绑定与入站队列。
    pub fn bind(location: &str) -> Result<(Self, mpsc::UnboundedReceiver<InprocComm>)> {
        let location = if location.is_empty() {
            fresh_location()
        } else {
            location.to_owned()
        };
        if location.chars().any(char::is_whitespace) {
            return Err(CommError::malformed_address(
                &format_address(&location),
                "in-process locations cannot contain whitespace",
            ));
        }
        let address = format_address(&location);
        let (tx, rx) = mpsc::unbounded_channel();
        match ROUTES.entry(address.clone()) {
            Entry::Occupied(_) => Err(CommError::new(
                ErrorKind::ConnectionRefused,
                CODE_ADDRESS_IN_USE,
                format!("{address} is already bound"),
            )),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok((Self { address }, rx))
            }
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for Route {
    fn drop(&mut self) {
        ROUTES.remove(&self.address);
    }
}

/// 把服务端一侧的 Comm 投递给监听器。
pub(crate) fn deliver(address: &str, server_side: InprocComm) -> Result<()> {
    let refused = || {
        CommError::new(
            ErrorKind::ConnectionRefused,
            CODE_NO_LISTENER,
            format!("no in-process listener at {address}"),
        )
    };
    let sender = ROUTES.get(address).map(|entry| entry.value().clone()).ok_or_else(refused)?;
    sender.send(server_side).map_err(|_| refused())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_exclusive_and_released_on_drop() {
        let location = fresh_location();
        let (route, _rx) = Route::bind(&location).expect("bind");
        assert_eq!(route.address(), format!("inproc://{location}"));
        let err = Route::bind(&location).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
        drop(route);
        Route::bind(&location).expect("rebind after drop");
    }

    #[test]
    fn empty_location_is_generated() {
        let (a, _ra) = Route::bind("").expect("a");
        let (b, _rb) = Route::bind("").expect("b");
        assert_ne!(a.address(), b.address());
        assert!(a.address().starts_with(&format!("inproc://{}/", std::process::id())));
    }

    #[test]
    fn whitespace_is_malformed() {
        let err = Route::bind("my worker").expect_err("whitespace");
        assert_eq!(err.kind(), ErrorKind::MalformedAddress);
    }
}
