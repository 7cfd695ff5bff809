//! Poll-driven socket reactor
//!
//! A [`Network`] value owns the configuration every socket is created
//! with; there is no process-wide state. Sockets are driven one tick at a
//! time by [`Socket::update`] (single connection) or [`ServerSocket::update`]
//! (listener plus every accepted client), which never block beyond the
//! configured poll timeout.

mod reactor;
mod server;
mod socket;
mod timer;

pub use server::{PollDescriptor, ServerSocket};
pub use socket::{Socket, SocketState};
pub use timer::TimerTable;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::Handler;
use std::cell::Cell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;

/// Address family a socket handle is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub(crate) fn domain(self) -> socket2::Domain {
        match self {
            AddressFamily::Ipv4 => socket2::Domain::IPV4,
            AddressFamily::Ipv6 => socket2::Domain::IPV6,
        }
    }
}

/// State shared by every socket created from one [`Network`]
pub(crate) struct Context {
    pub(crate) config: Config,
    next_id: Cell<u64>,
}

impl Context {
    fn allocate_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }
}

/// Handle to an initialized networking subsystem
///
/// Cheap to clone. Every socket keeps the subsystem alive for as long as it
/// exists, so independent `Network` values never share state.
#[derive(Clone)]
pub struct Network {
    ctx: Rc<Context>,
}

impl Network {
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            ctx: Rc::new(Context {
                config,
                next_id: Cell::new(1),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Allocate an unconfigured socket dispatching to `handler`
    pub fn socket(&self, handler: Rc<dyn Handler>) -> Socket {
        Socket::setup(Rc::clone(&self.ctx), handler)
    }

    /// Create, build and connect a client socket in one step
    pub fn connect(&self, addr: SocketAddr, handler: Rc<dyn Handler>) -> Result<Socket> {
        let mut socket = self.socket(handler);
        socket.build(AddressFamily::of(&addr))?;
        socket.connect(addr)?;
        Ok(socket)
    }

    /// Resolve `host` and connect to the first address it yields
    pub fn connect_host(&self, host: &str, port: u16, handler: Rc<dyn Handler>) -> Result<Socket> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {}:{}", host, port),
            )
        })?;
        self.connect(addr, handler)
    }

    /// Bind a listening socket; accepted clients dispatch to `heir`
    pub fn listen(
        &self,
        addr: SocketAddr,
        handler: Rc<dyn Handler>,
        heir: Rc<dyn Handler>,
    ) -> Result<ServerSocket> {
        ServerSocket::listen(self, addr, handler, heir)
    }
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("config", &self.ctx.config)
            .field("next_id", &self.ctx.next_id.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopHandler;

    #[test]
    fn invalid_config_is_rejected() {
        let config = Config {
            max_message_size: 0,
            ..Default::default()
        };
        assert!(matches!(Network::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn socket_ids_are_unique_per_network() {
        let network = Network::new(Config::default()).unwrap();
        let a = network.socket(Rc::new(NoopHandler));
        let b = network.socket(Rc::new(NoopHandler));
        assert_ne!(a.id(), b.id());

        let other = Network::new(Config::default()).unwrap();
        assert_eq!(other.socket(Rc::new(NoopHandler)).id(), a.id());
    }

    #[test]
    fn address_family_follows_address() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(AddressFamily::of(&v4), AddressFamily::Ipv4);
        assert_eq!(AddressFamily::of(&v6), AddressFamily::Ipv6);
    }
}
