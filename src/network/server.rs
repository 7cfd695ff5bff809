use super::reactor::CONNECTION_INTEREST;
use super::socket::{self, Socket, SocketState};
use super::{AddressFamily, Network};
use crate::error::{Error, Result, SocketError};
use crate::handler::{Event, Handler};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, RawFd};
use std::rc::Rc;
use tracing::{debug, info};

/// Poll registration of one accepted client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDescriptor {
    handle: RawFd,
    events: PollFlags,
    revents: PollFlags,
}

impl PollDescriptor {
    fn new(handle: RawFd) -> Self {
        Self {
            handle,
            events: CONNECTION_INTEREST,
            revents: PollFlags::empty(),
        }
    }

    /// The handle this descriptor polls
    pub fn handle(&self) -> RawFd {
        self.handle
    }

    pub fn events(&self) -> PollFlags {
        self.events
    }

    /// Readiness reported by the most recent poll
    pub fn revents(&self) -> PollFlags {
        self.revents
    }
}

/// A client and its descriptor, stored together so they cannot drift apart
struct Client {
    socket: Socket,
    descriptor: PollDescriptor,
}

/// Listening socket plus the registry of clients it accepted
pub struct ServerSocket {
    listener: Socket,
    clients: Vec<Client>,
    heir: Rc<dyn Handler>,
}

impl ServerSocket {
    /// Bind `addr` and start listening
    ///
    /// `handler` receives the listener's own events; `heir` is attached to
    /// every accepted client.
    pub fn listen(
        network: &Network,
        addr: SocketAddr,
        handler: Rc<dyn Handler>,
        heir: Rc<dyn Handler>,
    ) -> Result<Self> {
        let mut listener = network.socket(handler);
        listener.build(AddressFamily::of(&addr))?;
        listener.listen(addr)?;

        info!(
            "Socket {} listening on {}",
            listener.id(),
            listener.peer_addr().unwrap_or(addr)
        );

        Ok(Self {
            listener,
            clients: Vec::new(),
            heir,
        })
    }

    pub fn listener(&self) -> &Socket {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut Socket {
        &mut self.listener
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_open()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registered clients with their poll descriptors, in accept order
    pub fn clients(&self) -> impl Iterator<Item = (&Socket, &PollDescriptor)> {
        self.clients.iter().map(|c| (&c.socket, &c.descriptor))
    }

    pub fn client_mut(&mut self, index: usize) -> Option<&mut Socket> {
        self.clients.get_mut(index).map(|c| &mut c.socket)
    }

    /// Queue `payload` as one frame on every open client
    ///
    /// Returns the number of clients it was queued on.
    pub fn broadcast(&mut self, payload: &[u8]) -> Result<usize> {
        let mut queued = 0;
        for client in self.clients.iter_mut().filter(|c| c.socket.is_open()) {
            client.socket.send(payload)?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Accept one pending connection
    ///
    /// Returns `Ok(false)` when no connection is waiting. The listener's
    /// handler sees `Start` with the new client first, then the client sees
    /// `Create` and `Start`. An `Abort` from any of them shuts the client
    /// down and yields [`Error::Aborted`].
    pub fn accept(&mut self) -> Result<bool> {
        let accepted = match self.listener.handle.as_ref() {
            Some(handle) => handle.accept(),
            None => return Err(Error::InvalidState("listener is closed")),
        };
        let (handle, peer) = match accepted {
            Ok(pair) => pair,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(false)
            }
            Err(err) => {
                self.listener.report(SocketError::FailedStart, Some(&err));
                return Err(Error::socket(SocketError::FailedStart, err));
            }
        };

        let mut client = Socket::setup(Rc::clone(&self.listener.ctx), Rc::clone(&self.heir));
        client.addr = peer.as_socket();
        let tuned = socket::tune(&client.ctx.config, &handle);
        client.handle = Some(handle);
        if let Err(err) = tuned {
            return Err(client.fail(SocketError::FailedStart, err));
        }
        client.state = SocketState::Connected;

        debug!(
            "Socket {} accepted client {} from {:?}",
            self.listener.id(),
            client.id(),
            client.peer_addr()
        );

        let aborted = self
            .listener
            .emit(Event::Start {
                accepted: Some(&mut client),
            })
            .is_abort()
            || !client.is_open()
            || client.emit(Event::Create).is_abort()
            || !client.is_open()
            || client.emit(Event::Start { accepted: None }).is_abort()
            || !client.is_open();
        if aborted {
            debug!("Client {} rejected during accept", client.id());
            client.shutdown();
            return Err(Error::Aborted("accept"));
        }

        let Some(fd) = client.raw_fd() else {
            return Err(Error::InvalidState("accepted client has no handle"));
        };
        self.clients.push(Client {
            socket: client,
            descriptor: PollDescriptor::new(fd),
        });
        Ok(true)
    }

    /// Run one reactor tick: accept, then service every client
    ///
    /// Returns false once the listener is closed; every client is closed
    /// along with it.
    pub fn update(&mut self) -> bool {
        if !self.listener.is_open() {
            self.cleanup();
            return false;
        }

        self.update_listener();
        self.update_clients();

        if !self.listener.is_open() {
            self.cleanup();
            return false;
        }
        true
    }

    fn update_listener(&mut self) {
        // Only wait here when there are no clients to wait on instead.
        let timeout = if self.clients.is_empty() {
            PollTimeout::from(self.listener.ctx.config.poll_timeout_ms)
        } else {
            PollTimeout::ZERO
        };

        let (polled, revents) = match self.listener.handle.as_ref() {
            Some(handle) => {
                let mut fds = [PollFd::new(handle.as_fd(), PollFlags::POLLIN)];
                let polled = poll(&mut fds, timeout);
                (polled, fds[0].revents().unwrap_or(PollFlags::empty()))
            }
            None => return,
        };

        match polled {
            Ok(0) | Err(Errno::EINTR) => {}
            Ok(_) if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) => {
                let cause = self
                    .listener
                    .handle
                    .as_ref()
                    .and_then(|handle| handle.take_error().ok().flatten());
                self.listener.report(SocketError::FailedPoll, cause.as_ref());
                self.listener.close();
            }
            Ok(_) => self.accept_pending(),
            Err(errno) => {
                let err = io::Error::from(errno);
                self.listener.report(SocketError::FailedPoll, Some(&err));
                self.listener.close();
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.accept() {
                Ok(true) | Err(Error::Aborted(_)) => continue,
                Ok(false) => break,
                Err(e) => {
                    debug!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn update_clients(&mut self) {
        self.prune();
        if self.clients.is_empty() {
            return;
        }

        let timeout = PollTimeout::from(self.listener.ctx.config.poll_timeout_ms);
        let polled = {
            let mut fds: Vec<PollFd<'_>> = self
                .clients
                .iter()
                .filter_map(|c| {
                    c.socket
                        .handle
                        .as_ref()
                        .map(|handle| PollFd::new(handle.as_fd(), c.descriptor.events))
                })
                .collect();
            poll(&mut fds, timeout).map(|_| {
                fds.iter()
                    .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                    .collect::<Vec<_>>()
            })
        };

        let ready = match polled {
            Ok(ready) => ready,
            Err(Errno::EINTR) => return,
            Err(errno) => {
                let err = io::Error::from(errno);
                self.listener.report(SocketError::FailedPoll, Some(&err));
                return;
            }
        };
        for (client, revents) in self.clients.iter_mut().zip(ready) {
            client.descriptor.revents = revents;
        }

        // Reverse order keeps the indices of unvisited clients valid.
        for index in (0..self.clients.len()).rev() {
            let revents = self.clients[index].descriptor.revents;
            if revents.is_empty() {
                continue;
            }
            if !self.clients[index].socket.service(revents) {
                let client = self.clients.remove(index);
                debug!("Client {} removed from registry", client.socket.id());
            }
        }

        self.prune();
    }

    /// Drop clients that were closed outside of their own service step
    fn prune(&mut self) {
        self.clients.retain(|c| c.socket.is_open());
    }

    /// Close the listener and every client
    pub fn cleanup(&mut self) {
        if self.listener.state() != SocketState::Closed {
            info!("Socket {} stopped listening", self.listener.id());
            self.listener.close();
        }
        while let Some(mut client) = self.clients.pop() {
            client.socket.close();
        }
    }
}

impl std::fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSocket")
            .field("listener", &self.listener)
            .field("clients", &self.clients.len())
            .finish()
    }
}
