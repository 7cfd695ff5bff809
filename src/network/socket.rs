use super::timer::TimerTable;
use super::{AddressFamily, Context};
use crate::config::Config;
use crate::error::{Error, Result, SocketError};
use crate::handler::{Event, Flow, Handler};
use bytes::BytesMut;
use socket2::{Protocol, SockAddr, Type};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle position of a [`Socket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Allocated, no OS handle yet
    Unconfigured,
    /// OS handle created, not connected
    Built,
    /// Connected (client) or accepted (server side)
    Connected,
    /// Bound and listening for connections
    Listening,
    /// A close or shutdown is in progress
    Closing,
    /// Cleaned up. Terminal.
    Closed,
}

/// One TCP endpoint driven by the reactor
///
/// Owns its OS handle, read and write buffers, timers and property table.
/// Every failure is reported to the handler and ends in exactly one
/// [`Event::End`].
pub struct Socket {
    pub(super) id: u64,
    pub(super) ctx: Rc<Context>,
    pub(super) handle: Option<socket2::Socket>,
    pub(super) state: SocketState,
    pub(super) addr: Option<SocketAddr>,
    pub(super) read_buf: BytesMut,
    pub(super) write_buf: BytesMut,
    pub(super) timers: TimerTable,
    /// Dropping the tail of an oversized message up to its delimiter
    pub(super) discarding: bool,
    properties: HashMap<String, usize>,
    user_data: Option<Rc<dyn Any>>,
    handler: Rc<dyn Handler>,
}

impl Socket {
    pub(super) fn setup(ctx: Rc<Context>, handler: Rc<dyn Handler>) -> Self {
        let id = ctx.allocate_id();
        Self {
            id,
            ctx,
            handle: None,
            state: SocketState::Unconfigured,
            addr: None,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            timers: TimerTable::new(),
            discarding: false,
            properties: HashMap::new(),
            user_data: None,
            handler,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// True while the socket holds a valid OS handle
    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.handle.as_ref().map(|h| h.as_raw_fd())
    }

    /// Peer address, or the bound address of a listening socket
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle
            .as_ref()
            .and_then(|h| h.local_addr().ok())
            .and_then(|addr| addr.as_socket())
    }

    /// Bytes received but not yet framed into a complete message
    pub fn buffered_read(&self) -> usize {
        self.read_buf.len()
    }

    /// Bytes waiting to be sent
    pub fn queued_write(&self) -> usize {
        self.write_buf.len()
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn handler(&self) -> &Rc<dyn Handler> {
        &self.handler
    }

    /// Dispatch `event` to this socket's handler
    pub(crate) fn emit(&mut self, event: Event<'_>) -> Flow {
        let handler = Rc::clone(&self.handler);
        handler.handle(self, event)
    }

    pub(crate) fn report(&mut self, kind: SocketError, cause: Option<&io::Error>) -> Flow {
        match cause {
            Some(err) => warn!("Socket {}: {}: {}", self.id, kind, err),
            None => warn!("Socket {}: {}", self.id, kind),
        }
        self.emit(Event::Error { kind, cause })
    }

    /// Report `err`, hard-close, and hand the error back for `?`
    pub(super) fn fail(&mut self, kind: SocketError, err: io::Error) -> Error {
        self.report(kind, Some(&err));
        self.close();
        Error::socket(kind, err)
    }

    /// Create the OS handle
    pub fn build(&mut self, family: AddressFamily) -> Result<()> {
        if self.state != SocketState::Unconfigured {
            return Err(Error::InvalidState("socket is already built"));
        }

        match socket2::Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP)) {
            Ok(handle) => {
                debug!("Socket {} built for {:?}", self.id, family);
                self.handle = Some(handle);
                self.state = SocketState::Built;
                Ok(())
            }
            Err(err) => {
                self.report(SocketError::FailedCreate, Some(&err));
                self.cleanup();
                Err(Error::socket(SocketError::FailedCreate, err))
            }
        }
    }

    /// Connect to `addr`, switch to non-blocking mode and fire `Start`
    ///
    /// A handler returning [`Flow::Abort`] from `Start` closes the socket
    /// immediately.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        if self.state != SocketState::Built {
            return Err(Error::InvalidState("connect requires a built socket"));
        }
        self.addr = Some(addr);

        let result = match self.handle.as_ref() {
            Some(handle) => {
                let target = SockAddr::from(addr);
                match self.ctx.config.connect_timeout() {
                    Some(timeout) => handle.connect_timeout(&target, timeout),
                    None => handle.connect(&target),
                }
                .and_then(|()| tune(&self.ctx.config, handle))
            }
            None => return Err(Error::InvalidState("socket has no handle")),
        };
        if let Err(err) = result {
            return Err(self.fail(SocketError::FailedStart, err));
        }

        self.state = SocketState::Connected;
        debug!("Socket {} connected to {}", self.id, addr);

        if self.emit(Event::Start { accepted: None }).is_abort() || !self.is_open() {
            debug!("Socket {} connect aborted by handler", self.id);
            self.close();
            return Err(Error::Aborted("connect"));
        }
        Ok(())
    }

    /// Bind to `addr` and start listening
    pub(super) fn listen(&mut self, addr: SocketAddr) -> Result<()> {
        if self.state != SocketState::Built {
            return Err(Error::InvalidState("listen requires a built socket"));
        }
        let config = &self.ctx.config;

        let bound = match self.handle.as_ref() {
            Some(handle) => {
                if config.reuse_address {
                    if let Err(e) = handle.set_reuse_address(true) {
                        debug!("Socket {}: SO_REUSEADDR not applied: {}", self.id, e);
                    }
                }
                handle.bind(&SockAddr::from(addr))
            }
            None => return Err(Error::InvalidState("socket has no handle")),
        };
        if let Err(err) = bound {
            return Err(self.fail(SocketError::FailedBind, err));
        }

        let listening = match self.handle.as_ref() {
            Some(handle) => handle
                .listen(self.ctx.config.listen_backlog)
                .and_then(|()| handle.set_nonblocking(true)),
            None => return Err(Error::InvalidState("socket has no handle")),
        };
        if let Err(err) = listening {
            return Err(self.fail(SocketError::FailedListen, err));
        }

        self.addr = self.local_addr().or(Some(addr));
        self.state = SocketState::Listening;
        Ok(())
    }

    /// Release buffers, timers and properties and fire `End`
    ///
    /// Idempotent: a cleaned socket is left untouched.
    pub fn cleanup(&mut self) {
        if self.state == SocketState::Closed {
            return;
        }
        self.state = SocketState::Closed;
        self.handle = None;
        self.read_buf = BytesMut::new();
        self.write_buf = BytesMut::new();
        self.timers.clear();
        self.discarding = false;
        self.properties = HashMap::new();

        debug!("Socket {} cleaned up", self.id);
        self.emit(Event::End);
    }

    /// Hard close: release the handle without flushing, then clean up
    ///
    /// Returns false if the socket was already closed or the OS reported an
    /// error while closing.
    pub fn close(&mut self) -> bool {
        if self.state == SocketState::Closed {
            return false;
        }
        if !self.begin_close() {
            return false;
        }

        let closed = self.release_handle();
        self.cleanup();
        closed
    }

    /// Graceful close
    ///
    /// Flushes the write buffer for a bounded number of attempts, half-closes
    /// the send direction, gives the peer a moment to observe it, then closes
    /// the handle and cleans up.
    pub fn shutdown(&mut self) -> bool {
        if self.state == SocketState::Closed {
            return false;
        }
        if !self.is_open() {
            self.cleanup();
            return false;
        }
        if !self.begin_close() {
            return false;
        }

        let attempts = self.ctx.config.shutdown_attempts;
        let retry = self.ctx.config.shutdown_retry();
        for attempt in 1..=attempts {
            match self.drain_write_buffer() {
                Ok(0) => break,
                Ok(queued) if attempt < attempts => {
                    debug!(
                        "Socket {} shutdown: {} bytes still queued (attempt {})",
                        self.id, queued, attempt
                    );
                    thread::sleep(retry);
                }
                Ok(queued) => {
                    warn!(
                        "Socket {} shutdown: dropping {} unsent bytes",
                        self.id, queued
                    );
                }
                Err(err) => {
                    // connection is gone, skip the half-close
                    self.report(SocketError::FailedWrite, Some(&err));
                    self.release_handle();
                    self.cleanup();
                    return false;
                }
            }
            if !self.is_open() {
                return false;
            }
        }
        if !self.is_open() {
            return false;
        }

        let half_close = match self.handle.as_ref() {
            Some(handle) => handle.shutdown(Shutdown::Write),
            None => return false,
        };
        if let Err(err) = half_close {
            self.report(SocketError::FailedClose, Some(&err));
            self.handle = None;
            self.cleanup();
            return false;
        }

        thread::sleep(self.ctx.config.shutdown_linger());

        let closed = self.release_handle();
        self.cleanup();
        closed
    }

    /// Move to `Closing` and fire `Close` once
    ///
    /// Returns false if the handler finished the close itself.
    fn begin_close(&mut self) -> bool {
        if self.state != SocketState::Closing {
            self.state = SocketState::Closing;
            self.emit(Event::Close);
        }
        self.state != SocketState::Closed
    }

    fn release_handle(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match nix::unistd::close(handle.into_raw_fd()) {
            Ok(()) => true,
            Err(errno) => {
                let err = io::Error::from(errno);
                self.report(SocketError::FailedClose, Some(&err));
                false
            }
        }
    }

    /// Encode `payload` as one frame and queue it for sending
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::InvalidState("socket is closed"));
        }
        self.ctx.config.framing.encode(payload, &mut self.write_buf)
    }

    /// Queue bytes for sending without framing them
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::InvalidState("socket is closed"));
        }
        self.write_buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Start or replace timer `id`
    pub fn set_timer(&mut self, id: u32, interval: Duration) {
        self.timers.set(id, interval, Instant::now());
    }

    /// Stop timer `id`. No-op if it is not set.
    pub fn kill_timer(&mut self, id: u32) -> bool {
        self.timers.kill(id)
    }

    pub fn has_timer(&self, id: u32) -> bool {
        self.timers.contains(id)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    pub fn set_property(&mut self, key: &str, value: usize) {
        self.properties.insert(key.to_owned(), value);
    }

    /// Value stored under `key`, or 0
    pub fn get_property(&self, key: &str) -> usize {
        self.properties.get(key).copied().unwrap_or(0)
    }

    pub fn remove_property(&mut self, key: &str) -> Option<usize> {
        self.properties.remove(key)
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Attach application data. The socket only holds a shared reference.
    pub fn set_user_data(&mut self, data: Rc<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&Rc<dyn Any>> {
        self.user_data.as_ref()
    }

    pub fn user_data_as<T: 'static>(&self) -> Option<&T> {
        self.user_data.as_deref().and_then(|data| data.downcast_ref::<T>())
    }
}

/// Apply performance options and switch the handle to non-blocking mode
///
/// Only the non-blocking switch is required to succeed.
pub(super) fn tune(config: &Config, handle: &socket2::Socket) -> io::Result<()> {
    if let Err(e) = handle.set_nodelay(config.tcp_nodelay) {
        debug!("TCP_NODELAY not applied: {}", e);
    }
    if config.reuse_address {
        if let Err(e) = handle.set_reuse_address(true) {
            debug!("SO_REUSEADDR not applied: {}", e);
        }
    }
    if let Some(linger) = config.linger() {
        if let Err(e) = handle.set_linger(Some(linger)) {
            debug!("SO_LINGER not applied: {}", e);
        }
    }
    handle.set_nonblocking(true)
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("fd", &self.raw_fd())
            .field("addr", &self.addr)
            .field("buffered_read", &self.read_buf.len())
            .field("queued_write", &self.write_buf.len())
            .field("timers", &self.timers.len())
            .field("properties", &self.properties.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{self, NoopHandler};
    use crate::network::Network;
    use std::cell::RefCell;

    fn recording(log: Rc<RefCell<Vec<&'static str>>>) -> Rc<dyn Handler> {
        Rc::new(handler::from_fn(move |_socket, event| {
            log.borrow_mut().push(event.name());
            Flow::Continue
        }))
    }

    #[test]
    fn setup_starts_unconfigured_and_empty() {
        let network = Network::new(Config::default()).unwrap();
        let socket = network.socket(Rc::new(NoopHandler));
        assert_eq!(socket.state(), SocketState::Unconfigured);
        assert!(!socket.is_open());
        assert_eq!(socket.raw_fd(), None);
        assert_eq!(socket.buffered_read(), 0);
        assert_eq!(socket.queued_write(), 0);
        assert_eq!(socket.timer_count(), 0);
    }

    #[test]
    fn properties_default_to_zero() {
        let network = Network::new(Config::default()).unwrap();
        let mut socket = network.socket(Rc::new(NoopHandler));

        assert_eq!(socket.get_property("missing"), 0);
        socket.set_property("score", 42);
        socket.set_property("score", 43);
        assert_eq!(socket.get_property("score"), 43);
        assert_eq!(socket.property_count(), 1);
        assert_eq!(socket.remove_property("score"), Some(43));
        assert_eq!(socket.get_property("score"), 0);
    }

    #[test]
    fn user_data_downcasts() {
        let network = Network::new(Config::default()).unwrap();
        let mut socket = network.socket(Rc::new(NoopHandler));
        let data: Rc<dyn Any> = Rc::new(String::from("session"));
        socket.set_user_data(Rc::clone(&data));

        assert_eq!(socket.user_data_as::<String>().map(String::as_str), Some("session"));
        assert!(socket.user_data_as::<u32>().is_none());
        assert_eq!(Rc::strong_count(&data), 2);
    }

    #[test]
    fn cleanup_fires_end_once() {
        let network = Network::new(Config::default()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut socket = network.socket(recording(Rc::clone(&log)));
        socket.set_property("k", 1);
        socket.set_timer(1, Duration::from_millis(5));

        socket.cleanup();
        socket.cleanup();
        assert!(!socket.close());
        assert!(!socket.shutdown());

        assert_eq!(*log.borrow(), vec!["end"]);
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(socket.raw_fd(), None);
        assert_eq!(socket.property_count(), 0);
        assert_eq!(socket.timer_count(), 0);
    }

    #[test]
    fn close_on_built_socket_fires_close_then_end() {
        let network = Network::new(Config::default()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut socket = network.socket(recording(Rc::clone(&log)));
        socket.build(AddressFamily::Ipv4).unwrap();
        assert!(socket.is_open());

        assert!(socket.close());
        assert!(!socket.is_open());
        assert_eq!(*log.borrow(), vec!["close", "end"]);
    }

    #[test]
    fn build_twice_is_rejected() {
        let network = Network::new(Config::default()).unwrap();
        let mut socket = network.socket(Rc::new(NoopHandler));
        socket.build(AddressFamily::Ipv4).unwrap();
        assert!(matches!(
            socket.build(AddressFamily::Ipv4),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn send_on_closed_socket_fails() {
        let network = Network::new(Config::default()).unwrap();
        let mut socket = network.socket(Rc::new(NoopHandler));
        assert!(matches!(socket.send(b"hi"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn close_from_close_handler_is_not_reentrant() {
        let network = Network::new(Config::default()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&log);
        let handler: Rc<dyn Handler> = Rc::new(handler::from_fn(move |socket, event| {
            seen.borrow_mut().push(event.name());
            if matches!(event, Event::Close) {
                socket.close();
            }
            Flow::Continue
        }));
        let mut socket = network.socket(handler);
        socket.build(AddressFamily::Ipv4).unwrap();

        socket.close();
        assert_eq!(*log.borrow(), vec!["close", "end"]);
    }
}
