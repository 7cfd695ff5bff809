use crate::error::SocketError;
use crate::network::Socket;
use std::fmt;
use std::io;
use std::time::Duration;

/// Lifecycle notification delivered to a socket's [`Handler`]
#[derive(Debug)]
pub enum Event<'a> {
    /// A client socket was allocated by an accepting server
    Create,

    /// The connection is established.
    ///
    /// On a listening socket this fires once per accepted client, before the
    /// client's own `Create` and `Start`, with `accepted` set to the client.
    Start { accepted: Option<&'a mut Socket> },

    /// One complete inbound message, framing removed
    Data(&'a [u8]),

    /// An operation failed. `cause` carries the OS error when there is one.
    Error {
        kind: SocketError,
        cause: Option<&'a io::Error>,
    },

    /// A close or graceful shutdown has begun
    Close,

    /// Terminal event: the socket has been cleaned up
    End,

    /// A timer registered with [`Socket::set_timer`] is due
    Timer { id: u32, interval: Duration },

    /// The socket is about to flush its write buffer
    Write,
}

impl Event<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Create => "create",
            Event::Start { .. } => "start",
            Event::Data(_) => "data",
            Event::Error { .. } => "error",
            Event::Close => "close",
            Event::End => "end",
            Event::Timer { .. } => "timer",
            Event::Write => "write",
        }
    }
}

/// Handler verdict
///
/// `Abort` from `Create`/`Start` cancels connection setup and from a
/// `BufferOverflow` error forces a shutdown. It is ignored everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    Abort,
}

impl Flow {
    pub fn is_abort(self) -> bool {
        self == Flow::Abort
    }
}

/// Receives every event of the sockets it is attached to
///
/// Handlers run synchronously inside the reactor tick. They may call any
/// socket method, including [`Socket::close`] and [`Socket::shutdown`] on the
/// socket they were handed; the reactor checks the socket state after every
/// dispatch.
pub trait Handler {
    fn handle(&self, socket: &mut Socket, event: Event<'_>) -> Flow;
}

/// Handler backed by a closure, see [`from_fn`]
pub struct FnHandler<F>(F);

/// Build a [`Handler`] from a closure
///
/// ```
/// use std::rc::Rc;
/// use tickwire::{handler, Event, Flow, Handler};
///
/// let echo: Rc<dyn Handler> = Rc::new(handler::from_fn(|socket, event| {
///     if let Event::Data(message) = event {
///         let _ = socket.send(message);
///     }
///     Flow::Continue
/// }));
/// ```
pub fn from_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Socket, Event<'_>) -> Flow,
{
    FnHandler(f)
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Socket, Event<'_>) -> Flow,
{
    fn handle(&self, socket: &mut Socket, event: Event<'_>) -> Flow {
        (self.0)(socket, event)
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnHandler")
    }
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl Handler for NoopHandler {
    fn handle(&self, _socket: &mut Socket, _event: Event<'_>) -> Flow {
        Flow::Continue
    }
}
