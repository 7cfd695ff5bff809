//! tickwire: single-threaded, poll-driven TCP reactor
//!
//! Manages one or many non-blocking TCP connections, frames the byte
//! stream into discrete messages, buffers partial writes and reports
//! every lifecycle step to a [`Handler`].
//!
//! # Architecture
//!
//! - One tick per call: [`Socket::update`] or [`ServerSocket::update`] polls
//!   readiness with a bounded timeout and never blocks beyond it
//! - NUL-delimited framing by default, length-prefixed framing for binary payloads
//! - Per-socket timers piggy-backed on write readiness
//! - Failures surface only as [`Event::Error`] and end in one [`Event::End`]
//!
//! ```no_run
//! use std::rc::Rc;
//! use tickwire::{handler, Config, Event, Flow, Network};
//!
//! # fn main() -> tickwire::Result<()> {
//! let network = Network::new(Config::default())?;
//! let echo = Rc::new(handler::from_fn(|socket, event| {
//!     if let Event::Data(message) = event {
//!         let _ = socket.send(message);
//!     }
//!     Flow::Continue
//! }));
//! let mut server = network.listen(
//!     "127.0.0.1:7000".parse().unwrap(),
//!     Rc::new(handler::NoopHandler),
//!     echo,
//! )?;
//! while server.update() {}
//! # Ok(())
//! # }
//! ```

/// Configuration management for the reactor
pub mod config;

/// Error types and result aliases
pub mod error;

/// Events, handler trait and closure adapters
pub mod handler;

/// Sockets, server sockets and the per-tick reactor
pub mod network;

/// Message framing
pub mod protocol;

pub use config::Config;
pub use error::{Error, Result, SocketError};
pub use handler::{Event, Flow, Handler};
pub use network::{AddressFamily, Network, PollDescriptor, ServerSocket, Socket, SocketState};
pub use protocol::Framing;
