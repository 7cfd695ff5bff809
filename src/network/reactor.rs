use super::socket::{Socket, SocketState};
use crate::error::SocketError;
use crate::handler::Event;
use crate::protocol::Framing;
use bytes::Buf;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::time::Instant;
use tracing::{debug, trace};

/// Bytes pulled from the OS per `recv`
pub const READ_CHUNK_SIZE: usize = 8192;

/// Interest registered for every connected socket
pub(super) const CONNECTION_INTEREST: PollFlags = PollFlags::POLLIN.union(PollFlags::POLLOUT);

impl Socket {
    /// Pull available bytes and dispatch every complete message
    ///
    /// Returns false when the socket failed or was closed while reading.
    /// Incomplete messages stay buffered for the next call.
    pub fn read(&mut self) -> bool {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let received = match self.handle.as_ref() {
                Some(handle) => {
                    let mut stream: &socket2::Socket = handle;
                    stream.read(&mut chunk)
                }
                None => return false,
            };

            let n = match received {
                Ok(0) => {
                    debug!("Socket {}: peer closed the connection", self.id);
                    self.shutdown();
                    return false;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.report(SocketError::FailedRead, Some(&e));
                    return false;
                }
            };

            trace!("Socket {}: received {} bytes", self.id, n);
            self.read_buf.extend_from_slice(&chunk[..n]);
            if self.discarding {
                self.skip_discarded();
            }

            if !self.drain_messages() {
                return false;
            }
            if !self.check_backpressure() {
                return false;
            }

            if n < READ_CHUNK_SIZE {
                return true;
            }
        }
    }

    /// Dispatch `Data` for every complete frame at the front of the read buffer
    fn drain_messages(&mut self) -> bool {
        let framing = self.ctx.config.framing;

        while let Some(frame) = framing.next_frame(&self.read_buf) {
            let mut message = self.read_buf.split_to(frame.consumed);
            message.advance(frame.offset);
            message.truncate(frame.len);

            if message.is_empty() {
                continue;
            }
            let message = message.freeze();
            self.emit(Event::Data(&message));

            if !self.is_open() {
                return false;
            }
        }
        true
    }

    /// Drop the rest of an oversized message, up to and including its NUL
    fn skip_discarded(&mut self) {
        match memchr::memchr(0, &self.read_buf) {
            Some(end) => {
                trace!("Socket {}: dropped {} trailing bytes", self.id, end + 1);
                self.read_buf.advance(end + 1);
                self.discarding = false;
            }
            None => self.read_buf.clear(),
        }
    }

    /// Report an oversized pending message
    ///
    /// A handler answering `Abort` forces a shutdown. Otherwise the partial
    /// NUL-framed message is dropped along with the rest of it, up to the
    /// next delimiter. A length-prefixed stream is shut down either way.
    fn check_backpressure(&mut self) -> bool {
        let framing = self.ctx.config.framing;
        let pending = framing.pending_len(&self.read_buf);
        if pending <= self.ctx.config.max_message_size {
            return true;
        }

        debug!(
            "Socket {}: pending message of {} bytes exceeds limit",
            self.id, pending
        );
        let flow = self.report(SocketError::BufferOverflow, None);
        if !self.is_open() {
            return false;
        }
        if flow.is_abort() || framing == Framing::LengthPrefixed {
            self.shutdown();
            return false;
        }

        self.read_buf.clear();
        self.discarding = true;
        true
    }

    /// Notify `Write`, then send queued bytes until drained or the OS pushes back
    ///
    /// Returns the number of bytes still queued; 0 means fully drained.
    pub fn flush(&mut self) -> usize {
        if !self.is_open() {
            return 0;
        }
        self.emit(Event::Write);
        if !self.is_open() {
            return 0;
        }

        match self.drain_write_buffer() {
            Ok(queued) => queued,
            Err(err) => {
                let queued = self.write_buf.len();
                self.report(SocketError::FailedWrite, Some(&err));
                if self.is_open() {
                    self.close();
                }
                queued
            }
        }
    }

    /// Send from the write buffer without notifying the handler
    pub(super) fn drain_write_buffer(&mut self) -> io::Result<usize> {
        while !self.write_buf.is_empty() {
            let Some(handle) = self.handle.as_ref() else {
                return Ok(self.write_buf.len());
            };
            match handle.send(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    trace!("Socket {}: sent {} bytes", self.id, n);
                    self.write_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(self.write_buf.len())
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(0)
    }

    /// Fire every due timer once and reschedule it
    pub fn timers_tick(&mut self) {
        for (id, interval) in self.timers.take_due(Instant::now()) {
            if !self.is_open() {
                break;
            }
            // an earlier callback in this tick may have killed it
            if !self.timers.contains(id) {
                continue;
            }
            self.emit(Event::Timer { id, interval });
        }
    }

    /// Run one reactor tick for this socket
    ///
    /// Returns false once the socket is closed.
    pub fn update(&mut self) -> bool {
        let timeout = PollTimeout::from(self.ctx.config.poll_timeout_ms);
        let (polled, revents) = match self.handle.as_ref() {
            Some(handle) => {
                let mut fds = [PollFd::new(handle.as_fd(), CONNECTION_INTEREST)];
                let polled = poll(&mut fds, timeout);
                (polled, fds[0].revents().unwrap_or(PollFlags::empty()))
            }
            None => {
                self.cleanup();
                return false;
            }
        };

        match polled {
            Ok(0) | Err(Errno::EINTR) => true,
            Ok(_) => self.service(revents),
            Err(errno) => {
                let err = io::Error::from(errno);
                self.report(SocketError::FailedPoll, Some(&err));
                self.close();
                false
            }
        }
    }

    /// Act on the readiness flags reported by poll
    ///
    /// Reading always happens before timers and flushing in the same tick.
    pub(super) fn service(&mut self, revents: PollFlags) -> bool {
        if revents.contains(PollFlags::POLLIN) && !self.read() && self.is_open() {
            self.close();
        }

        if self.is_open() && revents.contains(PollFlags::POLLOUT) {
            self.timers_tick();
            if self.is_open() {
                self.flush();
            }
        }

        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL)
            && self.state != SocketState::Closed
        {
            let cause = self
                .handle
                .as_ref()
                .and_then(|handle| handle.take_error().ok().flatten());
            self.report(SocketError::Poll, cause.as_ref());
            if self.is_open() {
                self.shutdown();
            } else {
                self.cleanup();
            }
        }

        if revents.contains(PollFlags::POLLHUP) && self.is_open() {
            self.close();
        }

        self.is_open()
    }
}
