#![allow(dead_code)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tickwire::{handler, Config, Event, Flow, Handler, Network, ServerSocket, Socket, SocketError};

/// Owned copy of an [`Event`] for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Create,
    Start,
    Accepted(u64),
    Data(Vec<u8>),
    Error(SocketError),
    Close,
    End,
    Timer(u32, Instant),
    Write,
}

impl Seen {
    fn of(event: &Event<'_>) -> Self {
        match event {
            Event::Create => Seen::Create,
            Event::Start {
                accepted: Some(client),
            } => Seen::Accepted(client.id()),
            Event::Start { accepted: None } => Seen::Start,
            Event::Data(message) => Seen::Data(message.to_vec()),
            Event::Error { kind, .. } => Seen::Error(*kind),
            Event::Close => Seen::Close,
            Event::End => Seen::End,
            Event::Timer { id, .. } => Seen::Timer(*id, Instant::now()),
            Event::Write => Seen::Write,
        }
    }
}

/// Records every event delivered to the handlers it creates
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<Seen>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Rc<dyn Handler> {
        self.handler_with(|_, _| Flow::Continue)
    }

    /// Record, then let `reply` decide the verdict
    pub fn handler_with<F>(&self, reply: F) -> Rc<dyn Handler>
    where
        F: Fn(&mut Socket, &Seen) -> Flow + 'static,
    {
        let events = Rc::clone(&self.events);
        Rc::new(handler::from_fn(move |socket, event| {
            let seen = Seen::of(&event);
            events.borrow_mut().push(seen.clone());
            reply(socket, &seen)
        }))
    }

    pub fn events(&self) -> Vec<Seen> {
        self.events.borrow().clone()
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|seen| match seen {
                Seen::Data(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Seen) -> bool) -> usize {
        self.events.borrow().iter().filter(|seen| matches(seen)).count()
    }

    pub fn errors(&self, kind: SocketError) -> usize {
        self.count(|seen| *seen == Seen::Error(kind))
    }

    pub fn ends(&self) -> usize {
        self.count(|seen| *seen == Seen::End)
    }
}

pub fn test_config() -> Config {
    Config {
        poll_timeout_ms: 5,
        shutdown_retry_ms: 1,
        shutdown_linger_ms: 1,
        connect_timeout_ms: Some(2000),
        ..Default::default()
    }
}

pub fn network(config: Config) -> Network {
    Network::new(config).expect("valid config")
}

pub fn any_local_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

const DEADLINE: Duration = Duration::from_secs(5);

/// Tick `server` until `done` holds or the deadline passes
pub fn tick_server_until(
    server: &mut ServerSocket,
    mut done: impl FnMut(&ServerSocket) -> bool,
) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        server.update();
        if done(server) {
            return true;
        }
    }
    false
}

/// Tick `socket` until `done` holds or the deadline passes
pub fn tick_socket_until(socket: &mut Socket, mut done: impl FnMut(&Socket) -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        socket.update();
        if done(socket) {
            return true;
        }
    }
    false
}
