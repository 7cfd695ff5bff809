use clap::Parser;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tickwire::{handler, Config, Event, Flow, Framing, Network, Socket, SocketError};
use tracing::{debug, error, info, warn};

const HEARTBEAT_TIMER: u32 = 1;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay every message to all other connected clients", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 7000)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: String,

    /// Use 4-byte length-prefixed frames instead of NUL delimiters
    #[arg(long)]
    length_prefixed: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Message relayed from one client to the others
struct Relayed {
    from: u64,
    payload: Vec<u8>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config {
            log_level: args.log_level.clone(),
            ..Default::default()
        },
    };
    if args.length_prefixed {
        config.framing = Framing::LengthPrefixed;
    }

    // Initialize tracing
    let log_level = if args.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(format!("tickwire={},tickwire_relay={}", log_level, log_level))
        .init();

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(
        "Starting tickwire relay v{} on {} ({:?} framing)",
        env!("CARGO_PKG_VERSION"),
        addr,
        config.framing
    );

    let network = Network::new(config)?;
    let outbox: Rc<RefCell<VecDeque<Relayed>>> = Rc::new(RefCell::new(VecDeque::new()));

    let listener_events = handler::from_fn(|socket, event| {
        match event {
            Event::Start {
                accepted: Some(client),
            } => info!("Accepted {:?} on socket {}", client.peer_addr(), socket.id()),
            Event::Error { kind, cause } => error!("Listener error: {} ({:?})", kind, cause),
            _ => {}
        }
        Flow::Continue
    });

    let inbox = Rc::clone(&outbox);
    let client_events = handler::from_fn(move |socket: &mut Socket, event| {
        match event {
            Event::Start { .. } => {
                socket.set_timer(HEARTBEAT_TIMER, HEARTBEAT_INTERVAL);
                if let Err(e) = socket.send(b"welcome") {
                    warn!("Client {}: greeting not queued: {}", socket.id(), e);
                }
            }
            Event::Data(message) => {
                debug!("Client {} sent {} bytes", socket.id(), message.len());
                inbox.borrow_mut().push_back(Relayed {
                    from: socket.id(),
                    payload: message.to_vec(),
                });
            }
            Event::Timer { id, .. } if id == HEARTBEAT_TIMER => {
                let _ = socket.send(b"ping");
            }
            Event::Error {
                kind: SocketError::BufferOverflow,
                ..
            } => {
                warn!("Client {} exceeded the message size limit", socket.id());
                return Flow::Abort;
            }
            Event::Error { kind, cause } => {
                warn!("Client {} error: {} ({:?})", socket.id(), kind, cause)
            }
            Event::End => info!("Client {} disconnected", socket.id()),
            _ => {}
        }
        Flow::Continue
    });

    let mut server = network.listen(addr, Rc::new(listener_events), Rc::new(client_events))?;

    // Setup signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, shutting down gracefully...");
        flag.store(false, Ordering::Release);
    })?;

    while running.load(Ordering::Acquire) {
        if !server.update() {
            error!("Listener closed unexpectedly");
            break;
        }

        let pending: Vec<Relayed> = outbox.borrow_mut().drain(..).collect();
        for relayed in pending {
            for index in 0..server.client_count() {
                if let Some(client) = server.client_mut(index) {
                    if client.id() != relayed.from {
                        if let Err(e) = client.send(&relayed.payload) {
                            warn!("Relay to client {} failed: {}", client.id(), e);
                        }
                    }
                }
            }
        }

        // Connected sockets are almost always writable; yield between ticks.
        thread::sleep(Duration::from_millis(1));
    }

    server.cleanup();
    info!("Relay shutdown complete");
    Ok(())
}
