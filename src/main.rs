//! nul-relay: text chat relay over NUL-delimited frames
//!
//! Two roles share one binary:
//! - `serve`: run a broker; lines typed on stdin go to every endpoint as
//!   the server author
//! - `connect`: run an endpoint; lines typed on stdin go to the broker
//!
//! Either way, decoded messages are printed to stdout and logs go to stderr.
//! The process multiplexes stdin and the relay's descriptor with `poll(2)`
//! and exits on stdin EOF.

mod cli;

use chrono::Local;
use cli::{Mode, Settings};
use nul_relay::{Broker, ChatError, ConnState, Endpoint, Message};
use std::error::Error;
use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Bytes read from stdin per readiness.
const STDIN_CHUNK: usize = 1024;

/// Wake-up interval while the broker has an accept to retry.
const ACCEPT_RETRY_MS: libc::c_int = 100;

fn main() -> Result<(), Box<dyn Error>> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.file.logging.level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match settings.mode {
        Mode::Serve => run_broker(&settings),
        Mode::Connect => run_endpoint(&settings),
    }
}

fn run_broker(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let config = &settings.file.broker;
    let mut broker = Broker::with_config(config)?;
    broker.listen(config.port)?;

    info!(
        port = config.port,
        max_peers = config.max_peers,
        author = %config.server_author,
        "Starting broker"
    );

    let mut input = [0u8; STDIN_CHUNK];
    loop {
        let timeout = if broker.accept_pending() {
            ACCEPT_RETRY_MS
        } else {
            -1
        };
        let ready = wait_ready(broker.descriptor(), timeout)?;
        if ready.stdin {
            match read_stdin(&mut input)? {
                0 => {
                    info!("EOF - exiting");
                    break;
                }
                n => {
                    if let Err(e) = broker.feed(&input[..n]) {
                        error!(error = %e, "Feed failed");
                    }
                }
            }
        }
        if ready.relay || broker.accept_pending() {
            if let Err(e) = broker.update(Some(Duration::ZERO)) {
                error!(error = %e, "Update failed");
            }
        }
        render(std::iter::from_fn(|| broker.pop_next()))?;
    }
    Ok(())
}

fn run_endpoint(settings: &Settings) -> Result<(), Box<dyn Error>> {
    let config = &settings.file.endpoint;
    let mut endpoint = Endpoint::with_config(config)?;
    endpoint.connect(&config.address)?;

    let mut input = [0u8; STDIN_CHUNK];
    loop {
        let ready = wait_ready(endpoint.descriptor(), -1)?;
        if ready.stdin {
            match read_stdin(&mut input)? {
                0 => {
                    info!("EOF - exiting");
                    break;
                }
                n => endpoint.feed(&input[..n])?,
            }
        }
        if ready.relay {
            match endpoint.update(Some(Duration::ZERO)) {
                Ok(_) => {}
                Err(ChatError::Closed) => {}
                Err(e) => error!(error = %e, "Update failed"),
            }
        }
        render(std::iter::from_fn(|| endpoint.pop_next()))?;

        if endpoint.state() == ConnState::Closed {
            info!("Disconnected - exiting");
            break;
        }
    }
    Ok(())
}

/// Which descriptors `poll(2)` reported.
struct Ready {
    stdin: bool,
    relay: bool,
}

/// Block until stdin or the relay descriptor is readable, or `timeout_ms`
/// passes. A negative timeout waits indefinitely.
fn wait_ready(relay_fd: RawFd, timeout_ms: libc::c_int) -> io::Result<Ready> {
    let mut fds = [
        libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: relay_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        // SAFETY: `fds` is a valid, initialized array that outlives the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(Ready {
        stdin: fds[0].revents != 0,
        relay: fds[1].revents != 0,
    })
}

/// Read one chunk of stdin without going through std's buffered handle,
/// so nothing is left hidden from the next `poll(2)`.
fn read_stdin(buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let rc = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr().cast(), buf.len()) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn render(messages: impl Iterator<Item = Message>) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for message in messages {
        writeln!(
            out,
            "[{}] {}: {}",
            Local::now().format("%H:%M:%S"),
            message.author(),
            message.body()
        )?;
    }
    out.flush()
}
