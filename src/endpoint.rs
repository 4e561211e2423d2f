//! Endpoint: the client side of a relay connection.
//!
//! `connect` resolves `host:port`, opens the connection and queues the
//! display name as the handshake frame. Each `update` waits once for
//! readiness on the single socket, decodes every complete relayed frame into
//! the local queue and flushes pending output.

use crate::config::EndpointConfig;
use crate::error::{ChatError, Result};
use crate::message::{Message, MessageQueue};
use crate::protocol;
use crate::runtime::{
    interest_for, ByteStream, ConnState, ReceiveStatus, SendStatus, UpdateStatus, ENDPOINT_TOKEN,
};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll};
use std::io;
use std::net::ToSocketAddrs;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Endpoint {
    name: String,
    state: ConnState,
    poll: Poll,
    events: Events,
    socket: Option<TcpStream>,
    inbound: ByteStream,
    outbound: ByteStream,
    messages: MessageQueue,
    /// Interest last pushed to the multiplexer.
    armed: Interest,
    malformed_frames: u64,
}

impl Endpoint {
    /// Create an unconnected endpoint that will introduce itself as `name`.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_config(&EndpointConfig {
            name: name.to_string(),
            ..EndpointConfig::default()
        })
    }

    pub fn with_config(config: &EndpointConfig) -> Result<Self> {
        protocol::validate_name(&config.name)?;
        Ok(Self {
            name: config.name.clone(),
            state: ConnState::Unconnected,
            poll: Poll::new()?,
            events: Events::with_capacity(config.event_capacity.max(1)),
            socket: None,
            inbound: ByteStream::new(),
            outbound: ByteStream::new(),
            messages: MessageQueue::new(),
            armed: Interest::READABLE,
            malformed_frames: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Connect to `addr` (`host:port`) and queue the handshake.
    ///
    /// Every resolved address is tried in order; the first that accepts wins.
    pub fn connect(&mut self, addr: &str) -> Result<()> {
        if self.state != ConnState::Unconnected {
            return Err(ChatError::AlreadyStarted);
        }

        let candidates = addr
            .to_socket_addrs()
            .map_err(|e| ChatError::NoAddress(format!("{addr}: {e}")))?;

        let mut connected = None;
        for candidate in candidates {
            match std::net::TcpStream::connect(candidate) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => debug!(addr = %candidate, error = %e, "Connect attempt failed"),
            }
        }
        let stream = connected.ok_or_else(|| ChatError::NoAddress(addr.to_string()))?;
        stream.set_nonblocking(true)?;
        let mut socket = TcpStream::from_std(stream);

        protocol::encode_handshake(&mut self.outbound, &self.name)?;
        self.armed = interest_for(&self.outbound);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut socket, ENDPOINT_TOKEN, self.armed)
        {
            self.outbound.clear();
            return Err(e.into());
        }

        info!(addr, name = %self.name, "Connected");
        self.socket = Some(socket);
        self.state = ConnState::Connected;
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            ConnState::Unconnected => Err(ChatError::NotStarted),
            ConnState::Connected => Ok(()),
            ConnState::Closed => Err(ChatError::Closed),
        }
    }

    /// Wait up to `timeout` for readiness and service the socket.
    ///
    /// An unrecoverable socket error closes the connection and is returned.
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<UpdateStatus> {
        self.ensure_connected()?;

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(UpdateStatus::TimedOut)
            }
            Err(e) => return Err(e.into()),
        }

        let mut readable = false;
        let mut writable = false;
        for event in self.events.iter() {
            if event.token() == ENDPOINT_TOKEN {
                readable |= event.is_readable() || event.is_read_closed() || event.is_error();
                writable |= event.is_writable();
            }
        }
        if !readable && !writable {
            return Ok(UpdateStatus::TimedOut);
        }

        if let Err(e) = self.service(readable, writable) {
            warn!(error = %e, "Connection failed");
            self.teardown();
            return Err(e);
        }
        Ok(UpdateStatus::Processed)
    }

    fn service(&mut self, readable: bool, writable: bool) -> Result<()> {
        if readable {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };
            let status = self.inbound.receive_from(socket)?;
            self.drain_frames()?;
            if status == ReceiveStatus::Closed {
                info!("Broker closed the connection");
                self.teardown();
                return Ok(());
            }
        }

        if writable {
            let Some(socket) = self.socket.as_mut() else {
                return Ok(());
            };
            if self.outbound.send_to(socket)? == SendStatus::Complete {
                self.sync_interest()?;
            }
        }
        Ok(())
    }

    /// Decode every complete relayed frame into the local queue.
    ///
    /// Frames without an author separator are dropped and counted.
    fn drain_frames(&mut self) -> Result<()> {
        while let Some(frame) = self.inbound.next_frame() {
            match protocol::decode_relayed(&frame) {
                Ok(message) => self.messages.push(message)?,
                Err(_) => {
                    self.malformed_frames += 1;
                    warn!(len = frame.len(), "Dropping frame without author");
                }
            }
        }
        Ok(())
    }

    fn sync_interest(&mut self) -> Result<()> {
        let wanted = interest_for(&self.outbound);
        if wanted == self.armed {
            return Ok(());
        }
        if let Some(socket) = self.socket.as_mut() {
            self.poll
                .registry()
                .reregister(socket, ENDPOINT_TOKEN, wanted)?;
            self.armed = wanted;
        }
        Ok(())
    }

    /// Release the socket and buffers. Unsent output is discarded.
    fn teardown(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = self.poll.registry().deregister(&mut socket) {
                debug!(error = %e, "Deregister failed");
            }
        }
        self.inbound = ByteStream::new();
        self.outbound = ByteStream::new();
        self.state = ConnState::Closed;
    }

    /// Take the oldest decoded message. Messages decoded before a close stay
    /// available.
    pub fn pop_next(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Queue text for the broker. Each newline ends one chat line.
    pub fn feed(&mut self, text: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        self.outbound.push(text)?;
        self.outbound.terminate_lines();
        self.sync_interest()
    }

    /// Events worth waiting for, or `None` unless connected.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Connected => Some(interest_for(&self.outbound)),
            _ => None,
        }
    }

    /// Descriptor that becomes readable whenever `update` has work.
    pub fn descriptor(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    pub fn socket_descriptor(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    /// Relayed frames dropped for lacking an author.
    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }
}
