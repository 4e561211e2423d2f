//! Broker: accepts endpoints and relays their lines to each other.
//!
//! One `update` call waits once for readiness and services every event it
//! got back:
//! - listener readable: accept all pending connections, register each for
//!   readable only
//! - peer readable: drain the socket, decode every complete frame. The first
//!   frame names the peer; later frames are queued locally as messages and
//!   relayed to every other peer as `<name>\n<body>\0`
//! - peer writable: flush the outbound stream, disarm writable once empty
//!
//! A failure on one peer's socket tears down only that peer.

use crate::config::BrokerConfig;
use crate::error::{ChatError, Result};
use crate::message::{Message, MessageQueue};
use crate::protocol;
use crate::runtime::{
    self, ByteStream, Peer, PeerId, PeerRegistry, ReceiveStatus, SendStatus, UpdateStatus,
    LISTENER_TOKEN,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Readiness of one token, copied out of the event batch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// The relay hub.
pub struct Broker {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    peers: PeerRegistry,
    /// Messages decoded from peers, waiting for the hosting application.
    messages: MessageQueue,
    /// Lines fed by the hosting application, not yet terminated.
    local_lines: ByteStream,
    server_author: String,
    ready: Vec<Readiness>,
    /// An accept failed with connections possibly left in the backlog.
    accept_pending: bool,
}

impl Broker {
    pub fn new() -> Result<Self> {
        Self::with_config(&BrokerConfig::default())
    }

    /// Create a broker. It does not listen until [`Broker::listen`].
    pub fn with_config(config: &BrokerConfig) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(config.event_capacity.max(1)),
            listener: None,
            peers: PeerRegistry::new(config.max_peers),
            messages: MessageQueue::new(),
            local_lines: ByteStream::new(),
            server_author: config.server_author.clone(),
            ready: Vec::new(),
            accept_pending: false,
        })
    }

    /// Start listening on `port` on all IPv4 interfaces. Port 0 picks a free one.
    pub fn listen(&mut self, port: u16) -> Result<()> {
        if self.listener.is_some() {
            return Err(ChatError::AlreadyStarted);
        }

        let mut listener = TcpListener::from_std(runtime::create_listener(port)?);
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(addr = ?listener.local_addr().ok(), "Broker listening");
        self.listener = Some(listener);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    /// Wait up to `timeout` for readiness and service what is ready.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` only checks.
    ///
    /// Every event in the batch is serviced even when one of them fails; the
    /// first broker-level error is returned afterwards. After a failed accept
    /// the next call retries the listener without waiting.
    pub fn update(&mut self, timeout: Option<Duration>) -> Result<UpdateStatus> {
        if self.listener.is_none() {
            return Err(ChatError::NotStarted);
        }

        // The listener edge was already consumed, so it will not fire again
        let retry_accept = std::mem::take(&mut self.accept_pending);
        let timeout = if retry_accept {
            Some(Duration::ZERO)
        } else {
            timeout
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) => {
                self.accept_pending = retry_accept;
                if e.kind() == io::ErrorKind::Interrupted {
                    return Ok(UpdateStatus::TimedOut);
                }
                return Err(e.into());
            }
        }
        if self.events.is_empty() && !retry_accept {
            return Ok(UpdateStatus::TimedOut);
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(|event| Readiness {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable(),
        }));
        if retry_accept && !ready.iter().any(|r| r.token == LISTENER_TOKEN) {
            ready.push(Readiness {
                token: LISTENER_TOKEN,
                readable: true,
                writable: false,
            });
        }

        let result = self.dispatch(&ready);
        self.ready = ready;
        result.map(|()| UpdateStatus::Processed)
    }

    fn dispatch(&mut self, ready: &[Readiness]) -> Result<()> {
        let mut outcome = Ok(());
        for readiness in ready {
            if readiness.token == LISTENER_TOKEN {
                keep_first(&mut outcome, self.accept_peers());
                continue;
            }

            let Some(id) = PeerId::from_token(readiness.token) else {
                continue;
            };
            if readiness.readable {
                keep_first(&mut outcome, self.handle_readable(id));
            }
            // The read side may have removed the peer
            if readiness.writable && self.peers.contains(id) {
                self.handle_writable(id);
            }
        }
        outcome
    }

    /// Whether a failed accept is waiting to be retried. No readiness will
    /// be reported for it, so a host blocking on [`Broker::descriptor`]
    /// should wake up on a timer and call `update` again.
    pub fn accept_pending(&self) -> bool {
        self.accept_pending
    }

    fn accept_peers(&mut self) -> Result<()> {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return Ok(());
            };
            match listener.accept() {
                Ok((socket, addr)) => self.add_peer(socket, addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    self.accept_pending = true;
                    return Err(e.into());
                }
            }
        }
    }

    fn add_peer(&mut self, socket: TcpStream, addr: SocketAddr) {
        let id = match self.peers.insert(Peer::new(socket, addr)) {
            Ok(id) => id,
            Err(_rejected) => {
                warn!(peer = %addr, max_peers = self.peers.capacity(), "Connection limit reached");
                return;
            }
        };

        let registry = self.poll.registry();
        let registered = match self.peers.get_mut(id) {
            Some(peer) => peer.register(registry, id),
            None => return,
        };
        if let Err(e) = registered {
            warn!(peer = %addr, error = %e, "Failed to register peer");
            self.peers.remove(id);
            return;
        }

        debug!(peer = %addr, slot = id.slot(), "Accepted connection");
    }

    fn handle_readable(&mut self, id: PeerId) -> Result<()> {
        let Some(peer) = self.peers.get_mut(id) else {
            return Ok(());
        };

        let status = match peer.inbound.receive_from(&mut peer.socket) {
            Ok(status) => status,
            Err(e) => {
                debug!(peer = %peer.addr, error = %e, "Receive failed");
                self.close_peer(id);
                return Ok(());
            }
        };

        let mut outcome = Ok(());
        while let Some(frame) = self.peers.get_mut(id).and_then(|p| p.inbound.next_frame()) {
            keep_first(&mut outcome, self.process_frame(id, &frame));
        }

        if status == ReceiveStatus::Closed {
            self.close_peer(id);
        }
        outcome
    }

    /// Handle one decoded frame from `id`.
    ///
    /// A peer without a name takes the frame as its name, even when the frame
    /// is empty. Later frames are relayed under that registered name; nothing
    /// the sender embeds in the frame is trusted as an author.
    fn process_frame(&mut self, id: PeerId, frame: &[u8]) -> Result<()> {
        let Some(peer) = self.peers.get_mut(id) else {
            return Ok(());
        };

        let author = match &peer.name {
            Some(name) => name.clone(),
            None => {
                let name = String::from_utf8_lossy(frame).into_owned();
                info!(peer = %peer.addr, name = %name, "Peer joined");
                peer.name = Some(name);
                return Ok(());
            }
        };

        self.broadcast(Some(id), author.as_bytes(), frame);
        self.messages
            .push(Message::new(author.as_str(), String::from_utf8_lossy(frame)))
            .inspect_err(|e| warn!(name = %author, error = %e, "Message not queued"))
    }

    /// Queue `<author>\n<body>\0` for every peer except `except`.
    fn broadcast(&mut self, except: Option<PeerId>, author: &[u8], body: &[u8]) {
        let registry = self.poll.registry();
        let mut failed = Vec::new();

        for (other_id, other) in self.peers.iter_mut() {
            if Some(other_id) == except {
                continue;
            }
            let queued = protocol::encode_relayed(&mut other.outbound, author, body)
                .and_then(|()| other.sync_interest(registry, other_id));
            if let Err(e) = queued {
                warn!(peer = %other.addr, error = %e, "Relay failed");
                failed.push(other_id);
            }
        }

        for id in failed {
            self.close_peer(id);
        }
    }

    fn handle_writable(&mut self, id: PeerId) {
        let registry = self.poll.registry();
        let Some(peer) = self.peers.get_mut(id) else {
            return;
        };

        let flushed = match peer.outbound.send_to(&mut peer.socket) {
            Ok(SendStatus::Complete) => peer.sync_interest(registry, id),
            Ok(SendStatus::Partial) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = flushed {
            debug!(peer = %peer.addr, error = %e, "Send failed");
            self.close_peer(id);
        }
    }

    /// Deregister and drop a peer. Unsent output and any partial inbound
    /// frame are discarded.
    fn close_peer(&mut self, id: PeerId) {
        let Some(mut peer) = self.peers.remove(id) else {
            return;
        };
        if let Err(e) = peer.deregister(self.poll.registry()) {
            debug!(peer = %peer.addr, error = %e, "Deregister failed");
        }
        info!(
            peer = %peer.addr,
            name = peer.label(),
            dropped_inbound = peer.inbound.pending(),
            dropped_outbound = peer.outbound.pending(),
            "Peer disconnected"
        );
    }

    /// Take the oldest decoded message.
    pub fn pop_next(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    /// Feed text authored by the hosting application.
    ///
    /// Every complete line is broadcast to all peers under the server author.
    /// A trailing partial line waits for its newline.
    pub fn feed(&mut self, text: &[u8]) -> Result<()> {
        self.local_lines.push(text)?;
        self.local_lines.terminate_lines();

        let author = self.server_author.clone();
        while let Some(line) = self.local_lines.next_frame() {
            self.broadcast(None, author.as_bytes(), &line);
        }
        Ok(())
    }

    /// Events the hosting application should wait for, or `None` before
    /// [`Broker::listen`].
    pub fn interest(&self) -> Option<Interest> {
        self.listener.as_ref()?;
        let writable = self.peers.iter().any(|(_, peer)| peer.outbound.has_pending());
        Some(if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        })
    }

    /// Descriptor that becomes readable whenever `update` has work.
    pub fn descriptor(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    pub fn listener_descriptor(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Number of connected peers, named or not.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Names of peers that completed their handshake.
    pub fn peer_names(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter_map(|(_, peer)| peer.name.clone())
            .collect()
    }
}

/// Record `result` in `outcome` unless an earlier error is already there.
fn keep_first(outcome: &mut Result<()>, result: Result<()>) {
    if let Err(e) = result {
        if outcome.is_ok() {
            *outcome = Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::time::Instant;

    fn start_broker(config: &BrokerConfig) -> (Broker, SocketAddr) {
        let mut broker = Broker::with_config(config).unwrap();
        broker.listen(0).unwrap();
        let port = broker.local_addr().unwrap().port();
        (broker, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn raw_client(addr: SocketAddr) -> StdStream {
        let stream = StdStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream
    }

    fn send(stream: &mut StdStream, bytes: &[u8]) {
        stream.set_nonblocking(false).unwrap();
        stream.write_all(bytes).unwrap();
        stream.set_nonblocking(true).unwrap();
    }

    /// Append whatever is readable; returns false once the remote closed.
    fn read_available(stream: &mut StdStream, into: &mut Vec<u8>) -> bool {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return false,
                Ok(n) => into.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => return false,
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    fn pump_until(broker: &mut Broker, mut done: impl FnMut(&mut Broker) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(broker) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            broker.update(Some(Duration::from_millis(10))).unwrap();
        }
    }

    fn join(broker: &mut Broker, addr: SocketAddr, name: &str) -> StdStream {
        let mut stream = raw_client(addr);
        send(&mut stream, format!("{name}\0").as_bytes());
        let name = name.to_string();
        pump_until(broker, |b| b.peer_names().contains(&name));
        stream
    }

    #[test]
    fn test_lifecycle_misuse() {
        let mut broker = Broker::new().unwrap();
        assert!(broker.interest().is_none());
        assert!(matches!(
            broker.update(Some(Duration::ZERO)),
            Err(ChatError::NotStarted)
        ));

        broker.listen(0).unwrap();
        assert!(matches!(broker.listen(0), Err(ChatError::AlreadyStarted)));
        assert_eq!(broker.interest(), Some(Interest::READABLE));
        assert!(broker.listener_descriptor().is_some());
    }

    #[test]
    fn test_timeout_is_not_an_error() {
        let (mut broker, _) = start_broker(&BrokerConfig::default());
        let status = broker.update(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(status, UpdateStatus::TimedOut);
    }

    #[test]
    fn test_handshake_names_peer_without_message() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let _alice = join(&mut broker, addr, "alice");

        assert_eq!(broker.peer_names(), vec!["alice".to_string()]);
        assert!(broker.pop_next().is_none());
    }

    #[test]
    fn test_relay_reaches_every_other_peer() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let mut alice = join(&mut broker, addr, "alice");
        let mut bob = join(&mut broker, addr, "bob");
        let mut carol = join(&mut broker, addr, "carol");

        send(&mut alice, b"hello world\0");

        let expected = b"alice\nhello world\0";
        let (mut at_bob, mut at_carol) = (Vec::new(), Vec::new());
        pump_until(&mut broker, |_| {
            read_available(&mut bob, &mut at_bob);
            read_available(&mut carol, &mut at_carol);
            at_bob.len() >= expected.len() && at_carol.len() >= expected.len()
        });
        assert_eq!(at_bob, expected);
        assert_eq!(at_carol, expected);

        let message = broker.pop_next().unwrap();
        assert_eq!(message, Message::new("alice", "hello world"));
        assert!(broker.pop_next().is_none());

        // The sender gets no echo
        let mut at_alice = Vec::new();
        for _ in 0..5 {
            broker.update(Some(Duration::from_millis(5))).unwrap();
        }
        read_available(&mut alice, &mut at_alice);
        assert!(at_alice.is_empty());
    }

    #[test]
    fn test_relay_ignores_embedded_author() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let mut mallory = join(&mut broker, addr, "mallory");
        let mut bob = join(&mut broker, addr, "bob");

        send(&mut mallory, b"admin\nhi\0");

        let expected = b"mallory\nadmin\nhi\0";
        let mut at_bob = Vec::new();
        pump_until(&mut broker, |_| {
            read_available(&mut bob, &mut at_bob);
            at_bob.len() >= expected.len()
        });
        assert_eq!(at_bob, expected);
        assert_eq!(broker.pop_next().unwrap().author(), "mallory");
    }

    #[test]
    fn test_feed_broadcasts_under_server_author() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let mut alice = join(&mut broker, addr, "alice");
        let mut bob = raw_client(addr);
        pump_until(&mut broker, |b| b.peer_count() == 2);

        broker.feed(b"announce").unwrap();
        assert_eq!(broker.interest(), Some(Interest::READABLE));

        broker.feed(b"ment\n").unwrap();
        assert_eq!(
            broker.interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        let expected = b"server\nannouncement\0";
        let (mut at_alice, mut at_bob) = (Vec::new(), Vec::new());
        pump_until(&mut broker, |_| {
            read_available(&mut alice, &mut at_alice);
            read_available(&mut bob, &mut at_bob);
            at_alice.len() >= expected.len() && at_bob.len() >= expected.len()
        });
        assert_eq!(at_alice, expected);
        assert_eq!(at_bob, expected);

        // Fed lines are not queued locally
        assert!(broker.pop_next().is_none());
        pump_until(&mut broker, |b| b.interest() == Some(Interest::READABLE));
    }

    #[test]
    fn test_custom_server_author() {
        let config = BrokerConfig {
            server_author: "host".into(),
            ..BrokerConfig::default()
        };
        let (mut broker, addr) = start_broker(&config);
        let mut alice = join(&mut broker, addr, "alice");

        broker.feed(b"one\ntwo\n").unwrap();
        let expected = b"host\none\0host\ntwo\0";
        let mut at_alice = Vec::new();
        pump_until(&mut broker, |_| {
            read_available(&mut alice, &mut at_alice);
            at_alice.len() >= expected.len()
        });
        assert_eq!(at_alice, expected);
    }

    #[test]
    fn test_close_mid_frame_drops_partial_and_keeps_serving() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let mut alice = join(&mut broker, addr, "alice");
        let mut bob = join(&mut broker, addr, "bob");

        send(&mut alice, b"complete\0partial");
        drop(alice);
        pump_until(&mut broker, |b| b.peer_count() == 1);
        assert_eq!(broker.peer_names(), vec!["bob".to_string()]);

        assert_eq!(broker.pop_next().unwrap().body(), "complete");
        assert!(broker.pop_next().is_none());

        broker.feed(b"still here\n").unwrap();
        let expected: &[u8] = b"alice\ncomplete\0server\nstill here\0";
        let mut at_bob = Vec::new();
        pump_until(&mut broker, |_| {
            read_available(&mut bob, &mut at_bob);
            at_bob.len() >= expected.len()
        });
        assert_eq!(at_bob, expected);
    }

    /// An empty first frame is taken as the handshake, naming the peer "".
    /// This mirrors the existing protocol rather than rejecting the frame.
    #[test]
    fn test_empty_first_frame_is_taken_as_handshake() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let mut anon = raw_client(addr);
        send(&mut anon, b"\0hello\0");

        pump_until(&mut broker, |b| b.messages.len() == 1);
        assert_eq!(broker.peer_names(), vec![String::new()]);
        assert_eq!(broker.pop_next().unwrap(), Message::new("", "hello"));
    }

    #[test]
    fn test_connection_limit() {
        let config = BrokerConfig {
            max_peers: 1,
            ..BrokerConfig::default()
        };
        let (mut broker, addr) = start_broker(&config);
        let _alice = join(&mut broker, addr, "alice");

        let mut rejected = raw_client(addr);
        let mut sink = Vec::new();
        pump_until(&mut broker, |_| !read_available(&mut rejected, &mut sink));
        assert_eq!(broker.peer_count(), 1);
    }

    #[test]
    fn test_failed_accept_is_retried_without_new_readiness() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let _client = raw_client(addr);

        // Swallow the listener edge as a failed accept would
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            broker
                .poll
                .poll(&mut broker.events, Some(Duration::from_millis(10)))
                .unwrap();
            if broker.events.iter().any(|e| e.token() == LISTENER_TOKEN) {
                break;
            }
            assert!(Instant::now() < deadline, "listener never became ready");
        }
        assert_eq!(
            broker.update(Some(Duration::from_millis(20))).unwrap(),
            UpdateStatus::TimedOut
        );
        assert_eq!(broker.peer_count(), 0);

        broker.accept_pending = true;
        assert_eq!(
            broker.update(Some(Duration::ZERO)).unwrap(),
            UpdateStatus::Processed
        );
        assert_eq!(broker.peer_count(), 1);
        assert!(!broker.accept_pending());
    }

    #[test]
    fn test_keep_first_error() {
        let mut outcome = Ok(());
        keep_first(&mut outcome, Ok(()));
        assert!(outcome.is_ok());

        keep_first(&mut outcome, Err(ChatError::Resource(1)));
        keep_first(&mut outcome, Err(ChatError::Closed));
        assert!(matches!(outcome, Err(ChatError::Resource(1))));
    }

    #[test]
    fn test_chunked_stream_yields_every_frame() {
        let (mut broker, addr) = start_broker(&BrokerConfig::default());
        let mut alice = join(&mut broker, addr, "alice");

        let mut wire = Vec::new();
        for i in 0..1000 {
            wire.extend_from_slice(format!("msg {i}\0").as_bytes());
        }
        let sizes = [1usize, 5, 13, 2, 64, 3, 511];
        let mut offset = 0;
        let mut round = 0;
        while offset < wire.len() {
            let end = (offset + sizes[round % sizes.len()]).min(wire.len());
            send(&mut alice, &wire[offset..end]);
            broker.update(Some(Duration::ZERO)).unwrap();
            offset = end;
            round += 1;
        }

        let mut bodies = Vec::new();
        pump_until(&mut broker, |b| {
            while let Some(message) = b.pop_next() {
                bodies.push(message.into_parts().1);
            }
            bodies.len() >= 1000
        });
        let expected: Vec<String> = (0..1000).map(|i| format!("msg {i}")).collect();
        assert_eq!(bodies, expected);
    }
}
