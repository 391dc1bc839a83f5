//! Connection plumbing shared by rooms and the PM channel
//!
//! [`Transport`] owns the non-blocking socket, its poll registration and
//! both byte buffers. [`Conn`] is the interface the manager drives: it
//! never looks at room or PM internals beyond it.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use crate::codec::{FrameDecoder, Wire};
use crate::config::{Credentials, ManagerConfig};
use crate::event::Event;
use crate::types::ConnId;
use crate::user::{User, UserRegistry};

/// Read chunk size
const READ_CHUNK: usize = 16 * 1024;

/// Name of the own user when no account name is configured
const SELF_NAME: &str = "@self";

/// Shared state every connection needs from its manager
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub config: Rc<ManagerConfig>,
    pub credentials: Rc<Credentials>,
    pub users: UserRegistry,
    /// The manager's own user
    pub own: Rc<User>,
}

impl ConnContext {
    pub fn new(config: ManagerConfig, credentials: Credentials, users: UserRegistry) -> Self {
        let own = users.get(credentials.name.as_deref().unwrap_or(SELF_NAME));
        Self {
            config: Rc::new(config),
            credentials: Rc::new(credentials),
            users,
            own,
        }
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// TCP handshake in progress, auth queued behind the write lock
    Connecting,
    /// Socket established, waiting for the server to accept the auth
    Authenticating,
    Active,
    /// Transport lost, a reconnect is scheduled
    Reconnecting,
    Disconnected,
}

/// Close asked for by the connection itself while processing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseRequest {
    /// Tear down without a disconnect event
    Quiet,
    /// Tear down and report the disconnect
    Notify,
}

/// What a readable socket produced
#[derive(Debug, Default)]
pub struct ReadOutcome {
    pub frames: Vec<String>,
    /// Peer closed the stream or the read failed
    pub closed: bool,
}

/// Outcome of a writable socket that was still connecting
#[derive(Debug, PartialEq, Eq)]
pub enum Establish {
    Pending,
    Connected,
    Failed,
}

/// Socket plus framing state of one connection
#[derive(Debug, Default)]
pub struct Transport {
    stream: Option<TcpStream>,
    token: Option<Token>,
    interest: Option<Interest>,
    pub decoder: FrameDecoder,
    pub wire: Wire,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a non-blocking connect and register it with the poller
    pub fn open(&mut self, addr: SocketAddr, registry: &Registry, token: Token) -> io::Result<()> {
        let mut stream = TcpStream::connect(addr)?;
        let interest = Interest::READABLE | Interest::WRITABLE;
        registry.register(&mut stream, token, interest)?;
        debug!(%addr, ?token, "Connecting");
        self.stream = Some(stream);
        self.token = Some(token);
        self.interest = Some(interest);
        Ok(())
    }

    /// Deregister and drop the socket; buffers are left alone
    pub fn close(&mut self, registry: &Registry) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = registry.deregister(&mut stream) {
                debug!(error = %e, "Deregister failed");
            }
        }
        self.token = None;
        self.interest = None;
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn pending_write(&self) -> bool {
        self.wire.pending_write()
    }

    /// Check whether a connect in progress has completed
    pub fn establish(&mut self) -> Establish {
        let Some(stream) = self.stream.as_ref() else {
            return Establish::Failed;
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(err)) | Err(err) => {
                warn!(error = %err, "Connection establishment failed");
                return Establish::Failed;
            }
        }
        match stream.peer_addr() {
            Ok(addr) => {
                debug!(%addr, "Connection established");
                Establish::Connected
            }
            Err(err) if err.kind() == ErrorKind::NotConnected => Establish::Pending,
            Err(err) => {
                warn!(error = %err, "Connection establishment failed");
                Establish::Failed
            }
        }
    }

    /// Read until the socket would block and decode complete frames
    pub fn read_frames(&mut self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let Some(stream) = self.stream.as_mut() else {
            outcome.closed = true;
            return outcome;
        };

        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("Connection closed by peer");
                    outcome.closed = true;
                    break;
                }
                Ok(n) => {
                    trace!(len = n, "Read data from socket");
                    data.extend_from_slice(&chunk[..n]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "Error reading from socket");
                    outcome.closed = true;
                    break;
                }
            }
        }

        if !data.is_empty() {
            outcome.frames = self.decoder.feed(&data);
        }
        outcome
    }

    /// Write as much of the queue as the socket takes; the rest stays queued
    pub fn flush(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while self.wire.pending_write() {
            match stream.write(self.wire.outgoing()) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    trace!(len = n, "Wrote to socket");
                    self.wire.consume(n);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Ask for writability only while bytes are waiting or the connect is pending
    pub fn update_interest(&mut self, registry: &Registry, connecting: bool) -> io::Result<()> {
        let (Some(stream), Some(token)) = (self.stream.as_mut(), self.token) else {
            return Ok(());
        };
        let wanted = if connecting || self.wire.pending_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if self.interest != Some(wanted) {
            registry.reregister(stream, token, wanted)?;
            self.interest = Some(wanted);
        }
        Ok(())
    }

    /// Forget both buffers and any partial frame before a new session
    pub fn reset(&mut self) {
        self.wire.reset();
        self.decoder.clear();
    }
}

/// What the manager needs from a room or the PM channel
pub trait Conn {
    fn id(&self) -> ConnId;

    fn state(&self) -> ConnState;

    fn transport(&self) -> &Transport;

    fn transport_mut(&mut self) -> &mut Transport;

    /// The TCP handshake completed
    fn established(&mut self);

    /// Interpret one inbound frame
    fn process(&mut self, line: &str);

    /// Events produced since the last call
    fn take_events(&mut self) -> Vec<Event>;

    fn close_request(&self) -> Option<CloseRequest>;

    fn pending_write(&self) -> bool {
        self.transport().pending_write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_transport_reads_as_closed() {
        let mut transport = Transport::new();
        let outcome = transport.read_frames();
        assert!(outcome.closed);
        assert!(outcome.frames.is_empty());
        assert_eq!(transport.establish(), Establish::Failed);
        assert!(transport.flush().is_ok());
    }

    #[test]
    fn test_reset_clears_buffers() {
        let mut transport = Transport::new();
        transport.wire.send_command(&["bauth", "room"]);
        transport.decoder.feed(b"partial");
        transport.reset();
        assert!(!transport.pending_write());
        assert_eq!(transport.decoder.residual(), 0);
    }
}
