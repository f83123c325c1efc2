//! Outbound connection management for the CCS protocol
//!
//! One connection carries exactly one Command/Done exchange. Receives are
//! bounded: a caller waiting for a peer polls in ticks so that a local
//! abort can always interrupt the wait.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use ccslib::{read_frame, write_frame, CcsError, CcsResult, Command, ServerMessage};

/// Default timeout for establishing an outbound connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A framed TCP connection to a CCS-protocol server
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Connect to the given address, bounded by `CONNECT_TIMEOUT`
    pub fn connect(addr: &str) -> CcsResult<Self> {
        Self::connect_with_timeout(addr, CONNECT_TIMEOUT)
    }

    /// Connect to the given address with an explicit timeout
    pub fn connect_with_timeout(addr: &str, timeout: Duration) -> CcsResult<Self> {
        let resolved: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CcsError::config(format!("Unresolvable address: {}", addr)))?;
        let stream = TcpStream::connect_timeout(&resolved, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Wrap an already-connected stream (used by tests)
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Send a command
    pub fn send(&mut self, command: &Command) -> CcsResult<()> {
        write_frame(&mut self.stream, command)
    }

    /// Receive the next server message, blocking indefinitely
    pub fn receive(&mut self) -> CcsResult<ServerMessage> {
        self.stream.set_read_timeout(None)?;
        read_frame(&mut self.stream)
    }

    /// Receive the next server message within one poll tick.
    ///
    /// Returns `Ok(None)` when the tick elapses with no message, so the
    /// caller can re-check its abort flag and tick again.
    pub fn receive_tick(&mut self, tick: Duration) -> CcsResult<Option<ServerMessage>> {
        self.stream.set_read_timeout(Some(tick))?;
        match read_frame(&mut self.stream) {
            Ok(message) => Ok(Some(message)),
            Err(CcsError::Io(ref e)) if is_timeout(e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Close the connection
    pub fn close(&mut self) -> CcsResult<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
