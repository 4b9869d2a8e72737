//! Transport abstraction for the receive path
//!
//! The receive engine is the sole reader of its connection; everything it
//! needs from the wire is a blocking full-read-or-fail primitive, a
//! best-effort drain for resynchronization after a corrupt header, and a
//! shutdown hook so teardown can unblock an in-flight read from another
//! thread.

use crate::error::{IscsiError, IscsiResult};
use std::io::Read;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Wait policy for a blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadWait {
    /// Waiting for the next PDU to begin; bounded by the idle timeout
    /// and reported as `IdleTimeout` if nothing at all arrives
    Idle,
    /// Mid-frame; a stall here means the stream is broken
    Data,
}

/// Byte-oriented connection transport
pub trait Transport: Send {
    /// Read until `buf` is full or the connection fails. Short reads are
    /// never returned: any failure after the wait policy is a
    /// `Transport` error (or `IdleTimeout` for a quiet `Idle` wait) that
    /// the caller must escalate, never silently retry.
    fn read_full(&mut self, buf: &mut [u8], wait: ReadWait) -> IscsiResult<()>;

    /// Discard whatever bytes are currently available without blocking.
    /// Best-effort: used to look for the next PDU boundary after frame
    /// corruption. Returns the number of bytes discarded.
    fn drain(&mut self) -> IscsiResult<usize>;

    /// Shut the connection down at the socket level, unblocking any
    /// concurrent `read_full`.
    fn shutdown(&mut self) -> IscsiResult<()>;
}

/// Production transport over a TCP stream
pub struct TcpTransport {
    stream: TcpStream,
    idle_timeout: Duration,
    data_timeout: Duration,
}

impl TcpTransport {
    /// Connect to a target portal ("host:port")
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        idle_timeout: Duration,
        data_timeout: Duration,
    ) -> IscsiResult<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            stream,
            idle_timeout,
            data_timeout,
        })
    }

    /// Wrap an already-established stream (e.g. handed over after login)
    pub fn from_stream(
        stream: TcpStream,
        idle_timeout: Duration,
        data_timeout: Duration,
    ) -> Self {
        TcpTransport {
            stream,
            idle_timeout,
            data_timeout,
        }
    }

    /// A handle another thread can use to unblock this transport's
    /// reader during cooperative cancellation.
    pub fn cancel_handle(&self) -> IscsiResult<TcpCancelHandle> {
        Ok(TcpCancelHandle {
            stream: self.stream.try_clone()?,
        })
    }

    fn timed_out(kind: std::io::ErrorKind) -> bool {
        matches!(
            kind,
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )
    }
}

impl Transport for TcpTransport {
    fn read_full(&mut self, buf: &mut [u8], wait: ReadWait) -> IscsiResult<()> {
        let first_timeout = match wait {
            ReadWait::Idle => self.idle_timeout,
            ReadWait::Data => self.data_timeout,
        };
        self.stream.set_read_timeout(Some(first_timeout))?;

        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(IscsiError::Transport(
                        "connection closed by peer".to_string(),
                    ));
                }
                Ok(n) => {
                    // Once the frame has started, idle leniency ends
                    if filled == 0 && wait == ReadWait::Idle {
                        self.stream.set_read_timeout(Some(self.data_timeout))?;
                    }
                    filled += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if Self::timed_out(e.kind()) => {
                    if filled == 0 && wait == ReadWait::Idle {
                        return Err(IscsiError::IdleTimeout);
                    }
                    return Err(IscsiError::Transport(format!(
                        "read stalled after {} of {} bytes",
                        filled,
                        buf.len()
                    )));
                }
                Err(e) => return Err(IscsiError::Transport(e.to_string())),
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> IscsiResult<usize> {
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 4096];
        let mut discarded = 0;
        let result = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => break Ok(discarded),
                Ok(n) => discarded += n,
                Err(e) if Self::timed_out(e.kind()) => break Ok(discarded),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(IscsiError::Transport(e.to_string())),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn shutdown(&mut self) -> IscsiResult<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already gone is as shut down as it gets
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(IscsiError::Transport(e.to_string())),
        }
    }
}

/// Shutdown handle cloned from a `TcpTransport`
pub struct TcpCancelHandle {
    stream: TcpStream,
}

impl TcpCancelHandle {
    /// Unblock the reader; the receive loop then observes the
    /// connection's terminating state and exits.
    pub fn shutdown(&self) -> IscsiResult<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(IscsiError::Transport(e.to_string())),
        }
    }
}
