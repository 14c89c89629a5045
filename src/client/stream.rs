//! Blocking byte stream abstraction

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Result of a single bounded read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the start of the buffer
    Data(usize),
    /// Timeout elapsed with nothing to read
    WouldBlock,
    /// Peer closed the stream
    Closed,
}

/// Blocking, timeout-aware transport under a RESP connection
pub trait ByteStream: Send {
    /// Read whatever is available, waiting at most `timeout` (forever if `None`)
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<ReadOutcome>;

    /// Write and flush all bytes
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl ByteStream for TcpStream {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<ReadOutcome> {
        // A zero read timeout is rejected by the OS
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.set_read_timeout(timeout)?;
        loop {
            match Read::read(self, buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(e) if is_disconnect(&e) => return Ok(ReadOutcome::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)?;
        Write::flush(self)
    }
}

pub(crate) fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
