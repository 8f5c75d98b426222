//! Byte-stream transport underneath a session.

use std::collections::VecDeque;
use std::io;

use platls_types::TlsError;

/// Non-blocking byte-stream transport.
///
/// The session never waits on the transport: `read` reports what is
/// available right now, and the owner calls `TlsSession::transmit` again
/// once more bytes arrive.
pub trait Transport {
    /// Read available bytes into `buf`; `Ok(0)` means nothing is available now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue `buf` for sending and return the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}

/// Write `bytes` in one call; a short write is an I/O error.
pub(crate) fn send_all<T: Transport + ?Sized>(transport: &mut T, bytes: &[u8]) -> Result<(), TlsError> {
    if bytes.is_empty() {
        return Ok(());
    }
    let written = transport.write(bytes)?;
    if written != bytes.len() {
        return Err(TlsError::IoError(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("transport accepted {written} of {} bytes", bytes.len()),
        )));
    }
    Ok(())
}

/// In-memory transport.
///
/// Inbound bytes are pushed by the owner and handed out at most
/// `read_chunk` bytes per `read` call; outbound bytes accumulate until taken.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    read_chunk: Option<usize>,
    write_limit: Option<usize>,
    closed: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver at most `chunk` bytes per read.
    pub fn with_read_chunk(mut self, chunk: usize) -> Self {
        self.read_chunk = Some(chunk.max(1));
        self
    }

    /// Accept at most `limit` bytes per write.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes);
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound.len()
    }

    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    pub fn outbound(&self) -> &[u8] {
        &self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = buf.len().min(self.inbound.len());
        if let Some(chunk) = self.read_chunk {
            n = n.min(chunk);
        }
        for (slot, byte) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        let n = self.write_limit.map_or(buf.len(), |limit| buf.len().min(limit));
        self.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_respects_chunk_size() {
        let mut t = MemoryTransport::new().with_read_chunk(2);
        t.push_inbound(b"abcde");
        let mut buf = [0u8; 16];
        assert_eq!(t.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(t.inbound_len(), 3);
    }

    #[test]
    fn test_read_empty_returns_zero() {
        let mut t = MemoryTransport::new();
        let mut buf = [0u8; 4];
        assert_eq!(t.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_short_write_is_io_error() {
        let mut t = MemoryTransport::new().with_write_limit(3);
        let err = send_all(&mut t, b"abcdef").unwrap_err();
        assert!(matches!(err, TlsError::IoError(_)));
        assert_eq!(t.outbound(), b"abc");
    }

    #[test]
    fn test_write_after_close_fails() {
        let mut t = MemoryTransport::new();
        t.close().unwrap();
        assert!(t.is_closed());
        assert!(send_all(&mut t, b"x").is_err());
    }
}
