//! Buffered non-blocking peer socket.

use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;
use std::net;

use crate::net::Link;

/// A peer socket with a write queue.
///
/// Frames pushed while the underlying stream is not writable are queued and
/// flushed when the reactor sees the socket become writable again.
#[derive(Debug)]
pub struct Socket<R: Read + Write> {
    raw: R,
    /// Queued outbound frames. The front frame may be partially written.
    sendq: VecDeque<Vec<u8>>,
    /// Bytes of the front frame already written.
    offset: usize,
    /// Address of the remote end.
    pub addr: net::SocketAddr,
    /// Direction the connection was established in.
    pub link: Link,
}

impl<R: Read + Write> Socket<R> {
    /// Wrap a connected stream.
    pub fn from(raw: R, addr: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            sendq: VecDeque::new(),
            offset: 0,
            addr,
            link,
        }
    }

    /// Queue bytes for sending.
    pub fn push(&mut self, bytes: &[u8]) {
        self.sendq.push_back(bytes.to_vec());
    }

    /// Write as much of the send queue as the stream accepts.
    ///
    /// Returns `WouldBlock` when the stream stops accepting bytes with data
    /// still queued; any other error is fatal for the connection.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.sendq.front() {
            match self.raw.write(&front[self.offset..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.offset += n;

                    if self.offset == front.len() {
                        self.sendq.pop_front();
                        self.offset = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.raw.flush()
    }

    /// Read from the underlying stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }
}

impl Socket<net::TcpStream> {
    /// The local address of the connection.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }

    /// Shut the connection down. Already-closed sockets yield an error that
    /// is safe to ignore.
    pub fn disconnect(&self) -> io::Result<()> {
        self.raw.shutdown(net::Shutdown::Both)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stream that accepts a limited number of bytes per write.
    struct Throttled {
        accepted: Vec<u8>,
        per_write: usize,
        blocked: bool,
    }

    impl Read for Throttled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.per_write);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn addr() -> net::SocketAddr {
        ([127, 0, 0, 1], 9000).into()
    }

    #[test]
    fn partial_writes_resume_where_they_stopped() {
        let raw = Throttled {
            accepted: Vec::new(),
            per_write: 4,
            blocked: false,
        };
        let mut socket = Socket::from(raw, addr(), Link::Outbound);

        socket.push(b"0123456789");
        socket.push(b"abc");
        socket.flush().unwrap();

        assert_eq!(socket.raw.accepted, b"0123456789abc");
        assert!(socket.sendq.is_empty());
    }

    #[test]
    fn would_block_keeps_the_queue() {
        let raw = Throttled {
            accepted: Vec::new(),
            per_write: 4,
            blocked: true,
        };
        let mut socket = Socket::from(raw, addr(), Link::Outbound);

        socket.push(b"0123");
        let err = socket.flush().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(socket.sendq.len(), 1);

        socket.raw.blocked = false;
        socket.flush().unwrap();
        assert_eq!(socket.raw.accepted, b"0123");
    }
}
