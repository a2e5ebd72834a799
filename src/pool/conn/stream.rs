use std::{
    fmt,
    io::{self, Read, Write},
    mem::MaybeUninit,
    net::{Shutdown, TcpStream},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use rustls::{ClientConnection, StreamOwned};
use socket2::SockRef;

/// A stream to the server, possibly using TLS.
#[allow(clippy::large_enum_variant)]
pub(crate) enum Stream {
    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A connection over a Unix Domain Socket.
    #[cfg(unix)]
    Unix(UnixStream),

    /// A TLS session over TCP.
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_read_timeout(timeout),
            Self::Tls(stream) => stream.sock.set_read_timeout(timeout),
        }
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            Self::Unix(stream) => stream.set_write_timeout(timeout),
            Self::Tls(stream) => stream.sock.set_write_timeout(timeout),
        }
    }

    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
            Self::Tls(stream) => stream.sock.shutdown(Shutdown::Both),
        }
    }

    /// Probes the underlying socket for readability with a zero timeout. A healthy idle
    /// connection has nothing to read; a readable one means the peer sent a FIN/RST or an
    /// unsolicited message, either of which retires the connection. Probe failures count as
    /// closed.
    pub(crate) fn probably_closed(&self) -> bool {
        let sock = match self {
            Self::Tcp(stream) => SockRef::from(stream),
            #[cfg(unix)]
            Self::Unix(stream) => SockRef::from(stream),
            Self::Tls(stream) => SockRef::from(&stream.sock),
        };

        if sock.set_nonblocking(true).is_err() {
            return true;
        }

        let mut buf = [MaybeUninit::<u8>::uninit()];
        let peeked = sock.peek(&mut buf);
        let restored = sock.set_nonblocking(false).is_ok();

        match peeked {
            _ if !restored => true,
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp(stream) => fmt.debug_tuple("Tcp").field(stream).finish(),
            #[cfg(unix)]
            Self::Unix(stream) => fmt.debug_tuple("Unix").field(stream).finish(),
            Self::Tls(stream) => fmt.debug_tuple("Tls").field(&stream.sock).finish(),
        }
    }
}
