use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};

use super::conn::stream::Stream;
use crate::{
    error::{Error, ErrorKind, Result},
    options::{PoolOptions, ServerAddress, DEFAULT_PORT},
    tls::{self, TlsConfig},
};

/// Opens streams to the pool's server: resolves the address, connects with the configured
/// socket options, and wraps the stream in TLS when the pool is configured for it.
#[derive(Debug)]
pub(crate) struct ConnectionEstablisher {
    connect_timeout: Option<Duration>,
    socket_timeout: Option<Duration>,
    socket_keepalive: bool,
    tls_config: Option<TlsConfig>,
}

impl ConnectionEstablisher {
    pub(super) fn new(options: &PoolOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            socket_keepalive: options.socket_keepalive,
            tls_config: options.tls_config.clone(),
        }
    }

    /// Opens a stream to `address` and readies it for use.
    pub(super) fn establish(&self, address: &ServerAddress) -> Result<Stream> {
        let stream = match address {
            ServerAddress::Tcp { host, port } => {
                let tcp_stream =
                    self.create_tcp_stream(host, port.unwrap_or(DEFAULT_PORT), address)?;

                // The connect timeout covers the TLS handshake as well; the configured socket
                // timeouts take over once the stream is established.
                tcp_stream.set_read_timeout(self.connect_timeout)?;
                tcp_stream.set_write_timeout(self.connect_timeout)?;

                match self.tls_config {
                    Some(ref cfg) => {
                        Stream::Tls(Box::new(tls::wrap_stream(host, tcp_stream, cfg)?))
                    }
                    None => Stream::Tcp(tcp_stream),
                }
            }
            #[cfg(unix)]
            ServerAddress::Unix { path } => {
                Stream::Unix(std::os::unix::net::UnixStream::connect(path)?)
            }
        };

        stream.set_read_timeout(self.socket_timeout)?;
        stream.set_write_timeout(self.socket_timeout)?;

        Ok(stream)
    }

    fn create_tcp_stream(
        &self,
        host: &str,
        port: u16,
        address: &ServerAddress,
    ) -> Result<TcpStream> {
        let candidates = resolve(host, port)?;

        let mut connect_error = None;
        for candidate in &candidates {
            match self.try_connect(candidate) {
                Ok(stream) => return Ok(stream),
                Err(err) => connect_error = Some(err),
            }
        }

        Err(match connect_error {
            Some(err) => {
                Error::connection_failure(format!("couldn't connect to {}: {}", address, err))
                    .with_source(Error::from(ErrorKind::from(err)))
            }
            None => ErrorKind::DnsResolve {
                message: "getaddrinfo failed".to_string(),
            }
            .into(),
        })
    }

    fn try_connect(&self, address: &SocketAddr) -> std::io::Result<TcpStream> {
        let domain = Domain::for_address(*address);
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if self.socket_keepalive {
            socket.set_keepalive(true)?;
        }

        let address = (*address).into();
        match self.connect_timeout {
            Some(timeout) if !timeout.is_zero() => socket.connect_timeout(&address, timeout)?,
            _ => socket.connect(&address)?,
        }

        let stream = TcpStream::from(socket);
        stream.set_nodelay(true)?;

        Ok(stream)
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|err| ErrorKind::DnsResolve {
            message: err.to_string(),
        })?
        // Restrict the literal "localhost" to IPv4; ::1 stalls against servers bound only to
        // 127.0.0.1.
        .filter(|candidate| host != "localhost" || candidate.is_ipv4())
        .collect();

    Ok(candidates)
}

#[cfg(test)]
mod test {
    use std::net::{SocketAddr, TcpListener};

    use super::{resolve, ConnectionEstablisher};
    use crate::{
        error::ErrorKind,
        options::{PoolOptions, ServerAddress},
    };

    #[test]
    fn localhost_resolves_to_ipv4_only() {
        let candidates = resolve("localhost", 27017).unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(SocketAddr::is_ipv4));
    }

    #[test]
    fn refused_connect_surfaces_connection_failure() {
        // Bind then drop to find a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let establisher = ConnectionEstablisher::new(&PoolOptions::default());
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(port),
        };

        let err = establisher.establish(&address).unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::ConnectionFailure { .. }
        ));
    }

    #[test]
    fn establishes_to_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let establisher = ConnectionEstablisher::new(&PoolOptions::default());
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(port),
        };

        let stream = establisher.establish(&address).unwrap();
        assert!(!stream.probably_closed());
    }
}
