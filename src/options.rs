//! Contains the types used to configure a [`ConnectionPool`](crate::ConnectionPool).
//!
//! [`PoolOptions`](struct.PoolOptions.html) uses the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API. For example, to create an instance with only `max_pool_size` and `wait_queue_timeout`
//! set:
//!
//! ```rust
//! # use std::time::Duration;
//! # use mongo_pool::options::PoolOptions;
//! #
//! let options = PoolOptions::builder()
//!     .max_pool_size(Some(25))
//!     .wait_queue_timeout(Some(Duration::from_secs(5)))
//!     .build();
//! ```

use std::{
    fmt,
    hash::{Hash, Hasher},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::Serialize;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    tls::TlsConfig,
};

/// The default TCP port a [`ServerAddress`] connects to.
pub const DEFAULT_PORT: u16 = 27017;

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq, Serialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the server can be found.
        host: String,

        /// The TCP port that the server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
    /// A Unix Domain Socket path.
    #[cfg(unix)]
    Unix {
        /// The path to the Unix Domain Socket.
        path: PathBuf,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => {
                host == other_host
                    && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT)
            }
            #[cfg(unix)]
            (Self::Unix { path }, Self::Unix { path: other_path }) => path == other_path,
            #[cfg(unix)]
            _ => false,
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
            #[cfg(unix)]
            Self::Unix { path } => path.hash(state),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        if address.ends_with(".sock") {
            #[cfg(unix)]
            {
                return Ok(ServerAddress::Unix {
                    path: PathBuf::from(address),
                });
            }
            #[cfg(not(unix))]
            {
                return Err(Error::connection_failure(
                    "UNIX-sockets are not supported on this system",
                ));
            }
        }
        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) => {
                if part.is_empty() {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{}\"; hostname cannot be empty",
                        address
                    )));
                }
                part
            }
            None => {
                return Err(Error::invalid_argument(format!(
                    "invalid server address: \"{}\"",
                    address
                )))
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| {
                    Error::invalid_argument(format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ))
                })?;

                if port == 0 {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address: \"{}\"; port must be non-zero",
                        address
                    )));
                }
                if parts.next().is_some() {
                    return Err(Error::invalid_argument(format!(
                        "address \"{}\" contains more than one unescaped ':'",
                        address
                    )));
                }

                Some(port)
            }
            None => None,
        };

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    /// The original (pre-resolution) hostname of this address. Peer certificates are verified
    /// against this name, not any CNAME or resolved address.
    pub fn host(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Self::Tcp { host, .. } => std::borrow::Cow::Borrowed(host.as_str()),
            #[cfg(unix)]
            Self::Unix { path } => path.to_string_lossy(),
        }
    }

    /// The port of this address, when it has one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
            #[cfg(unix)]
            Self::Unix { .. } => None,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
            #[cfg(unix)]
            Self::Unix { path } => write!(fmt, "{}", path.display()),
        }
    }
}

/// Options used to configure a [`ConnectionPool`](crate::ConnectionPool). Immutable once the
/// pool is constructed.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct PoolOptions {
    /// The maximum number of connections that the pool can have at a given time, including
    /// connections which are currently checked out of the pool. `None` means the pool places
    /// no bound on concurrent checkouts or idle retention.
    ///
    /// The default is 100.
    #[builder(default = Some(DEFAULT_MAX_POOL_SIZE))]
    pub max_pool_size: Option<u32>,

    /// How long a connection can take to be opened before timing out.
    pub connect_timeout: Option<Duration>,

    /// How long a send or receive on a socket can take before timing out.
    pub socket_timeout: Option<Duration>,

    /// If a checkout operation takes longer than `wait_queue_timeout`, the pool will return an
    /// error. If `wait_queue_timeout` is `None`, then the checkout operation will not time out.
    pub wait_queue_timeout: Option<Duration>,

    /// Multiplied by `max_pool_size` to give the number of threads allowed to wait for a
    /// connection at one time. No cap is applied unless both values are present.
    pub wait_queue_multiple: Option<u32>,

    /// TLS configuration for the pool's connections. When present, every connection performs a
    /// TLS handshake after connecting, verifying the peer against the pre-resolution hostname.
    pub tls_config: Option<TlsConfig>,

    /// Whether to enable `SO_KEEPALIVE` on the pool's sockets.
    pub socket_keepalive: bool,

    /// How often a pooled idle connection is probed for remote closure when it is checked out
    /// again. `Some(Duration::ZERO)` probes on every reacquisition; `None` never probes.
    ///
    /// The default is 1 second.
    #[builder(default = Some(DEFAULT_CHECK_INTERVAL))]
    pub check_interval: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolOptions {
    /// The waiter cap, present only when both `max_pool_size` and `wait_queue_multiple` are.
    pub(crate) fn max_waiters(&self) -> Option<u32> {
        match (self.max_pool_size, self.wait_queue_multiple) {
            (Some(size), Some(multiple)) => Some(size.saturating_mul(multiple)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_hostname_and_port() {
        let address = ServerAddress::parse("db.example.com:12345").unwrap();
        assert_eq!(
            address,
            ServerAddress::Tcp {
                host: "db.example.com".to_string(),
                port: Some(12345),
            }
        );
    }

    #[test]
    fn parse_default_port() {
        let address = ServerAddress::parse("db.example.com").unwrap();
        assert_eq!(address.port(), None);
        assert_eq!(address.to_string(), "db.example.com:27017");
    }

    #[cfg(unix)]
    #[test]
    fn parse_unix_socket_path() {
        let address = ServerAddress::parse("/var/run/mongodb.sock").unwrap();
        match address {
            ServerAddress::Unix { ref path } => {
                assert_eq!(path.to_str().unwrap(), "/var/run/mongodb.sock")
            }
            _ => panic!("expected unix address, got {:?}", address),
        }
    }

    #[test]
    fn parse_rejects_bad_ports() {
        assert!(ServerAddress::parse("host:0").is_err());
        assert!(ServerAddress::parse("host:notaport").is_err());
        assert!(ServerAddress::parse("host:123:456").is_err());
        assert!(ServerAddress::parse(":123").is_err());
    }

    #[test]
    fn waiter_cap_requires_both_options() {
        let options = PoolOptions::builder()
            .max_pool_size(Some(10))
            .wait_queue_multiple(Some(5))
            .build();
        assert_eq!(options.max_waiters(), Some(50));

        let options = PoolOptions::builder().wait_queue_multiple(Some(5)).build();
        assert_eq!(options.max_pool_size, Some(100));
        assert_eq!(options.max_waiters(), Some(500));

        let options = PoolOptions::builder()
            .max_pool_size(None)
            .wait_queue_multiple(Some(5))
            .build();
        assert_eq!(options.max_waiters(), None);
    }
}
