#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

pub use ::bson;

pub mod auth;
pub mod error;
pub mod options;
mod pool;
pub mod tls;

pub use crate::{
    auth::{AuthMechanism, AuthProvider, Credential, NoAuth},
    error::{CommandError, Error, ErrorKind, Result},
    options::{PoolOptions, ServerAddress},
    pool::{conn::Connection, ConnectionPool, PooledConnection},
    tls::TlsConfig,
};

#[doc(inline)]
pub use crate::pool::conn::wire;
