//! Contains the types needed to describe credentials and to plug in authentication mechanism
//! implementations.
//!
//! The pool itself never speaks an authentication protocol. It tracks which credentials are
//! live on each connection and, at checkout, reconciles that set against the credentials the
//! caller wants by invoking an [`AuthProvider`] for the individual logins and logouts.

use std::{
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, ErrorKind, Result},
    pool::conn::Connection,
};

/// The authentication mechanisms a [`Credential`] can name.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    #[serde(rename = "SCRAM-SHA-1")]
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802)
    /// and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    #[serde(rename = "MONGODB-X509")]
    MongoDbX509,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](https://tools.ietf.org/html/rfc4616).
    /// Since the credentials are stored outside of the database, the "$external" database must
    /// be used for authentication.
    #[serde(rename = "PLAIN")]
    Plain,
}

impl AuthMechanism {
    /// Returns the name of the mechanism as it appears in the server's `saslSupportedMechs`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::MongoDbX509 => "MONGODB-X509",
            AuthMechanism::Plain => "PLAIN",
        }
    }

    /// The database that the mechanism authenticates against by default.
    pub fn default_source(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => "admin",
            AuthMechanism::MongoDbX509 | AuthMechanism::Plain => "$external",
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            "MONGODB-X509" => Ok(AuthMechanism::MongoDbX509),
            "PLAIN" => Ok(AuthMechanism::Plain),
            _ => Err(Error::invalid_argument(format!(
                "invalid mechanism string: {}",
                str
            ))),
        }
    }
}

/// A struct containing authentication information.
///
/// Credential identity, for the purposes of tracking which credentials are authenticated on a
/// connection, is the tuple of source, mechanism, username and a digest of the key material;
/// two credentials that differ only in password are distinct.
#[derive(Clone, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted
    /// when authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to
    /// "admin" in SCRAM authentication mechanisms and "$external" for MONGODB-X509 and PLAIN.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server by the mechanism implementation.
    pub mechanism: Option<AuthMechanism>,
}

impl Credential {
    /// The database this credential authenticates against, falling back to the mechanism's
    /// default when no source was given.
    pub fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or_else(|| {
            self.mechanism
                .as_ref()
                .map(AuthMechanism::default_source)
                .unwrap_or("admin")
        })
    }

    /// A digest of this credential's key material. Folding the password through a hash gives
    /// the identity tuple a fixed-width component and keeps the raw secret out of comparisons.
    fn key_material_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match self.password.as_deref() {
            Some(password) => {
                hasher.update([1u8]);
                hasher.update(password.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().into()
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.source == other.source
            && self.mechanism == other.mechanism
            && self.key_material_hash() == other.key_material_hash()
    }
}

impl Eq for Credential {}

impl Hash for Credential {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.username.hash(state);
        self.source.hash(state);
        self.mechanism.hash(state);
        self.key_material_hash().hash(state);
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential")
            .field(&"REDACTED".to_string())
            .finish()
    }
}

/// The seam through which authentication mechanism implementations are invoked.
///
/// Implementations run whatever command conversation the mechanism requires over the provided
/// connection, typically via [`Connection::command`]. The pool guarantees that `logout` calls
/// for credentials being dropped complete before `authenticate` calls for credentials being
/// added.
pub trait AuthProvider: Send + Sync + 'static {
    /// Log `credential` in on `conn`.
    fn authenticate(&self, credential: &Credential, conn: &mut Connection) -> Result<()>;

    /// Log the principal authenticated against `source` out of `conn`.
    fn logout(&self, source: &str, conn: &mut Connection) -> Result<()>;
}

/// An [`AuthProvider`] for deployments without authentication. Any attempt to authenticate
/// through it fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuth;

impl AuthProvider for NoAuth {
    fn authenticate(&self, _credential: &Credential, _conn: &mut Connection) -> Result<()> {
        Err(ErrorKind::Authentication {
            message: "no authentication mechanisms are configured for this pool".to_string(),
        }
        .into())
    }

    fn logout(&self, _source: &str, _conn: &mut Connection) -> Result<()> {
        Ok(())
    }
}
