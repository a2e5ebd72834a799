mod command;
pub(crate) mod pooled;
pub(crate) mod stream;
pub mod wire;

#[cfg(test)]
pub(crate) mod test;

use std::{
    collections::{HashMap, HashSet},
    io::{self, Read, Write},
    sync::Arc,
    time::Instant,
};

use bson::Document;
use derive_where::derive_where;

use self::{
    stream::Stream,
    wire::{Header, OpCode, Query, QueryFlags, Reply},
};
use crate::{
    auth::{AuthProvider, Credential},
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};

const MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// A wrapper around a stream that contains all the metadata needed to maintain a pooled
/// connection: the generation it was minted at, the credentials currently authenticated on it,
/// the wire version window negotiated by the caller, and whether it has been closed.
#[derive_where(Debug)]
pub struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The pool's generation when this connection was created. The pool closes connections
    /// whose generation lags its own.
    pub(crate) generation: u32,

    /// Marks the time when the connection was last checked out of the pool. Used to decide
    /// whether the liveness probe is due on reacquisition.
    pub(crate) last_checkout: Instant,

    stream: Stream,

    /// The credentials currently authenticated on this stream.
    auth_set: HashSet<Credential>,

    /// `(min, max)` wire versions supported by the server, set by the caller at checkout.
    wire_version_range: Option<(i32, i32)>,

    closed: bool,

    #[derive_where(skip)]
    auth_provider: Arc<dyn AuthProvider>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        address: ServerAddress,
        generation: u32,
        stream: Stream,
        auth_provider: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            id,
            address,
            generation,
            last_checkout: Instant::now(),
            stream,
            auth_set: HashSet::new(),
            wire_version_range: None,
            closed: false,
            auth_provider,
        }
    }

    /// The driver-generated ID for this connection, unique within its pool.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Whether this connection has been closed. Closed connections are discarded rather than
    /// returned to the pool.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Execute a command against the `<dbname>.$cmd` namespace and return the server's reply
    /// document. Replies with a non-ok status are surfaced as command errors.
    pub fn command(&mut self, dbname: &str, spec: Document) -> Result<Document> {
        let namespace = format!("{}.$cmd", dbname);
        let query = Query {
            flags: QueryFlags::empty(),
            namespace: namespace.clone(),
            number_to_skip: 0,
            number_to_return: -1,
            body: spec,
        };

        let (request_id, message) = query.encode()?;
        self.send_message(&message)?;
        let payload = self.receive_message(OpCode::Reply, request_id)?;

        let reply = Reply::parse(&payload)?;
        let response = reply.documents.into_iter().next().ok_or_else(|| {
            Error::from(ErrorKind::InvalidResponse {
                message: "no response received from server".into(),
            })
        })?;

        command::check_command_response(&response, &namespace)?;
        Ok(response)
    }

    /// Send a raw, already length-prefixed message.
    ///
    /// If a network error occurs, the connection is closed before the error is returned.
    pub fn send_message(&mut self, message: &[u8]) -> Result<()> {
        if let Err(err) = self
            .stream
            .write_all(message)
            .and_then(|()| self.stream.flush())
        {
            self.close();
            return Err(err.into());
        }

        Ok(())
    }

    /// Receive a raw message, returning its payload (the bytes after the 16-byte header).
    ///
    /// The header's opcode must equal `operation`, and when `request_id` is supplied the
    /// header's response-to field must equal it; either mismatch means the stream has
    /// desynchronized and aborts the connection. Pass no `request_id` for exhaust cursor
    /// replies, which do not echo one.
    ///
    /// If any error occurs, the connection is closed before the error is returned.
    pub fn receive_message(
        &mut self,
        operation: OpCode,
        request_id: impl Into<Option<i32>>,
    ) -> Result<Vec<u8>> {
        match self.read_frame(operation, request_id.into()) {
            Ok(payload) => Ok(payload),
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    fn read_frame(&mut self, operation: OpCode, request_id: Option<i32>) -> Result<Vec<u8>> {
        let mut header_bytes = [0u8; Header::LENGTH];
        self.read_exact(&mut header_bytes)?;
        let header = Header::from_slice(&header_bytes)?;

        // No request id for exhaust cursor replies.
        if let Some(expected) = request_id {
            if header.response_to != expected {
                return Err(ErrorKind::InvalidResponse {
                    message: format!(
                        "ids don't match: expected a reply to {}, got a reply to {}",
                        expected, header.response_to
                    ),
                }
                .into());
            }
        }

        if header.op_code != operation {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected {:?} in reply, got {:?}",
                    operation, header.op_code
                ),
            }
            .into());
        }

        if header.length < Header::LENGTH as i32 || header.length > MAX_MESSAGE_SIZE_BYTES {
            return Err(ErrorKind::InvalidResponse {
                message: format!("invalid message length: {}", header.length),
            }
            .into());
        }

        let mut payload = vec![0u8; header.length as usize - Header::LENGTH];
        self.read_exact(&mut payload)?;

        Ok(payload)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                Error::auto_reconnect()
            } else {
                err.into()
            }
        })
    }

    /// Update this connection's authentication to match `all_credentials`, a map from auth
    /// source to credential. Credentials that are authenticated but no longer desired are
    /// logged out first; missing ones are then logged in. A failure part way through leaves
    /// the completed changes recorded and propagates.
    pub fn check_auth(&mut self, all_credentials: &HashMap<String, Credential>) -> Result<()> {
        if all_credentials.is_empty() && self.auth_set.is_empty() {
            return Ok(());
        }

        let cached: HashSet<Credential> = all_credentials.values().cloned().collect();
        let provider = Arc::clone(&self.auth_provider);

        let to_logout: Vec<Credential> = self.auth_set.difference(&cached).cloned().collect();
        for credential in to_logout {
            provider.logout(credential.resolved_source(), self)?;
            self.auth_set.remove(&credential);
        }

        let to_login: Vec<Credential> = cached
            .into_iter()
            .filter(|credential| !self.auth_set.contains(credential))
            .collect();
        for credential in to_login {
            provider.authenticate(&credential, self)?;
            self.auth_set.insert(credential);
        }

        Ok(())
    }

    /// Log in to the server and record `credential` as authenticated on this connection.
    pub fn authenticate(&mut self, credential: &Credential) -> Result<()> {
        let provider = Arc::clone(&self.auth_provider);
        provider.authenticate(credential, self)?;
        self.auth_set.insert(credential.clone());

        Ok(())
    }

    /// Record the wire version window negotiated with the server. Must be called before any
    /// authentication code queries the window.
    pub fn set_wire_version_range(&mut self, min_wire_version: i32, max_wire_version: i32) {
        self.wire_version_range = Some((min_wire_version, max_wire_version));
    }

    /// The minimum wire version the server supports.
    pub fn min_wire_version(&self) -> Result<i32> {
        self.wire_version_range
            .map(|(min, _)| min)
            .ok_or_else(|| Error::internal("connection checked out but wire version not recorded"))
    }

    /// The maximum wire version the server supports.
    pub fn max_wire_version(&self) -> Result<i32> {
        self.wire_version_range
            .map(|(_, max)| max)
            .ok_or_else(|| Error::internal("connection checked out but wire version not recorded"))
    }

    /// Close this connection. Idempotent; shutdown errors are swallowed since the socket may
    /// already be gone.
    pub fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown();
    }

    pub(crate) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.last_checkout = Instant::now();
    }

    pub(crate) fn stream_probably_closed(&self) -> bool {
        self.stream.probably_closed()
    }

    #[cfg(test)]
    pub(crate) fn auth_set(&self) -> &HashSet<Credential> {
        &self.auth_set
    }
}
