use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{Arc, Mutex},
    thread,
};

use bson::doc;
use byteorder::{LittleEndian, WriteBytesExt};

use super::{
    stream::Stream,
    wire::{Header, OpCode},
    Connection,
};
use crate::{
    auth::{AuthProvider, Credential, NoAuth},
    error::{ErrorKind, Result},
    options::ServerAddress,
};

/// Spawns a listener whose single accepted socket is handed to `server`, and returns a
/// `Connection` to it.
fn connection_to(server: impl FnOnce(TcpStream) + Send + 'static) -> Connection {
    connection_with_provider(server, Arc::new(NoAuth))
}

fn connection_with_provider(
    server: impl FnOnce(TcpStream) + Send + 'static,
    provider: Arc<dyn AuthProvider>,
) -> Connection {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server(stream);
    });

    let tcp_stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let address = ServerAddress::Tcp {
        host: "127.0.0.1".to_string(),
        port: Some(port),
    };

    Connection::new(1, address, 0, Stream::Tcp(tcp_stream), provider)
}

fn frame(request_id: i32, response_to: i32, op_code: OpCode, body: &[u8]) -> Vec<u8> {
    let header = Header {
        length: (Header::LENGTH + body.len()) as i32,
        request_id,
        response_to,
        op_code,
    };

    let mut bytes = Vec::new();
    header.write_to(&mut bytes).unwrap();
    bytes.extend_from_slice(body);
    bytes
}

#[test]
fn receive_returns_correlated_payload() {
    let mut conn = connection_to(|mut stream| {
        stream
            .write_all(&frame(0, 7, OpCode::Reply, &[0xAA; 16]))
            .unwrap();
    });

    let payload = conn.receive_message(OpCode::Reply, 7).unwrap();
    assert_eq!(payload, vec![0xAA; 16]);
    assert!(!conn.is_closed());
}

#[test]
fn receive_aborts_on_request_id_mismatch() {
    let mut conn = connection_to(|mut stream| {
        stream
            .write_all(&frame(0, 7, OpCode::Reply, &[0xAA; 16]))
            .unwrap();
    });

    let err = conn.receive_message(OpCode::Reply, 8).unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::InvalidResponse { .. }
    ));
    assert!(conn.is_closed());
}

#[test]
fn receive_aborts_on_opcode_mismatch() {
    let mut conn = connection_to(|mut stream| {
        stream
            .write_all(&frame(0, 7, OpCode::Reply, &[0xAA; 16]))
            .unwrap();
    });

    let err = conn.receive_message(OpCode::Message, 7).unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::InvalidResponse { .. }
    ));
    assert!(conn.is_closed());
}

#[test]
fn exhaust_replies_skip_id_correlation() {
    let mut conn = connection_to(|mut stream| {
        stream
            .write_all(&frame(0, 999, OpCode::Reply, &[0xBB; 4]))
            .unwrap();
    });

    let payload = conn.receive_message(OpCode::Reply, None).unwrap();
    assert_eq!(payload, vec![0xBB; 4]);
}

#[test]
fn short_read_surfaces_auto_reconnect() {
    let mut conn = connection_to(|mut stream| {
        // Half a header, then a close.
        stream.write_all(&[0u8; 8]).unwrap();
    });

    let err = conn.receive_message(OpCode::Reply, 7).unwrap_err();
    assert!(matches!(err.kind.as_ref(), ErrorKind::AutoReconnect { .. }));
    assert!(conn.is_closed());
}

#[test]
fn close_is_idempotent() {
    let mut conn = connection_to(|_stream| {});
    conn.close();
    assert!(conn.is_closed());
    conn.close();
    assert!(conn.is_closed());
}

#[test]
fn wire_version_read_before_set_is_an_error() {
    let mut conn = connection_to(|_stream| {});

    assert!(matches!(
        conn.min_wire_version().unwrap_err().kind.as_ref(),
        ErrorKind::Internal { .. }
    ));

    conn.set_wire_version_range(6, 21);
    assert_eq!(conn.min_wire_version().unwrap(), 6);
    assert_eq!(conn.max_wire_version().unwrap(), 21);
}

#[test]
fn command_round_trip() {
    let mut conn = connection_to(|mut stream| {
        // Read the query frame and echo a single-document ok reply correlated to it.
        let mut header_bytes = [0u8; Header::LENGTH];
        stream.read_exact(&mut header_bytes).unwrap();
        let header = Header::from_slice(&header_bytes).unwrap();
        let mut rest = vec![0u8; header.length as usize - Header::LENGTH];
        stream.read_exact(&mut rest).unwrap();
        assert_eq!(header.op_code, OpCode::Query);

        let mut reply_body = Vec::new();
        reply_body.write_u32::<LittleEndian>(0).unwrap();
        reply_body.write_i64::<LittleEndian>(0).unwrap();
        reply_body.write_i32::<LittleEndian>(0).unwrap();
        reply_body.write_i32::<LittleEndian>(1).unwrap();
        doc! { "ok": 1.0, "version": "7.0.0" }
            .to_writer(&mut reply_body)
            .unwrap();

        stream
            .write_all(&frame(0, header.request_id, OpCode::Reply, &reply_body))
            .unwrap();
    });

    let response = conn.command("admin", doc! { "buildInfo": 1 }).unwrap();
    assert_eq!(response.get_str("version").unwrap(), "7.0.0");
    assert!(!conn.is_closed());
}

#[test]
fn command_surfaces_server_errors() {
    let mut conn = connection_to(|mut stream| {
        let mut header_bytes = [0u8; Header::LENGTH];
        stream.read_exact(&mut header_bytes).unwrap();
        let header = Header::from_slice(&header_bytes).unwrap();
        let mut rest = vec![0u8; header.length as usize - Header::LENGTH];
        stream.read_exact(&mut rest).unwrap();

        let mut reply_body = Vec::new();
        reply_body.write_u32::<LittleEndian>(0).unwrap();
        reply_body.write_i64::<LittleEndian>(0).unwrap();
        reply_body.write_i32::<LittleEndian>(0).unwrap();
        reply_body.write_i32::<LittleEndian>(1).unwrap();
        doc! { "ok": 0.0, "code": 59, "codeName": "CommandNotFound", "errmsg": "no such command" }
            .to_writer(&mut reply_body)
            .unwrap();

        stream
            .write_all(&frame(0, header.request_id, OpCode::Reply, &reply_body))
            .unwrap();
    });

    let err = conn.command("admin", doc! { "bogus": 1 }).unwrap_err();
    match err.kind.as_ref() {
        ErrorKind::Command(command_err) => assert_eq!(command_err.code, 59),
        other => panic!("expected command error, got {:?}", other),
    }
}

/// An `AuthProvider` that records the sequence of calls made through it.
#[derive(Debug, Default)]
pub(crate) struct RecordingAuth {
    calls: Mutex<Vec<String>>,
    fail_logins_for: Mutex<Option<String>>,
}

impl RecordingAuth {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub(crate) fn fail_logins_for(&self, username: &str) {
        *self.fail_logins_for.lock().unwrap() = Some(username.to_string());
    }
}

impl AuthProvider for RecordingAuth {
    fn authenticate(&self, credential: &Credential, _conn: &mut Connection) -> Result<()> {
        let username = credential.username.as_deref().unwrap_or("");
        if self.fail_logins_for.lock().unwrap().as_deref() == Some(username) {
            return Err(ErrorKind::Authentication {
                message: format!("SCRAM failure: login rejected for {}", username),
            }
            .into());
        }

        self.calls.lock().unwrap().push(format!(
            "login:{}@{}",
            username,
            credential.resolved_source()
        ));
        Ok(())
    }

    fn logout(&self, source: &str, _conn: &mut Connection) -> Result<()> {
        self.calls.lock().unwrap().push(format!("logout:{}", source));
        Ok(())
    }
}

pub(crate) fn credential(username: &str, source: &str) -> Credential {
    Credential::builder()
        .username(Some(username.to_string()))
        .source(Some(source.to_string()))
        .password(Some(format!("{}-secret", username)))
        .build()
}

pub(crate) fn credential_map(credentials: &[Credential]) -> HashMap<String, Credential> {
    credentials
        .iter()
        .map(|credential| (credential.resolved_source().to_string(), credential.clone()))
        .collect()
}

#[test]
fn check_auth_with_nothing_desired_is_a_noop() {
    let provider = Arc::new(RecordingAuth::default());
    let mut conn = connection_with_provider(|_stream| {}, provider.clone());

    conn.check_auth(&HashMap::new()).unwrap();
    assert!(provider.calls().is_empty());
}

#[test]
fn check_auth_applies_the_differential() {
    let provider = Arc::new(RecordingAuth::default());
    let mut conn = connection_with_provider(|_stream| {}, provider.clone());

    let first = credential("app", "admin");
    let second = credential("reporter", "reporting");

    conn.check_auth(&credential_map(&[first.clone()])).unwrap();
    assert_eq!(provider.calls(), vec!["login:app@admin"]);
    provider.clear_calls();

    conn.check_auth(&credential_map(&[second.clone()])).unwrap();
    assert_eq!(
        provider.calls(),
        vec!["logout:admin", "login:reporter@reporting"]
    );
    assert_eq!(conn.auth_set().len(), 1);
    assert!(conn.auth_set().contains(&second));
    assert!(!conn.auth_set().contains(&first));
}

#[test]
fn check_auth_is_idempotent() {
    let provider = Arc::new(RecordingAuth::default());
    let mut conn = connection_with_provider(|_stream| {}, provider.clone());

    let desired = credential_map(&[credential("app", "admin")]);
    conn.check_auth(&desired).unwrap();
    provider.clear_calls();

    conn.check_auth(&desired).unwrap();
    assert!(provider.calls().is_empty());
}

#[test]
fn check_auth_failure_keeps_completed_changes() {
    let provider = Arc::new(RecordingAuth::default());
    let mut conn = connection_with_provider(|_stream| {}, provider.clone());

    let original = credential("app", "admin");
    conn.check_auth(&credential_map(&[original.clone()])).unwrap();

    provider.fail_logins_for("reporter");
    let replacement = credential("reporter", "reporting");
    let err = conn
        .check_auth(&credential_map(&[replacement.clone()]))
        .unwrap_err();
    assert!(err.is_auth_error());

    // The logout completed before the failed login; neither credential remains recorded.
    assert!(conn.auth_set().is_empty());
}
