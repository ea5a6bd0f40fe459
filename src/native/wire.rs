//! Pure-Rust native handle.
//!
//! [`WireHandle`] drives the v3 startup and authentication exchange over a
//! non-blocking `socket2` socket. Every call to
//! [`connect_poll`](NativeHandle::connect_poll) performs I/O until the socket
//! would block, then reports which readiness it needs next.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsFd, BorrowedFd};

use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::auth::{md5_password, ScramSha256, SCRAM_SHA_256};
use super::config::PgConfig;
use super::protocol::{
    error_text, BackendMessage, FrontendMessage, PasswordMessage, SaslInitialResponseMessage,
    SaslResponseMessage, StartupMessage, TerminateMessage, TransactionStatus,
};
use super::{ConnStatus, Dialer, NativeHandle, PollingStatus};

const READ_CHUNK: usize = 8192;

/// Dials sessions as [`WireHandle`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireDialer;

impl Dialer for WireDialer {
    type Handle = WireHandle;

    fn connect_start(&self, conninfo: &str) -> Option<WireHandle> {
        Some(WireHandle::start(conninfo))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Non-blocking connect in flight
    Connecting,
    /// Output queued
    Flushing,
    /// Waiting for backend messages
    Reading,
    Established,
    Failed,
}

/// One backend session established without blocking.
pub struct WireHandle {
    socket: Option<Socket>,
    config: Option<PgConfig>,
    phase: Phase,
    status: ConnStatus,
    out: BytesMut,
    input: BytesMut,
    scram: Option<ScramSha256>,
    parameters: HashMap<String, String>,
    backend_pid: i32,
    secret_key: i32,
    transaction_status: TransactionStatus,
    error: Option<String>,
}

impl WireHandle {
    /// Parse `conninfo` and start a non-blocking connect.
    ///
    /// Host names are resolved synchronously, as libpq does. Any failure
    /// yields a handle with [`ConnStatus::Bad`].
    pub fn start(conninfo: &str) -> Self {
        let mut handle = Self {
            socket: None,
            config: None,
            phase: Phase::Connecting,
            status: ConnStatus::Started,
            out: BytesMut::new(),
            input: BytesMut::with_capacity(READ_CHUNK),
            scram: None,
            parameters: HashMap::new(),
            backend_pid: 0,
            secret_key: 0,
            transaction_status: TransactionStatus::Idle,
            error: None,
        };

        let config = match PgConfig::parse(conninfo) {
            Ok(config) => config,
            Err(e) => {
                handle.fail(e.to_string());
                return handle;
            }
        };

        match open_socket(&config) {
            Ok(socket) => handle.socket = Some(socket),
            Err(message) => handle.fail(message),
        }
        handle.config = Some(config);
        handle
    }

    /// Server parameter reported during startup, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Key for cancel requests against this backend.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    fn fail(&mut self, message: String) {
        tracing::debug!(error = %message, "connection attempt failed");
        self.status = ConnStatus::Bad;
        self.phase = Phase::Failed;
        self.error = Some(format!("{}\n", message));
    }

    fn queue<M: FrontendMessage>(&mut self, msg: &M) {
        self.out.extend_from_slice(&msg.encode());
        self.phase = Phase::Flushing;
    }

    fn step(&mut self) -> Result<PollingStatus, String> {
        loop {
            match self.phase {
                Phase::Connecting => {
                    let socket = self.socket.as_ref().ok_or_else(no_socket)?;
                    if let Some(err) = socket.take_error().map_err(connect_error)? {
                        return Err(connect_error(err));
                    }
                    match socket.peer_addr() {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                            return Ok(PollingStatus::Writing)
                        }
                        Err(e) => return Err(connect_error(e)),
                    }

                    self.status = ConnStatus::Made;
                    let startup = self.startup_message()?;
                    self.queue(&startup);
                }
                Phase::Flushing => {
                    let socket = self.socket.as_mut().ok_or_else(no_socket)?;
                    while !self.out.is_empty() {
                        match socket.write(&self.out) {
                            Ok(0) => return Err(closed()),
                            Ok(n) => self.out.advance(n),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                return Ok(PollingStatus::Writing)
                            }
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(e) => return Err(format!("could not send data to server: {}", e)),
                        }
                    }
                    if self.status == ConnStatus::Made {
                        self.status = ConnStatus::AwaitingResponse;
                    }
                    self.phase = Phase::Reading;
                }
                Phase::Reading => {
                    while self.phase == Phase::Reading {
                        let Some(len) =
                            BackendMessage::frame_len(&self.input).map_err(|e| e.to_string())?
                        else {
                            break;
                        };
                        let mut frame = self.input.split_to(len).freeze();
                        let msg = BackendMessage::decode(&mut frame).map_err(|e| e.to_string())?;
                        self.handle_message(msg)?;
                    }
                    if self.phase != Phase::Reading {
                        continue;
                    }

                    let socket = self.socket.as_mut().ok_or_else(no_socket)?;
                    let mut chunk = [0u8; READ_CHUNK];
                    match socket.read(&mut chunk) {
                        Ok(0) => return Err(closed()),
                        Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok(PollingStatus::Reading)
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            return Err(format!("could not receive data from server: {}", e))
                        }
                    }
                }
                Phase::Established => return Ok(PollingStatus::Ok),
                Phase::Failed => return Ok(PollingStatus::Failed),
            }
        }
    }

    fn startup_message(&self) -> Result<StartupMessage, String> {
        let config = self.config.as_ref().ok_or_else(no_socket)?;
        Ok(StartupMessage {
            user: config.user.clone(),
            database: Some(config.dbname.clone()),
            options: config
                .application_name
                .as_ref()
                .map(|name| vec![("application_name".to_string(), name.clone())])
                .unwrap_or_default(),
        })
    }

    fn password(&self) -> Result<(&str, &str), String> {
        let config = self.config.as_ref().ok_or_else(no_socket)?;
        let password = config
            .password
            .as_deref()
            .ok_or_else(|| "fe_sendauth: no password supplied".to_string())?;
        Ok((config.user.as_str(), password))
    }

    fn handle_message(&mut self, msg: BackendMessage) -> Result<(), String> {
        match msg {
            BackendMessage::AuthenticationOk => {
                self.status = ConnStatus::AuthOk;
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let (_, password) = self.password()?;
                let msg = PasswordMessage {
                    password: password.to_string(),
                };
                self.queue(&msg);
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let (user, password) = self.password()?;
                let msg = PasswordMessage {
                    password: md5_password(user, password, &salt),
                };
                self.queue(&msg);
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(format!(
                        "none of the server's SASL authentication mechanisms are supported: {:?}",
                        mechanisms
                    ));
                }
                let (user, password) = self.password()?;
                let scram = ScramSha256::new(user, password);
                let msg = SaslInitialResponseMessage {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data: scram.client_first_message(),
                };
                self.scram = Some(scram);
                self.queue(&msg);
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let scram = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| "unexpected SASL challenge".to_string())?;
                let data = scram
                    .process_server_first(&data)
                    .map_err(|e| format!("SCRAM authentication failed: {}", e))?;
                self.queue(&SaslResponseMessage { data });
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let scram = self
                    .scram
                    .take()
                    .ok_or_else(|| "unexpected SASL completion".to_string())?;
                scram
                    .verify_server_final(&data)
                    .map_err(|e| format!("SCRAM authentication failed: {}", e))?;
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                self.backend_pid = process_id;
                self.secret_key = secret_key;
            }
            BackendMessage::NoticeResponse { fields } => {
                tracing::debug!(notice = %error_text(&fields), "server notice during startup");
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                self.status = ConnStatus::Ok;
                self.phase = Phase::Established;
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(error_text(&fields));
            }
            BackendMessage::Other { tag } => {
                tracing::trace!(tag = %(tag as char), "ignoring message during startup");
            }
        }
        Ok(())
    }
}

impl NativeHandle for WireHandle {
    fn status(&self) -> ConnStatus {
        self.status
    }

    fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(|s| s.as_fd())
    }

    fn connect_poll(&mut self) -> PollingStatus {
        match self.step() {
            Ok(status) => status,
            Err(message) => {
                self.fail(message);
                PollingStatus::Failed
            }
        }
    }
}

impl Drop for WireHandle {
    fn drop(&mut self) {
        if self.phase == Phase::Established {
            if let Some(socket) = self.socket.as_mut() {
                // Best effort; the socket is closed right after either way.
                let _ = socket.write(&TerminateMessage.encode());
            }
        }
    }
}

impl std::fmt::Debug for WireHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireHandle")
            .field("status", &self.status)
            .field("phase", &self.phase)
            .field("backend_pid", &self.backend_pid)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Open a non-blocking socket and start connecting it.
fn open_socket(config: &PgConfig) -> Result<Socket, String> {
    let (socket, addr) = if config.is_unix_socket() {
        let path = format!("{}/.s.PGSQL.{}", config.host.trim_end_matches('/'), config.port);
        let addr = SockAddr::unix(&path)
            .map_err(|e| format!("invalid socket path \"{}\": {}", path, e))?;
        let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(socket_error)?;
        (socket, addr)
    } else {
        let addr = resolve(&config.host, config.port)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(socket_error)?;
        socket.set_nodelay(true).map_err(socket_error)?;
        (socket, SockAddr::from(addr))
    };

    socket.set_nonblocking(true).map_err(socket_error)?;
    match socket.connect(&addr) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {}
        Err(e) => return Err(connect_error(e)),
    }
    Ok(socket)
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("could not translate host name \"{}\" to address: {}", host, e))?
        .next()
        .ok_or_else(|| format!("could not translate host name \"{}\" to address", host))
}

fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

fn socket_error(e: io::Error) -> String {
    format!("could not create socket: {}", e)
}

fn connect_error(e: io::Error) -> String {
    format!("could not connect to server: {}", e)
}

fn no_socket() -> String {
    "no connection to the server".to_string()
}

fn closed() -> String {
    "server closed the connection unexpectedly".to_string()
}
