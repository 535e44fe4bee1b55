use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config;
use crate::logging::{LogLevel, Logger};
use crate::pools::WorkerPool;
use crate::wire::codec::{
    encode_length_prefixed, take_length_prefixed, CodecConfig, CodecError, Frame, WireCodec,
    FRAME_HEADER_SIZE_BYTES,
};
use crate::wire::session::auth::AuthProtocol;
use crate::wire::session::{FrameSink, SendError, Session};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8787;
const READ_CHUNK_BYTES: usize = 64 * 1024;
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    Accept { source: io::Error },
    ConfigureAcceptedStream { source: io::Error },
    StreamClone { source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for full duplex IO: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// Full-duplex, non-blocking client socket. Writes go out as complete
/// length-prefixed frames.
pub struct PersistentConnection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    max_frame_size_bytes: usize,
    closed: AtomicBool,
}

impl PersistentConnection {
    fn new(
        id: u64,
        stream: TcpStream,
        peer_addr: SocketAddr,
        max_frame_size_bytes: usize,
    ) -> Result<Self, ServerError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            max_frame_size_bytes,
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("connection reader lock poisoned")
            .read(buffer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self
            .reader
            .lock()
            .expect("connection reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("connection writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

impl FrameSink for PersistentConnection {
    fn write_frame(&self, frame: &Frame) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }

        let bytes = encode_length_prefixed(frame.as_bytes(), self.max_frame_size_bytes)
            .map_err(SendError::Encode)?;
        let mut writer = self.writer.lock().expect("connection writer lock poisoned");
        write_all_nonblocking(&mut writer, &bytes).map_err(|source| {
            if source.kind() == io::ErrorKind::WriteZero {
                SendError::Closed
            } else {
                SendError::Io(source)
            }
        })
    }
}

fn write_all_nonblocking(stream: &mut TcpStream, mut bytes: &[u8]) -> io::Result<()> {
    let mut stalled_since: Option<Instant> = None;

    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(written) => {
                bytes = &bytes[written..];
                stalled_since = None;
            }
            Err(source) if source.kind() == io::ErrorKind::Interrupted => {}
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => {
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() > WRITE_STALL_TIMEOUT {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(source) => return Err(source),
        }
    }

    Ok(())
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    max_frame_size_bytes: usize,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig, max_frame_size_bytes: usize) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            max_frame_size_bytes,
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg, app_config.wire.max_frame_size_bytes.max(1))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept_persistent(&self) -> Result<Option<Arc<PersistentConnection>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                let connection =
                    PersistentConnection::new(id, stream, peer_addr, self.max_frame_size_bytes)?;
                Ok(Some(Arc::new(connection)))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }
}

/// Splits a byte stream into length-prefixed frames, keeping partial input
/// between reads.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    max_frame_size_bytes: usize,
}

impl FrameReader {
    pub fn new(max_frame_size_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        Ok(take_length_prefixed(&mut self.buffer, self.max_frame_size_bytes)?.map(Frame::Binary))
    }
}

struct OpenConnection {
    connection: Arc<PersistentConnection>,
    session: Arc<Session>,
    reader: FrameReader,
    // Peer finished sending; close once its submitted requests are answered.
    draining: bool,
}

enum ReadOutcome {
    Idle,
    Progress,
    Closed(String),
}

/// Owns every open connection: accepts, reads frames, hands them to the pool
/// and tears sessions down on disconnect.
pub struct ConnectionManager {
    server: TcpServer,
    pool: Arc<WorkerPool>,
    auth: Arc<AuthProtocol>,
    codec_config: CodecConfig,
    logger: Arc<Logger>,
    connections: HashMap<u64, OpenConnection>,
    read_buffer: Vec<u8>,
}

impl ConnectionManager {
    pub fn new(
        server: TcpServer,
        pool: Arc<WorkerPool>,
        auth: Arc<AuthProtocol>,
        codec_config: CodecConfig,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            server,
            pool,
            auth,
            codec_config,
            logger,
            connections: HashMap::new(),
            read_buffer: vec![0_u8; READ_CHUNK_BYTES.min(codec_config.max_frame_size_bytes + FRAME_HEADER_SIZE_BYTES)],
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accepts pending connections and reads every socket once. Returns
    /// whether anything happened.
    pub fn poll_once(&mut self) -> Result<bool, ServerError> {
        let mut progressed = false;

        while let Some(connection) = self.server.try_accept_persistent()? {
            self.open(connection);
            progressed = true;
        }

        let ids = self.connections.keys().copied().collect::<Vec<_>>();
        for id in ids {
            match self.read_connection(id) {
                ReadOutcome::Idle => {}
                ReadOutcome::Progress => progressed = true,
                ReadOutcome::Closed(reason) => {
                    self.close(id, &reason);
                    progressed = true;
                }
            }
        }

        Ok(progressed)
    }

    pub fn close_all(&mut self) {
        let ids = self.connections.keys().copied().collect::<Vec<_>>();
        for id in ids {
            self.close(id, "server shutdown");
        }
    }

    fn open(&mut self, connection: Arc<PersistentConnection>) {
        let session = Arc::new(Session::new(
            Box::new(WireCodec::new(self.codec_config)),
            connection.clone(),
            self.auth.initial_state(),
        ));
        self.pool.add_session(Arc::clone(&session));

        self.logger.log(
            LogLevel::Info,
            Some("server"),
            "Accepted persistent connection",
            Some(json!({
                "connection_id": connection.id(),
                "session_id": session.id().to_string(),
                "peer_addr": connection.peer_addr().to_string(),
                "authenticated": session.is_authenticated(),
            })),
        );

        if let Some(challenge) = self.auth.on_connect() {
            let mut codec = session.codec_clone();
            if let Err(err) = session.send(codec.as_mut(), &challenge) {
                self.logger.log(
                    LogLevel::Warn,
                    Some("server"),
                    "Failed to send authentication challenge",
                    Some(json!({"connection_id": connection.id(), "error": err.to_string()})),
                );
            }
        }

        self.connections.insert(
            connection.id(),
            OpenConnection {
                connection,
                session,
                reader: FrameReader::new(self.codec_config.max_frame_size_bytes),
                draining: false,
            },
        );
    }

    fn read_connection(&mut self, id: u64) -> ReadOutcome {
        let Some(open) = self.connections.get_mut(&id) else {
            return ReadOutcome::Idle;
        };
        if open.draining {
            return if open.session.in_flight() == 0 {
                ReadOutcome::Closed("peer closed connection".to_owned())
            } else {
                ReadOutcome::Idle
            };
        }

        let mut outcome = ReadOutcome::Idle;
        let mut closed = None;
        let mut peer_done = false;
        loop {
            match open.connection.try_read(&mut self.read_buffer) {
                Ok(0) => {
                    peer_done = true;
                    break;
                }
                Ok(size) => {
                    open.reader.push(&self.read_buffer[..size]);
                    outcome = ReadOutcome::Progress;
                }
                Err(source) if source.kind() == io::ErrorKind::WouldBlock => break,
                Err(source) if source.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => {
                    closed = Some(format!("socket read error: {source}"));
                    break;
                }
            }
        }

        // Frames completed before the peer went away are still served.
        loop {
            match open.reader.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(err) = self.pool.submit(Arc::clone(&open.session), frame) {
                        self.logger.log(
                            LogLevel::Error,
                            Some("server"),
                            "No worker available for frame",
                            Some(json!({"connection_id": id, "error": err.to_string()})),
                        );
                    }
                }
                Ok(None) => break,
                Err(err) => return ReadOutcome::Closed(format!("wire protocol violation: {err}")),
            }
        }

        if let Some(reason) = closed {
            return ReadOutcome::Closed(reason);
        }
        if peer_done {
            if open.session.in_flight() == 0 {
                return ReadOutcome::Closed("peer closed connection".to_owned());
            }
            open.draining = true;
            return ReadOutcome::Progress;
        }
        outcome
    }

    fn close(&mut self, id: u64, reason: &str) {
        let Some(open) = self.connections.remove(&id) else {
            return;
        };

        self.pool.remove_session(open.session.id());
        let _ = open.connection.shutdown();
        self.logger.log(
            LogLevel::Info,
            Some("server"),
            "Closed connection",
            Some(json!({
                "connection_id": id,
                "session_id": open.session.id().to_string(),
                "reason": reason,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{ConnectionManager, FrameReader, ServerConfig, TcpServer, DEFAULT_HOST, DEFAULT_PORT};
    use crate::dispatch::tests::numbers_engine;
    use crate::dispatch::{Dispatcher, RuntimeToggles};
    use crate::logging::tests::memory_logger;
    use crate::logging::LogLevel;
    use crate::pools::WorkerPool;
    use crate::procedures::InMemoryProcedureRegistry;
    use crate::wire::codec::{
        encode_length_prefixed, Codec, CodecConfig, CodecError, Frame, WireCodec,
    };
    use crate::wire::envelope::{Envelope, MessageKind};
    use crate::wire::session::auth::AuthProtocol;

    fn loopback() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
        }
    }

    fn manager() -> (ConnectionManager, Arc<WorkerPool>) {
        let (logger, _) = memory_logger(LogLevel::Error);
        let auth = Arc::new(AuthProtocol::disabled(Arc::clone(&logger)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&auth),
            Arc::new(InMemoryProcedureRegistry::new()),
            numbers_engine(),
            RuntimeToggles::new(Arc::clone(&logger), None),
            Arc::clone(&logger),
        );
        let pool = Arc::new(WorkerPool::new(
            Arc::new(dispatcher),
            Arc::clone(&logger),
            Duration::from_millis(50),
        ));
        pool.activate(2).expect("pool should activate");

        let config = CodecConfig::default();
        let server = TcpServer::bind(&loopback(), config.max_frame_size_bytes).expect("server should bind");
        let manager = ConnectionManager::new(server, Arc::clone(&pool), auth, config, logger);
        (manager, pool)
    }

    fn send(client: &mut TcpStream, envelope: &Envelope) {
        let frame = WireCodec::new(CodecConfig::default())
            .encode(envelope)
            .expect("envelope should encode");
        let bytes = encode_length_prefixed(frame.as_bytes(), 1024).expect("frame should prefix");
        client.write_all(&bytes).expect("client write should succeed");
    }

    fn receive(manager: &mut ConnectionManager, client: &mut TcpStream, count: usize) -> Vec<Envelope> {
        let mut reader = FrameReader::new(1024 * 1024);
        let mut codec = WireCodec::new(CodecConfig::default());
        let mut received = Vec::new();
        let mut buf = [0_u8; 4096];

        for _ in 0..400 {
            manager.poll_once().expect("poll should succeed");
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(size) => reader.push(&buf[..size]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(err) => panic!("client read failed: {err}"),
            }
            while let Some(frame) = reader.next_frame().expect("server frames are valid") {
                received.push(codec.decode(&frame).expect("server frame should decode"));
            }
            if received.len() >= count {
                break;
            }
        }
        received
    }

    fn connect(manager: &ConnectionManager) -> TcpStream {
        let addr = manager.local_addr().expect("local addr should exist");
        let client = TcpStream::connect(addr).expect("client should connect");
        client
            .set_read_timeout(Some(Duration::from_millis(5)))
            .expect("read timeout should apply");
        client
    }

    #[test]
    fn default_config_matches_expected_host_and_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn accept_poll_does_not_block_without_clients() {
        let server = TcpServer::bind(&loopback(), 1024).expect("server should bind");
        assert!(server
            .try_accept_persistent()
            .expect("accept poll should not fail")
            .is_none());
    }

    #[test]
    fn frame_reader_reassembles_split_frames() {
        let mut reader = FrameReader::new(64);
        let bytes = encode_length_prefixed(b"hello", 64).expect("frame should prefix");

        reader.push(&bytes[..3]);
        assert_eq!(reader.next_frame().expect("partial is fine"), None);
        reader.push(&bytes[3..]);
        assert_eq!(
            reader.next_frame().expect("frame complete"),
            Some(Frame::Binary(b"hello".to_vec()))
        );

        reader.push(&[0, 0, 1, 0]);
        assert!(matches!(
            reader.next_frame(),
            Err(CodecError::ProtocolLengthTooLarge { .. })
        ));
    }

    #[test]
    fn multiplexed_requests_are_answered_over_one_connection() {
        let (mut manager, pool) = manager();
        let mut client = connect(&manager);

        send(&mut client, &Envelope::new(1, MessageKind::Ping));
        send(
            &mut client,
            &Envelope::new(2, MessageKind::DirectQuery)
                .with_payload("numbers")
                .with_parameter("size", 2),
        );

        let mut responses = receive(&mut manager, &mut client, 2);
        responses.sort_by_key(|envelope| envelope.id);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], Envelope::pong(1));
        assert_eq!(responses[1].kind, MessageKind::Result);
        assert_eq!(manager.connection_count(), 1);

        drop(client);
        for _ in 0..200 {
            manager.poll_once().expect("poll should succeed");
            if manager.connection_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.connection_count(), 0);
        pool.terminate().expect("pool should terminate");
    }

    #[test]
    fn half_closed_peer_still_gets_replies_before_close() {
        let (mut manager, pool) = manager();
        let mut client = connect(&manager);

        send(&mut client, &Envelope::new(1, MessageKind::Ping));
        send(
            &mut client,
            &Envelope::new(2, MessageKind::DirectQuery)
                .with_payload("numbers")
                .with_parameter("size", 3),
        );
        client
            .shutdown(Shutdown::Write)
            .expect("client half-close should succeed");

        let mut responses = receive(&mut manager, &mut client, 2);
        responses.sort_by_key(|envelope| envelope.id);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0], Envelope::pong(1));
        assert_eq!(responses[1].kind, MessageKind::Result);

        for _ in 0..200 {
            manager.poll_once().expect("poll should succeed");
            if manager.connection_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.connection_count(), 0);
        pool.terminate().expect("pool should terminate");
    }

    #[test]
    fn oversized_frame_closes_connection() {
        let (mut manager, pool) = manager();
        let mut client = connect(&manager);

        client
            .write_all(&u32::MAX.to_be_bytes())
            .expect("client write should succeed");
        for _ in 0..200 {
            manager.poll_once().expect("poll should succeed");
            if manager.connection_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(manager.connection_count(), 0);

        let mut buf = [0_u8; 8];
        let closed = matches!(client.read(&mut buf), Ok(0) | Err(_));
        assert!(closed);
        pool.terminate().expect("pool should terminate");
    }
}
