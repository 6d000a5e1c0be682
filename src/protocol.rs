//! Wire protocol spoken between the master, workers, relays, and discovery.
//!
//! Every message is a single `\n`-terminated line, optionally followed by a
//! byte payload whose length is declared on the line. The first field of
//! every line is `TOKEN=<hex>`; a client presenting the wrong token gets a
//! single `WRONG RUN` reply and the connection is closed. Bodies are JSON,
//! which keeps them self-delimiting on the command line and length-checkable
//! for payloads.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Version stamped into every serialized [`WorkerRecord`]. Decoders reject
/// records carrying any other value.
pub const WIRE_VERSION: u32 = 1;

/// Reply sent to clients presenting a token from a different run.
pub const WRONG_RUN: &str = "WRONG RUN";

/// `POP` reply body telling a worker to hold on and ask again.
pub const WAIT_SENTINEL: &str = "WAIT";

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while speaking the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed command line: {0:?}")]
    Malformed(String),

    #[error("unsupported record version {0}, expected {WIRE_VERSION}")]
    Version(u32),

    #[error("peer answered WRONG RUN")]
    WrongRun,

    #[error("unexpected reply: {0:?}")]
    UnexpectedReply(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a test suite: a name unique within the file that defines it.
///
/// The pair is the queue element and the unit of dispatch. The master never
/// learns anything else about a suite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SuiteId {
    pub name: String,
    pub path: PathBuf,
}

impl SuiteId {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Outcome of a single suite execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteOutcome {
    Passed,
    Failed,
    /// The suite could not be executed at all (missing file, spawn failure).
    Error,
}

impl SuiteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SuiteOutcome::Passed)
    }
}

/// Result of running one suite, as recorded by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub id: SuiteId,
    pub outcome: SuiteOutcome,
    pub duration_seconds: f64,
    /// Framework-specific failure output, carried as an opaque blob.
    pub detail: Option<String>,
}

/// A worker's lifetime record: created at spawn, finalized at reap, and
/// forwarded over the wire by remote masters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub schema_version: u32,
    pub num: usize,
    pub pid: u32,
    pub host: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_status: i32,
    pub captured_output: String,
    pub summary: Option<String>,
    pub failure_output: Option<String>,
    pub suites_run: Vec<SuiteResult>,
}

impl WorkerRecord {
    pub fn new(num: usize, pid: u32, host: impl Into<String>) -> Self {
        Self {
            schema_version: WIRE_VERSION,
            num,
            pid,
            host: host.into(),
            start_time: Utc::now(),
            end_time: None,
            exit_status: 0,
            captured_output: String::new(),
            summary: None,
            failure_output: None,
            suites_run: Vec::new(),
        }
    }

    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let record: WorkerRecord = serde_json::from_slice(bytes)?;
        if record.schema_version != WIRE_VERSION {
            return Err(ProtocolError::Version(record.schema_version));
        }
        Ok(record)
    }
}

/// Per-run random identifier prefixed to every wire message.
///
/// Guards against crosstalk from a previous or concurrent run on the same
/// endpoint, nothing more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunToken(String);

impl RunToken {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self(format!("{:032x}", rng.gen::<u128>()))
    }

    /// Adopt a caller-supplied token, for coordinated multi-host runs.
    pub fn from_hex(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the master listens: a filesystem socket or a TCP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    /// `host:port`; an absent host in the input means `0.0.0.0`.
    Tcp(String),
}

impl Endpoint {
    /// Parse `port`, `host:port`, or a filesystem path.
    pub fn parse(spec: &str) -> ProtocolResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ProtocolError::Malformed("empty endpoint".into()));
        }
        if let Ok(port) = spec.parse::<u16>() {
            return Ok(Endpoint::Tcp(format!("0.0.0.0:{port}")));
        }
        if !spec.contains('/') {
            if let Some((host, port)) = spec.rsplit_once(':') {
                if !host.is_empty() && port.parse::<u16>().is_ok() {
                    return Ok(Endpoint::Tcp(spec.to_string()));
                }
            }
        }
        Ok(Endpoint::Unix(PathBuf::from(spec)))
    }

    pub async fn bind(&self) -> std::io::Result<Listener> {
        match self {
            Endpoint::Unix(path) => {
                // A stale socket file from a crashed run would fail the bind.
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Listener::Unix {
                    listener: UnixListener::bind(path)?,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    pub async fn connect(&self) -> std::io::Result<Connection> {
        match self {
            Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
            Endpoint::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => f.write_str(addr),
        }
    }
}

/// A bidirectional stream to or from a master, over either transport.
pub trait WireStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> WireStream for T {}

pub type Connection = Box<dyn WireStream>;

/// The master's accept socket.
pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    pub async fn accept(&self) -> std::io::Result<Connection> {
        match self {
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Remove the socket file of a Unix listener. Call before dropping.
    pub fn remove_socket_file(&self) {
        if let Listener::Unix { path, .. } = self {
            std::fs::remove_file(path).ok();
        }
    }
}

/// A command parsed from one accepted connection.
#[derive(Debug)]
pub enum Request {
    Pop,
    Slave {
        workers: usize,
        hostname: String,
        message: Option<String>,
    },
    Worker {
        record: WorkerRecord,
    },
    NewSuite {
        suite: SuiteId,
    },
    Kaboom,
}

/// Split `TOKEN=<hex> <rest>` into the token and the rest of the line.
pub fn split_token(line: &str) -> ProtocolResult<(&str, &str)> {
    let line = line.trim_end_matches('\n');
    let rest = line
        .strip_prefix("TOKEN=")
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
    let (token, rest) = rest
        .split_once(' ')
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
    Ok((token, rest.trim_start()))
}

/// Parse the command portion of a line, reading any declared payload from
/// `reader`.
pub async fn read_request<R>(command: &str, reader: &mut R) -> ProtocolResult<Request>
where
    R: AsyncBufRead + Unpin,
{
    let command = command.trim_end();
    if command == "POP" {
        return Ok(Request::Pop);
    }
    if command == "KABOOM" {
        return Ok(Request::Kaboom);
    }
    if let Some(rest) = command.strip_prefix("SLAVE ") {
        let mut parts = rest.splitn(3, ' ');
        let workers = parts
            .next()
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| ProtocolError::Malformed(command.to_string()))?;
        let hostname = parts
            .next()
            .ok_or_else(|| ProtocolError::Malformed(command.to_string()))?
            .to_string();
        let message = parts.next().map(|m| m.to_string()).filter(|m| !m.is_empty());
        return Ok(Request::Slave {
            workers,
            hostname,
            message,
        });
    }
    if let Some(size) = command.strip_prefix("WORKER ") {
        let size = size
            .parse::<usize>()
            .map_err(|_| ProtocolError::Malformed(command.to_string()))?;
        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).await?;
        let record = WorkerRecord::decode(&payload)?;
        return Ok(Request::Worker { record });
    }
    if let Some(body) = command.strip_prefix("NEW SUITE ") {
        let suite: SuiteId = serde_json::from_str(body)?;
        return Ok(Request::NewSuite { suite });
    }
    Err(ProtocolError::Malformed(command.to_string()))
}

/// What a worker got back from `POP`.
#[derive(Debug, Clone, PartialEq)]
pub enum PopReply {
    /// A suite to run.
    Suite(SuiteId),
    /// The queue is not ready yet; back off and ask again.
    Wait,
    /// The run is over; exit cleanly.
    Done,
    /// The master belongs to a different run; treat the run as over.
    WrongRun,
}

impl PopReply {
    pub fn decode(body: &[u8]) -> ProtocolResult<Self> {
        if body.is_empty() {
            return Ok(PopReply::Done);
        }
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        if text == WRONG_RUN {
            return Ok(PopReply::WrongRun);
        }
        if let Ok(sentinel) = serde_json::from_str::<String>(text) {
            if sentinel == WAIT_SENTINEL {
                return Ok(PopReply::Wait);
            }
        }
        let suite: SuiteId = serde_json::from_str(text)?;
        Ok(PopReply::Suite(suite))
    }
}

/// Client half of the protocol. One connection per exchange; the master
/// closes the stream after its reply, so readers run to EOF.
#[derive(Debug, Clone)]
pub struct MasterClient {
    endpoint: Endpoint,
    token: RunToken,
}

impl MasterClient {
    pub fn new(endpoint: Endpoint, token: RunToken) -> Self {
        Self { endpoint, token }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self, line: String) -> ProtocolResult<Connection> {
        let mut conn = self.endpoint.connect().await?;
        conn.write_all(line.as_bytes()).await?;
        conn.flush().await?;
        Ok(conn)
    }

    /// Request the next suite.
    pub async fn pop(&self) -> ProtocolResult<PopReply> {
        let mut conn = self.open(format!("TOKEN={} POP\n", self.token)).await?;
        let mut body = Vec::new();
        conn.read_to_end(&mut body).await?;
        PopReply::decode(&body)
    }

    /// Report a freshly discovered suite. Fire-and-forget.
    pub async fn new_suite(&self, suite: &SuiteId) -> ProtocolResult<()> {
        let body = serde_json::to_string(suite)?;
        self.open(format!("TOKEN={} NEW SUITE {}\n", self.token, body))
            .await?;
        Ok(())
    }

    /// Signal early-failure escalation. Fire-and-forget.
    pub async fn kaboom(&self) -> ProtocolResult<()> {
        self.open(format!("TOKEN={} KABOOM\n", self.token)).await?;
        Ok(())
    }

    /// Announce `workers` incoming remote workers. Fails unless the master
    /// answers `OK`.
    pub async fn announce_relay(
        &self,
        workers: usize,
        hostname: &str,
        message: Option<&str>,
    ) -> ProtocolResult<()> {
        let mut line = format!("TOKEN={} SLAVE {} {}", self.token, workers, hostname);
        if let Some(message) = message {
            line.push(' ');
            line.push_str(&message.replace('\n', " "));
        }
        line.push('\n');
        let mut conn = self.open(line).await?;
        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await?;
        let reply = String::from_utf8_lossy(&reply);
        let reply = reply.trim();
        match reply {
            "OK" => Ok(()),
            WRONG_RUN => Err(ProtocolError::WrongRun),
            other => Err(ProtocolError::UnexpectedReply(other.to_string())),
        }
    }

    /// Forward a finalized worker record to the primary.
    pub async fn forward_worker(&self, record: &WorkerRecord) -> ProtocolResult<()> {
        let payload = record.encode()?;
        let mut conn = self
            .open(format!("TOKEN={} WORKER {}\n", self.token, payload.len()))
            .await?;
        conn.write_all(&payload).await?;
        conn.flush().await?;
        Ok(())
    }
}

/// Write a `POP` reply and close the write side by dropping the connection.
pub async fn write_pop_reply(conn: &mut Connection, reply: &PopReply) -> ProtocolResult<()> {
    match reply {
        PopReply::Suite(suite) => {
            let body = serde_json::to_vec(suite)?;
            conn.write_all(&body).await?;
        }
        PopReply::Wait => {
            let body = serde_json::to_vec(WAIT_SENTINEL)?;
            conn.write_all(&body).await?;
        }
        // An empty body tells the worker the run is finished.
        PopReply::Done => {}
        PopReply::WrongRun => {
            conn.write_all(WRONG_RUN.as_bytes()).await?;
            conn.write_all(b"\n").await?;
        }
    }
    conn.flush().await?;
    Ok(())
}

/// Read one command line from an accepted connection.
pub async fn read_command_line<R>(reader: &mut R) -> ProtocolResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.is_empty() {
        return Err(ProtocolError::Malformed("empty command".into()));
    }
    Ok(line)
}
