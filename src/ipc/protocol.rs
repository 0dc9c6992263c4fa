//! Control-socket messages and their framing.
//!
//! Every message is a big-endian `u32` byte count followed by that many
//! bytes of JSON. Commands and responses are internally tagged on `type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::flow::StatsSnapshot;
use crate::interface::NetworkInterface;
use crate::rules::RuleRecord;

/// Requests accepted on the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Liveness probe
    Ping,
    Status,
    GetStats,
    /// Rules in evaluation order
    ListRules,
    /// Replace every rule with these interchange records.
    ///
    /// Bad records are skipped and listed in the reply.
    LoadRules { rules: Vec<serde_json::Value> },
    /// Re-read the rule store file
    ReloadRules,
    /// Dry-run the matcher against a destination
    TestMatch {
        #[serde(default)]
        ip: Option<String>,
        #[serde(default)]
        hostname: Option<String>,
    },
    ListInterfaces,
    RefreshInterfaces,
    /// Drain flows and exit
    Shutdown,
}

/// Replies sent on the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,
    Status(ServerStatus),
    Stats(StatsSnapshot),
    RuleList { version: u64, rules: Vec<RuleRecord> },
    /// Reply to `LoadRules` and `ReloadRules`
    RulesLoaded(RulesLoaded),
    TestMatchResult(TestMatchResult),
    InterfaceList { interfaces: Vec<NetworkInterface> },
    /// Command done, nothing to return
    Success { message: Option<String> },
    Error(ErrorReply),
}

impl IpcResponse {
    #[must_use]
    pub const fn success() -> Self {
        Self::Success { message: None }
    }

    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success {
            message: Some(msg.into()),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorReply {
            code,
            message: message.into(),
        })
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub active_flows: usize,
    pub max_flows: usize,
    pub rule_count: usize,
    pub rule_version: u64,
    pub active_interfaces: usize,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesLoaded {
    pub loaded: usize,
    pub version: u64,
    /// One line per skipped record
    pub dropped: Vec<String>,
}

/// Where a destination would be sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMatchResult {
    pub matched: bool,
    pub rule_id: Option<String>,
    /// `None` selects the system default route
    pub interface: Option<String>,
    pub interface_active: bool,
    pub rule_version: u64,
}

/// Body of [`IpcResponse::Error`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ErrorCode,
    pub message: String,
}

impl std::fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorReply {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Body was not a known command
    InvalidCommand,
    InvalidParameters,
    OperationFailed,
    ShuttingDown,
}

/// Default upper bound on a frame body
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Serializes `msg` and prepends its length.
///
/// # Errors
///
/// Fails only if `msg` cannot be serialized.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    let prefix = u32::try_from(body.len()).unwrap_or(u32::MAX).to_be_bytes();
    Ok([prefix.as_slice(), body.as_slice()].concat())
}

/// Parses a frame body; the length prefix must already be stripped.
///
/// # Errors
///
/// Malformed JSON or a shape that does not fit `T`.
pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(body)
}

/// What [`read_frame`] found on the stream
#[derive(Debug)]
pub(crate) enum Frame {
    Body(Vec<u8>),
    /// Peer closed the stream before a new prefix
    Closed,
    /// Prefix announced more than the limit; the body is left unread
    TooLarge(usize),
}

pub(crate) async fn read_frame<R>(reader: &mut R, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    if let Err(e) = reader.read_exact(&mut prefix).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Ok(Frame::Closed),
            _ => Err(e),
        };
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > limit {
        return Ok(Frame::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame::Body(body))
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, msg: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_message(msg).map_err(std::io::Error::other)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}
