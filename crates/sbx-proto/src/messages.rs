//! Message types for both front-door surfaces.
//!
//! The RPC hot path exchanges one JSON [`Request`] per line and gets one
//! [`Response`] line back. File content crosses the wire as standard base64.
//! The HTTP bodies mirror the lifecycle and snapshot endpoints.

use std::collections::HashMap;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// RPC request envelope, dispatched on the `op` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Ping,
    RunCommand(RunCommandRequest),
    WriteFile(WriteFileRequest),
    ReadFile(ReadFileRequest),
    ListDir(ListDirRequest),
    SetEnv(SetEnvRequest),
    SetCwd(SetCwdRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunCommandRequest {
    pub session_id: String,
    /// argv; the first element is the executable.
    pub command: Vec<String>,
    #[serde(default)]
    pub time_ms: Option<u64>,
    #[serde(default)]
    pub mem_kb: Option<u64>,
    #[serde(default)]
    pub fsize_kb: Option<u64>,
    #[serde(default)]
    pub nofile: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub session_id: String,
    pub path: String,
    /// File bytes, standard base64.
    pub content: String,
}

impl WriteFileRequest {
    /// Decode the base64 content field.
    pub fn decode_content(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.content)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub session_id: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListDirRequest {
    pub session_id: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetEnvRequest {
    pub session_id: String,
    pub env: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetCwdRequest {
    pub session_id: String,
    pub cwd: String,
}

/// RPC response envelope, dispatched on the `type` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Command(CommandResult),
    FileWritten,
    FileContent {
        /// File bytes, standard base64.
        content: String,
    },
    DirListing {
        entries: Vec<DirEntry>,
    },
    EnvSet,
    CwdSet,
    Error(ErrorBody),
}

impl Response {
    /// Build an error response from a kind name and message.
    pub fn error<K: Into<String>, M: Into<String>>(kind: K, message: M) -> Self {
        Self::Error(ErrorBody {
            kind: kind.into(),
            message: message.into(),
        })
    }

    /// Build a file-content response from raw bytes.
    pub fn file_content(bytes: &[u8]) -> Self {
        Self::FileContent {
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub signal: i32,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    /// "file", "dir", "symlink", or "other".
    #[serde(rename = "type")]
    pub kind: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Error payload shared by both surfaces.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// HTTP bodies
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetEnvBody {
    pub env: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetCwdBody {
    pub cwd: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

/// Body for the HTTP exec endpoint. Unlike the RPC surface, a
/// signal-terminated child is flattened to `exit_code = 128 + signal`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecBody {
    pub command: Vec<String>,
    #[serde(default)]
    pub time_ms: Option<u64>,
    #[serde(default)]
    pub mem_kb: Option<u64>,
    #[serde(default)]
    pub fsize_kb: Option<u64>,
    #[serde(default)]
    pub nofile: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotCreateBody {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotListResponse {
    pub snapshots: Vec<SnapshotEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExportResponse {
    /// Archive file name; fetch it from the session's exports endpoint.
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// HTTP error envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
