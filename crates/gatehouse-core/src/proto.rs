//! Wire protocol between the daemon and its clients.
//!
//! Frames are length-delimited JSON. Each request carries a client-chosen
//! `id` echoed in the response, a method name, and method parameters.
//! Every method except `ping` and `version` authenticates with a bearer
//! secret inside the params.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::credential::{CredentialSummary, OpClass, RateLimitConfig, Scope};
use crate::policy::Target;

/// Method names understood by the daemon.
pub mod method {
    pub const PING: &str = "ping";
    pub const VERSION: &str = "version";
    pub const EXECUTE: &str = "execute";
    pub const APPROVAL_LIST: &str = "approval.list";
    pub const APPROVAL_DECIDE: &str = "approval.decide";
    pub const TOKEN_LIST: &str = "token.list";
    pub const TOKEN_CREATE: &str = "token.create";
    pub const TOKEN_ROTATE: &str = "token.rotate";
    pub const TOKEN_DISABLE: &str = "token.disable";
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObj {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObj>,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorObj {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Secrets on the wire
// ---------------------------------------------------------------------------

/// A bearer secret inside request params. Serializes as a plain string but
/// renders redacted in Debug so it cannot leak through logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(pub String);

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted>")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl SecretString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Operation requests
// ---------------------------------------------------------------------------

/// One requestable operation. The `op` tag doubles as the operation-class
/// name in audit records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpRequest {
    FsList {
        path: PathBuf,
    },
    FsRead {
        path: PathBuf,
    },
    FsWrite {
        path: PathBuf,
        contents: String,
    },
    FsMkdir {
        path: PathBuf,
    },
    FsDelete {
        path: PathBuf,
        #[serde(default)]
        recursive: bool,
    },
    Exec {
        argv: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl OpRequest {
    pub fn op_class(&self) -> OpClass {
        match self {
            Self::FsList { .. } => OpClass::FsList,
            Self::FsRead { .. } => OpClass::FsRead,
            Self::FsWrite { .. } => OpClass::FsWrite,
            Self::FsMkdir { .. } => OpClass::FsMkdir,
            Self::FsDelete { .. } => OpClass::FsDelete,
            Self::Exec { .. } => OpClass::Exec,
        }
    }

    /// The policy target of this request.
    pub fn target(&self) -> Target {
        match self {
            Self::FsList { path }
            | Self::FsRead { path }
            | Self::FsWrite { path, .. }
            | Self::FsMkdir { path }
            | Self::FsDelete { path, .. } => Target::path(path.clone()),
            Self::Exec { argv, .. } => Target::command(argv.clone()),
        }
    }
}

/// A single directory entry from `fs_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// The result of a completed operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpResult {
    FsList {
        entries: Vec<DirEntry>,
    },
    FsRead {
        contents: String,
        /// Set when the file was cut off at the read limit.
        truncated: bool,
    },
    FsWrite {
        bytes_written: u64,
    },
    FsMkdir {},
    FsDelete {},
    Exec {
        exit_code: i32,
        stdout: String,
        stderr: String,
        truncated: bool,
        duration_ms: u64,
    },
}

// ---------------------------------------------------------------------------
// Method params and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteParams {
    pub secret: SecretString,
    #[serde(flatten)]
    pub request: OpRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub request_id: Uuid,
    #[serde(flatten)]
    pub result: OpResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthedParams {
    pub secret: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecideParams {
    pub secret: SecretString,
    pub id: Uuid,
    pub approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCreateParams {
    pub secret: SecretString,
    pub name: String,
    pub scopes: BTreeSet<Scope>,
    #[serde(default)]
    pub path_allowlist: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub path_denylist: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub command_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub command_denylist: Option<Vec<String>>,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub require_approval: BTreeSet<OpClass>,
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
}

/// The one place a newly minted secret crosses the wire: the create and
/// rotate responses. Clients must store it; it is not retrievable later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCreateResult {
    pub token: CredentialSummary,
    pub secret: SecretString,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenIdParams {
    pub secret: SecretString,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: String,
    pub api_version: u32,
}
