//! Error taxonomy for the client core.
//!
//! Every fallible public API returns [`RedisResult<T>`]. `ErrorKind` classifies
//! *why* an operation failed; the kind, not the message text, is what callers
//! should match on.

use std::fmt;
use std::io;

/// Classification of a [`RedisError`], independent of its human-readable detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Catch-all base category for conditions not covered below.
    RedisError,
    /// Transport not connected, write attempted on a closed socket, or the
    /// pending-reply queue was drained because the transport was lost.
    ConnectionError,
    /// Server returned a `-ERR ...` (or any `-`-prefixed) line not covered by
    /// a more specific kind below.
    ResponseError,
    /// Bytes on the wire could not be parsed as RESP (bad length header,
    /// unknown type prefix, truncated framing).
    InvalidResponse,
    /// Client-side problem: an argument could not be encoded, or an illegal
    /// combination of parameters was given.
    InvalidData,
    /// A reply-timeout or connect-timeout elapsed.
    Timeout,
    /// `EXEC` returned a null array because a watched key changed.
    WatchError,
    /// `EVALSHA` failed with `NOSCRIPT`.
    ScriptDoesNotExist,
    /// `SCRIPT KILL` was issued with no script running.
    NoScriptRunning,
    /// Sentinel discovery completed without finding a quorum-acceptable master.
    MasterNotFound,
    /// The command is illegal given the connection's current state (e.g. an
    /// ordinary command issued on a subscriber connection).
    NotPermitted,
    /// The command is illegal on the handle it was issued against (e.g. a
    /// cross-shard operation on a sharded handler, or a pipeline on one).
    NotSupported,
    /// No connection was available for dispatch because every pool member is
    /// reserved (in a transaction, pipeline, or subscriber mode).
    InTransaction,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RedisError => "redis-error",
            ErrorKind::ConnectionError => "connection-error",
            ErrorKind::ResponseError => "response-error",
            ErrorKind::InvalidResponse => "invalid-response",
            ErrorKind::InvalidData => "invalid-data",
            ErrorKind::Timeout => "timeout",
            ErrorKind::WatchError => "watch-error",
            ErrorKind::ScriptDoesNotExist => "script-does-not-exist",
            ErrorKind::NoScriptRunning => "no-script-running",
            ErrorKind::MasterNotFound => "master-not-found",
            ErrorKind::NotPermitted => "not-permitted",
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::InTransaction => "in-transaction",
        };
        f.write_str(s)
    }
}

/// The error type returned by every fallible operation in this crate.
#[derive(Debug)]
pub struct RedisError {
    kind: ErrorKind,
    detail: String,
    source: Option<io::Error>,
}

impl Clone for RedisError {
    /// The `io::Error` source, if any, is not `Clone`; cloning keeps the kind
    /// and detail but drops the source chain.
    fn clone(&self) -> Self {
        RedisError { kind: self.kind, detail: self.detail.clone(), source: None }
    }
}

impl PartialEq for RedisError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.detail == other.detail
    }
}

impl RedisError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        RedisError { kind, detail: detail.into(), source: None }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Parses a `-ERR ...` (or other `-`-prefixed) server reply line into a
    /// typed error, stripping the conventional `ERR ` prefix per §4.2 and
    /// recognizing the handful of reply prefixes that map to a specific kind.
    pub fn from_server_message(message: &str) -> Self {
        let (kind, detail) = if let Some(rest) = message.strip_prefix("NOSCRIPT") {
            (ErrorKind::ScriptDoesNotExist, rest.trim_start().to_string())
        } else if let Some(rest) = message.strip_prefix("NOTBUSY") {
            (ErrorKind::NoScriptRunning, rest.trim_start().to_string())
        } else if let Some(rest) = message.strip_prefix("ERR ") {
            (ErrorKind::ResponseError, rest.to_string())
        } else {
            (ErrorKind::ResponseError, message.to_string())
        };
        RedisError::new(kind, detail)
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for RedisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for RedisError {
    fn from(e: io::Error) -> Self {
        RedisError { kind: ErrorKind::ConnectionError, detail: e.to_string(), source: Some(e) }
    }
}

impl From<std::str::Utf8Error> for RedisError {
    fn from(e: std::str::Utf8Error) -> Self {
        RedisError::new(ErrorKind::InvalidData, format!("invalid utf-8: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for RedisError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        RedisError::new(ErrorKind::InvalidData, format!("invalid utf-8: {e}"))
    }
}

pub type RedisResult<T> = Result<T, RedisError>;
