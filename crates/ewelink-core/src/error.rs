// ── Core error types ──
//
// Cache-level errors (`ConnectError`) are shared by every waiter on a
// connection handle and therefore must be `Clone`. Dispatch-level errors
// are local to a single inbound event and only ever reach the node's
// error channel.

use serde_json::Value;
use thiserror::Error;

use crate::cache::CredentialIdentity;

/// Failure to establish a connection for a credential identity.
///
/// Memoized in the connection cache: every current and future caller
/// for the same identity observes the same value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error("Credentials rejected: {detail}")]
    Rejected { detail: Value },

    #[error("Credential resolution failed: {message}")]
    Credentials { message: String },

    #[error("Connection attempt timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Connection attempt aborted before completion")]
    Aborted,
}

/// The inbound event could not be turned into a call on the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("No method configured and none carried by the event payload")]
    MissingMethod,

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },
}

/// Failure reported by a capability callable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MethodError {
    pub message: String,
}

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Everything a node's error-reporting channel can receive.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Method {method} failed: {source}")]
    Invocation {
        method: String,
        #[source]
        source: MethodError,
    },
}

/// Errors surfaced by [`Bridge::ready`](crate::Bridge::ready).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("No credentials provided for {auth}")]
    CredentialLookup { auth: CredentialIdentity },

    #[error(transparent)]
    CredentialResolution(#[from] ConnectError),
}
