// ── Host runtime collaborators ──
//
// The flow host owns node lifecycles, credential storage, and the actual
// device protocol. This module is the narrow surface the bridge consumes:
// per-node status/output/error primitives, credential-node lookup, and the
// message shapes that cross the boundary.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CredentialIdentity;
use crate::connection::Connection;
use crate::error::{ConnectError, NodeError};

// ── Status primitive ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Yellow,
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Dot,
}

/// Visual status indicator as the host renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
}

// ── Messages ─────────────────────────────────────────────────────────

/// Payload of an inbound event.
///
/// `method` and `params` drive dispatch; any other fields are kept so
/// that derived parameter functions can read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One inbound event delivered to a device node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<EventPayload>,
}

impl InboundEvent {
    /// Read a non-dispatch field from the payload.
    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload.as_ref()?.extra.get(key)
    }

    pub fn payload_method(&self) -> Option<&str> {
        self.payload.as_ref()?.method.as_deref()
    }

    pub fn payload_params(&self) -> Option<&[Value]> {
        self.payload.as_ref()?.params.as_deref()
    }
}

/// Record emitted on a node's outbound channel after a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMessage {
    pub device_id: String,
    pub payload: Value,
}

// ── Collaborator traits ──────────────────────────────────────────────

/// Per-node primitives supplied by the host.
pub trait Node: Send + Sync {
    /// Host-assigned node id, used for log context only.
    fn id(&self) -> &str;

    fn status(&self, status: NodeStatus);

    fn send(&self, message: OutputMessage);

    fn error(&self, error: NodeError);
}

/// Reply from a credentials node. A present `error` means the cloud
/// service refused the stored credentials.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A configured set of cloud credentials, owned by the host.
pub trait CredentialsNode: Send + Sync {
    /// Authenticate against the cloud service.
    fn get_credentials(&self) -> BoxFuture<'_, Result<CredentialResponse, ConnectError>>;

    /// The capability set that becomes usable once authentication succeeds.
    fn connection(&self) -> Arc<Connection>;
}

/// Lookup of credentials nodes by identity.
pub trait Host: Send + Sync {
    fn credentials_node(&self, auth: &CredentialIdentity) -> Option<Arc<dyn CredentialsNode>>;
}
