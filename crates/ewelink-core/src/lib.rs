//! Connection memoization and event dispatch for eWeLink device nodes.
//!
//! A flow host runs many device nodes that share a handful of cloud
//! credentials. This crate makes sure each credential is authenticated
//! at most once per process and turns inbound node events into calls on
//! the resulting connection:
//!
//! - **[`ConnectionCache`]** — Map from [`CredentialIdentity`] to a shared
//!   [`ConnectionHandle`]. The first acquirer starts establishment; every
//!   other acquirer, concurrent or later, observes the same outcome.
//!   Failures are cached too and never retried.
//!
//! - **[`Bridge`]** — Process-scoped context owning the cache and the
//!   [`Host`] collaborator. [`ready()`](Bridge::ready) obtains a node's
//!   connection; [`initialize_device_node()`](Bridge::initialize_device_node)
//!   also binds the node's input channel to a [`DispatchAdapter`].
//!
//! - **[`DispatchAdapter`]** — Resolves device id, method name, and
//!   arguments for each [`InboundEvent`] and invokes the method on the
//!   [`Connection`] capability set.
//!
//! - **[`StatusReporter`]** — Drives the node's `connecting` /
//!   `connected` / `disconnected` indicator.

pub mod bridge;
pub mod cache;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod status;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{Bridge, BridgeConfig, DeviceNodeConfig};
pub use cache::{
    Acquired, ConnectionCache, ConnectionHandle, CredentialIdentity, EntryState, Resolution,
};
pub use connection::{Connection, ConnectionBuilder, Method};
pub use dispatch::{DeviceBinding, DispatchAdapter, DispatchRequest, ParamSource};
pub use error::{ConnectError, CoreError, DispatchError, MethodError, NodeError};
pub use host::{
    CredentialResponse, CredentialsNode, EventPayload, Host, InboundEvent, Node, NodeStatus,
    OutputMessage, StatusFill, StatusShape,
};
pub use status::{ConnectionStatus, StatusReporter};
