// ── Event dispatch ──
//
// Turns an inbound event into a call on the connection's capability set.
// The device id is always the first argument: every device operation of
// the cloud API takes it in that position.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{DispatchError, NodeError};
use crate::host::{InboundEvent, Node, OutputMessage};

/// Where a device node gets its call arguments from.
#[derive(Clone)]
pub enum ParamSource {
    /// A fixed argument list.
    Static(Vec<Value>),
    /// Arguments computed from each event.
    Derived(Arc<dyn Fn(&InboundEvent) -> Vec<Value> + Send + Sync>),
}

impl ParamSource {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&InboundEvent) -> Vec<Value> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }

    fn evaluate(&self, event: &InboundEvent) -> Vec<Value> {
        match self {
            Self::Static(values) => values.clone(),
            Self::Derived(f) => f(event),
        }
    }
}

impl fmt::Debug for ParamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(values) => f.debug_tuple("Static").field(values).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl From<Vec<Value>> for ParamSource {
    fn from(values: Vec<Value>) -> Self {
        Self::Static(values)
    }
}

/// Static per-node dispatch settings.
#[derive(Debug, Clone, Default)]
pub struct DeviceBinding {
    /// Configured device id. Blank values count as unset.
    pub device_id: Option<String>,
    /// Fixed method name; overrides `payload.method`.
    pub method: Option<String>,
    /// Argument source; overrides `payload.params`.
    pub params: Option<ParamSource>,
}

/// A fully resolved call, built fresh for each event.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub device_id: String,
    pub method: String,
    pub arguments: Vec<Value>,
}

impl DispatchRequest {
    pub fn from_event(binding: &DeviceBinding, event: &InboundEvent) -> Result<Self, DispatchError> {
        let device_id = resolve_device_id(binding.device_id.as_deref(), event);
        let method = resolve_method(binding.method.as_deref(), event)?;
        let arguments = resolve_params(binding.params.as_ref(), event, &device_id);
        Ok(Self {
            device_id,
            method,
            arguments,
        })
    }
}

/// Configured id (trimmed, if not blank), else the event's id, else `""`.
pub fn resolve_device_id(configured: Option<&str>, event: &InboundEvent) -> String {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_owned();
    }
    event.device_id.clone().unwrap_or_default()
}

/// Fixed method name if configured, else the one carried by the event.
pub fn resolve_method(fixed: Option<&str>, event: &InboundEvent) -> Result<String, DispatchError> {
    fixed
        .filter(|m| !m.is_empty())
        .or_else(|| event.payload_method())
        .filter(|m| !m.is_empty())
        .map(str::to_owned)
        .ok_or(DispatchError::MissingMethod)
}

/// Build the argument list with `device_id` prepended.
pub fn resolve_params(
    source: Option<&ParamSource>,
    event: &InboundEvent,
    device_id: &str,
) -> Vec<Value> {
    let params = match source {
        Some(source) => source.evaluate(event),
        None => event.payload_params().map(<[Value]>::to_vec).unwrap_or_default(),
    };

    let mut arguments = Vec::with_capacity(params.len() + 1);
    arguments.push(Value::String(device_id.to_owned()));
    arguments.extend(params);
    arguments
}

// ── DispatchAdapter ──────────────────────────────────────────────────

/// Per-node dispatcher bound to an established connection.
pub struct DispatchAdapter {
    node: Arc<dyn Node>,
    connection: Arc<Connection>,
    binding: DeviceBinding,
}

impl DispatchAdapter {
    pub fn new(node: Arc<dyn Node>, connection: Arc<Connection>, binding: DeviceBinding) -> Self {
        Self {
            node,
            connection,
            binding,
        }
    }

    /// Handle one event. The outcome goes to the node's output channel on
    /// success and to its error channel otherwise.
    pub async fn handle_event(&self, event: InboundEvent) {
        match self.dispatch(&event).await {
            Ok(message) => self.node.send(message),
            Err(e) => {
                warn!(node = self.node.id(), error = %e, "dispatch failed");
                self.node.error(e);
            }
        }
    }

    async fn dispatch(&self, event: &InboundEvent) -> Result<OutputMessage, NodeError> {
        let DispatchRequest {
            device_id,
            method,
            arguments,
        } = DispatchRequest::from_event(&self.binding, event)?;

        debug!(node = self.node.id(), device = %device_id, %method, "dispatching");
        let payload = self.connection.invoke(&method, arguments).await?;
        Ok(OutputMessage { device_id, payload })
    }

    /// Process events until the sending side of the channel is dropped.
    pub async fn run(self, mut events: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!(node = self.node.id(), "input channel closed");
    }
}
