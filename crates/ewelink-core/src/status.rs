// ── Node connection status ──
//
// Maps the connection lifecycle onto the three indicator states the host
// displays. Within one acquisition cycle the status only moves forward:
// connecting, then exactly one of connected / disconnected.

use std::sync::Arc;

use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::host::{Node, NodeStatus, StatusFill, StatusShape};

/// Observable connection status of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    /// The literal indicator the host is asked to render.
    pub fn node_status(self) -> NodeStatus {
        let fill = match self {
            Self::Connecting => StatusFill::Yellow,
            Self::Connected => StatusFill::Green,
            Self::Disconnected => StatusFill::Red,
        };
        NodeStatus {
            fill,
            shape: StatusShape::Dot,
            text: self.to_string(),
        }
    }

    fn may_follow(self, previous: Option<Self>) -> bool {
        match (previous, self) {
            (Some(Self::Connecting), Self::Connected | Self::Disconnected)
            | (None | Some(Self::Connected | Self::Disconnected), Self::Connecting) => true,
            _ => false,
        }
    }
}

/// Per-node status reporter.
///
/// Forwards each accepted transition to the node's status primitive and
/// publishes it on a `watch` channel. Out-of-order transitions are dropped.
pub struct StatusReporter {
    node: Arc<dyn Node>,
    current: watch::Sender<Option<ConnectionStatus>>,
}

impl StatusReporter {
    pub fn new(node: Arc<dyn Node>) -> Self {
        let (current, _) = watch::channel(None);
        Self { node, current }
    }

    pub fn connecting(&self) -> bool {
        self.report(ConnectionStatus::Connecting)
    }

    pub fn connected(&self) -> bool {
        self.report(ConnectionStatus::Connected)
    }

    pub fn disconnected(&self) -> bool {
        self.report(ConnectionStatus::Disconnected)
    }

    /// Apply a transition. Returns `false` if it was rejected.
    pub fn report(&self, status: ConnectionStatus) -> bool {
        let previous = *self.current.borrow();
        if !status.may_follow(previous) {
            warn!(
                node = self.node.id(),
                from = ?previous,
                to = %status,
                "ignoring out-of-order status transition"
            );
            return false;
        }

        self.current.send_replace(Some(status));
        debug!(node = self.node.id(), status = %status, "node status");
        self.node.status(status.node_status());
        true
    }

    pub fn current(&self) -> Option<ConnectionStatus> {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ConnectionStatus>> {
        self.current.subscribe()
    }
}
