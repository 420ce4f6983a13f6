// ── Bridge: process-scoped context ──
//
// One `Bridge` per host process. It owns the connection cache and the host
// collaborator, and is handed to every device node. `ready` obtains a
// node's connection; `initialize_device_node` additionally binds the
// node's input channel to a dispatch adapter once the connection is up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{Acquired, ConnectionCache, CredentialIdentity, Resolution};
use crate::connection::Connection;
use crate::dispatch::{DeviceBinding, DispatchAdapter, ParamSource};
use crate::error::{ConnectError, CoreError};
use crate::host::{CredentialsNode, Host, InboundEvent, Node};
use crate::status::StatusReporter;

/// Process-wide bridge settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Upper bound on a single connection attempt. `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

/// Per-node configuration as stored by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNodeConfig {
    /// Reference to the credentials node; doubles as the cache key.
    pub auth: CredentialIdentity,
    /// Fixed device id. Blank means "take it from the event".
    pub device_id: Option<String>,
}

impl DeviceNodeConfig {
    pub fn new(auth: impl Into<CredentialIdentity>) -> Self {
        Self {
            auth: auth.into(),
            device_id: None,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

// ── Bridge ───────────────────────────────────────────────────────────

/// Cheaply cloneable via `Arc<BridgeInner>`.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    host: Arc<dyn Host>,
    cache: ConnectionCache,
    config: BridgeConfig,
}

impl Bridge {
    pub fn new(host: Arc<dyn Host>, config: BridgeConfig) -> Self {
        let cache = ConnectionCache::with_timeout(config.connect_timeout);
        Self {
            inner: Arc::new(BridgeInner {
                host,
                cache,
                config,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.inner.cache
    }

    /// Obtain the connection for a node's credentials.
    ///
    /// Fails immediately with [`CoreError::CredentialLookup`] if the host
    /// has no credentials node for `config.auth`; no status is reported in
    /// that case. On a cache miss the node shows `connecting` and then
    /// `connected` or `disconnected` once the attempt settles. A cache hit
    /// is reported `connected` straight away, whatever the entry's state;
    /// the shared outcome is still what this returns.
    pub async fn ready(
        &self,
        node: &Arc<dyn Node>,
        config: &DeviceNodeConfig,
    ) -> Result<Arc<Connection>, CoreError> {
        let pending = self.begin(node, config)?;
        Ok(pending.established().await?)
    }

    /// Connect a device node and, once connected, dispatch every event
    /// received on `events`.
    ///
    /// Credential lookup and cache registration happen before this
    /// returns; the rest runs on a spawned task. If the connection fails
    /// the error is reported once through the node and `events` is
    /// dropped without being read.
    pub fn initialize_device_node(
        &self,
        node: Arc<dyn Node>,
        config: DeviceNodeConfig,
        method: Option<String>,
        params: Option<ParamSource>,
        events: mpsc::Receiver<InboundEvent>,
    ) -> Result<JoinHandle<()>, CoreError> {
        let pending = self.begin(&node, &config)?;

        Ok(tokio::spawn(async move {
            match pending.established().await {
                Ok(connection) => {
                    let binding = DeviceBinding {
                        device_id: config.device_id,
                        method,
                        params,
                    };
                    DispatchAdapter::new(node, connection, binding)
                        .run(events)
                        .await;
                }
                Err(e) => {
                    warn!(node = node.id(), auth = %config.auth, error = %e, "node left unbound");
                    node.error(e.into());
                }
            }
        }))
    }

    /// Look up credentials, report `connecting`, and register with the
    /// cache, all without suspending.
    fn begin(
        &self,
        node: &Arc<dyn Node>,
        config: &DeviceNodeConfig,
    ) -> Result<PendingConnection, CoreError> {
        let credentials = self
            .inner
            .host
            .credentials_node(&config.auth)
            .ok_or_else(|| CoreError::CredentialLookup {
                auth: config.auth.clone(),
            })?;

        let reporter = StatusReporter::new(Arc::clone(node));
        reporter.connecting();

        let acquired = self
            .inner
            .cache
            .acquire(&config.auth, || authenticate(credentials));
        debug!(
            node = node.id(),
            auth = %config.auth,
            cache_hit = acquired.cache_hit,
            "connection acquired"
        );
        if acquired.cache_hit {
            reporter.connected();
        }

        Ok(PendingConnection { reporter, acquired })
    }
}

/// Resolve a credentials node into its connection. An `error` in the
/// reply counts as a rejection.
async fn authenticate(credentials: Arc<dyn CredentialsNode>) -> Resolution {
    let response = credentials.get_credentials().await?;
    if let Some(detail) = response.error {
        return Err(ConnectError::Rejected { detail });
    }
    Ok(credentials.connection())
}

/// A registered acquisition whose outcome has not been observed yet.
struct PendingConnection {
    reporter: StatusReporter,
    acquired: Acquired,
}

impl PendingConnection {
    async fn established(self) -> Resolution {
        let resolution = self.acquired.handle.wait().await;
        if self.acquired.cache_hit {
            return resolution;
        }
        match &resolution {
            Ok(_) => self.reporter.connected(),
            Err(_) => self.reporter.disconnected(),
        };
        resolution
    }
}
