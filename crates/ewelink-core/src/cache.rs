// ── Connection memoization cache ──
//
// Process-wide map from credential identity to a shared connection
// handle. The first acquirer for an identity registers a pending entry
// and starts establishment; every later acquirer gets the same handle and
// observes the same outcome. Entries are never evicted, and a failed
// entry stays failed.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::ConnectError;

/// Outcome of a connection attempt.
pub type Resolution = Result<Arc<Connection>, ConnectError>;

// ── CredentialIdentity ───────────────────────────────────────────────

/// Opaque key identifying one set of stored cloud credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialIdentity(String);

impl CredentialIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CredentialIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for CredentialIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── ConnectionHandle ─────────────────────────────────────────────────

/// Shared handle to a connection that may still be establishing.
///
/// Settles exactly once. Clones share the same slot, so every holder
/// observes the identical connection or the identical error. Await it
/// directly or through [`wait`](Self::wait).
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    slot: Arc<watch::Sender<Option<Resolution>>>,
}

impl ConnectionHandle {
    fn pending() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Store the outcome. Only the first call has any effect.
    fn settle(&self, resolution: Resolution) {
        self.slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(resolution);
            true
        });
    }

    /// Suspend until the handle settles.
    pub async fn wait(&self) -> Resolution {
        let mut rx = self.slot.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone().unwrap_or(Err(ConnectError::Aborted)),
            Err(_) => Err(ConnectError::Aborted),
        }
    }

    /// The outcome if already settled, without suspending.
    pub fn peek(&self) -> Option<Resolution> {
        self.slot.borrow().clone()
    }

    pub fn state(&self) -> EntryState {
        match &*self.slot.borrow() {
            None => EntryState::Pending,
            Some(Ok(_)) => EntryState::Established,
            Some(Err(e)) => EntryState::Failed(e.clone()),
        }
    }

    /// True if both handles share one cache entry.
    pub fn same_entry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl IntoFuture for ConnectionHandle {
    type Output = Resolution;
    type IntoFuture = BoxFuture<'static, Resolution>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

/// Inspection view of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    Pending,
    Established,
    Failed(ConnectError),
}

/// Result of [`ConnectionCache::acquire`].
#[derive(Debug, Clone)]
pub struct Acquired {
    pub handle: ConnectionHandle,
    /// `true` when an existing entry was reused and the resolver was not
    /// invoked.
    pub cache_hit: bool,
}

// ── ConnectionCache ──────────────────────────────────────────────────

/// Registry of connection handles keyed by credential identity.
///
/// Holds at most one entry per identity. Check-and-register happens
/// under a single `DashMap` shard lock, so concurrent acquirers for an
/// unseen identity can never both miss.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    entries: DashMap<CredentialIdentity, ConnectionHandle>,
    connect_timeout: Option<Duration>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache whose connection attempts fail with
    /// [`ConnectError::Timeout`] if they have not settled within `timeout`.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            connect_timeout: timeout,
        }
    }

    /// Return the handle for `identity`, creating it on first use.
    ///
    /// `resolver` is called only on a miss; the future it returns is
    /// spawned immediately, so establishment proceeds even if nobody
    /// awaits the handle. Must be called from within a Tokio runtime.
    pub fn acquire<F, Fut>(&self, identity: &CredentialIdentity, resolver: F) -> Acquired
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Resolution> + Send + 'static,
    {
        let handle = match self.entries.entry(identity.clone()) {
            Entry::Occupied(entry) => {
                debug!(auth = %identity, state = ?entry.get().state(), "connection cache hit");
                return Acquired {
                    handle: entry.get().clone(),
                    cache_hit: true,
                };
            }
            Entry::Vacant(entry) => entry.insert(ConnectionHandle::pending()).clone(),
        };

        debug!(auth = %identity, "connection cache miss, establishing");
        tokio::spawn(establish(
            identity.clone(),
            handle.clone(),
            resolver(),
            self.connect_timeout,
        ));

        Acquired {
            handle,
            cache_hit: false,
        }
    }

    pub fn get(&self, identity: &CredentialIdentity) -> Option<ConnectionHandle> {
        self.entries.get(identity).map(|r| r.value().clone())
    }

    pub fn contains(&self, identity: &CredentialIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn state(&self, identity: &CredentialIdentity) -> Option<EntryState> {
        self.entries.get(identity).map(|r| r.value().state())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn establish<Fut>(
    identity: CredentialIdentity,
    handle: ConnectionHandle,
    resolution: Fut,
    timeout: Option<Duration>,
) where
    Fut: Future<Output = Resolution> + Send + 'static,
{
    let guarded = AssertUnwindSafe(resolution).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(Err(ConnectError::Timeout {
                timeout_secs: limit.as_secs(),
            })),
        },
        None => guarded.await,
    };
    let resolution = outcome.unwrap_or(Err(ConnectError::Aborted));

    match &resolution {
        Ok(_) => info!(auth = %identity, "connection established"),
        Err(e) => warn!(auth = %identity, error = %e, "connection failed, caching failure"),
    }
    handle.settle(resolution);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    use super::*;

    fn connection() -> Arc<Connection> {
        Arc::new(Connection::builder().build())
    }

    #[tokio::test]
    async fn hit_reuses_handle_without_resolving_again() {
        let cache = ConnectionCache::new();
        let calls = AtomicUsize::new(0);
        let id = CredentialIdentity::from("cred1");

        let first = cache.acquire(&id, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(connection()) }
        });
        let second = cache.acquire(&id, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(connection()) }
        });

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert!(first.handle.same_entry(&second.handle));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let a = first.handle.await.unwrap();
        let b = second.handle.await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn entry_is_registered_before_resolution() {
        let cache = ConnectionCache::new();
        let id = CredentialIdentity::from("cred1");
        let (tx, rx) = oneshot::channel::<Resolution>();

        let acquired = cache.acquire(&id, move || async move {
            rx.await.unwrap_or(Err(ConnectError::Aborted))
        });

        assert!(cache.contains(&id));
        assert!(cache.get(&id).unwrap().same_entry(&acquired.handle));
        assert_eq!(cache.state(&id), Some(EntryState::Pending));
        assert!(acquired.handle.peek().is_none());

        tx.send(Ok(connection())).unwrap();
        acquired.handle.wait().await.unwrap();
        assert_eq!(cache.state(&id), Some(EntryState::Established));
    }

    // Failures are memoized on purpose: a credential that fails once stays
    // failed until the process restarts.
    #[tokio::test]
    async fn failure_is_cached_and_never_retried() {
        let cache = ConnectionCache::new();
        let calls = AtomicUsize::new(0);
        let id = CredentialIdentity::from("bad");
        let rejected = ConnectError::Credentials {
            message: "wrong password".into(),
        };

        let first = cache.acquire(&id, || {
            calls.fetch_add(1, Ordering::SeqCst);
            let err = rejected.clone();
            async move { Err(err) }
        });
        assert_eq!(first.handle.wait().await.unwrap_err(), rejected);

        let again = cache.acquire(&id, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(connection()) }
        });
        assert!(again.cache_hit);
        assert_eq!(again.handle.wait().await.unwrap_err(), rejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state(&id), Some(EntryState::Failed(rejected)));
    }

    #[tokio::test]
    async fn distinct_identities_do_not_share_outcomes() {
        let cache = ConnectionCache::new();
        let good = CredentialIdentity::from("good");
        let bad = CredentialIdentity::from("bad");

        let ok = cache.acquire(&good, || async { Ok(connection()) });
        let failed = cache.acquire(&bad, || async { Err(ConnectError::Aborted) });

        assert!(!ok.cache_hit && !failed.cache_hit);
        assert!(ok.handle.wait().await.is_ok());
        assert_eq!(failed.handle.wait().await.unwrap_err(), ConnectError::Aborted);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn panicking_resolver_settles_as_aborted() {
        let cache = ConnectionCache::new();
        let id = CredentialIdentity::from("cred1");

        let acquired = cache.acquire(&id, || explode());

        assert_eq!(acquired.handle.wait().await.unwrap_err(), ConnectError::Aborted);
        assert_eq!(cache.state(&id), Some(EntryState::Failed(ConnectError::Aborted)));
    }

    async fn explode() -> Resolution {
        panic!("resolver blew up")
    }

    #[tokio::test(start_paused = true)]
    async fn hung_resolver_times_out_when_configured() {
        let cache = ConnectionCache::with_timeout(Some(Duration::from_secs(5)));
        let id = CredentialIdentity::from("slow");

        let acquired = cache.acquire(&id, futures_util::future::pending);

        assert_eq!(
            acquired.handle.wait().await.unwrap_err(),
            ConnectError::Timeout { timeout_secs: 5 }
        );
        assert_eq!(
            cache.state(&id),
            Some(EntryState::Failed(ConnectError::Timeout { timeout_secs: 5 }))
        );
    }
}
