// ── Connection capability set ──
//
// An established connection is a closed set of named asynchronous
// operations. Callers look methods up by name and must handle a miss
// explicitly; there is no reflection or fallback dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;

use crate::error::{DispatchError, MethodError, NodeError};

/// A single named operation on a connection.
///
/// Receives the fully resolved argument list (device id first) and
/// yields the raw result value.
pub type Method =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, MethodError>> + Send + Sync>;

/// The resolved value of a connection handle.
pub struct Connection {
    methods: BTreeMap<String, Method>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::default()
    }

    /// Look up a capability by name.
    pub fn capability(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Names of every capability, in sorted order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Resolve `name` against the capability set and call it.
    ///
    /// A name outside the set fails with [`DispatchError::UnknownMethod`]
    /// without calling anything.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, NodeError> {
        let method = self
            .capability(name)
            .ok_or_else(|| DispatchError::UnknownMethod {
                method: name.to_owned(),
            })?;

        method(args).await.map_err(|source| NodeError::Invocation {
            method: name.to_owned(),
            source,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`Connection`].
#[derive(Default)]
pub struct ConnectionBuilder {
    methods: BTreeMap<String, Method>,
}

impl ConnectionBuilder {
    /// Register an operation. A later registration under the same name
    /// replaces the earlier one.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        let method: Method = Arc::new(move |args| f(args).boxed());
        self.methods.insert(name.into(), method);
        self
    }

    pub fn build(self) -> Connection {
        Connection {
            methods: self.methods,
        }
    }
}
