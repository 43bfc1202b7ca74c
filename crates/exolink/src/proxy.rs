//! # Call-Path Proxy
//!
//! A client-side handle onto an object exposed on the other side of an endpoint.
//!
//! ## Philosophy
//!
//! A `Proxy` is an immutable call path plus the endpoint it forwards to.
//! [`Proxy::access`] only extends the path; nothing is sent until an operation
//! needs an answer:
//!
//! | operation              | request     | call path       |
//! |------------------------|-------------|-----------------|
//! | `call(args)`           | `APPLY`     | path            |
//! | `construct(args)`      | `CONSTRUCT` | path            |
//! | `resolve_value()`      | `GET`       | path (may be empty) |
//! | `get_property(name)`   | `GET`       | path + name     |
//! | `set_property(name, v)`| `SET`       | path + name     |
//!
//! Arguments go through the codec one by one. Assigned values do not: they must
//! already be plain data.

use std::sync::Arc;

use crate::bridge::Bridge;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::error::Result;
use crate::exchange;
use crate::value::Value;
use crate::wire::Op;
use crate::wire::Request;

/// Trailing path segment that rebinds locally instead of calling remotely.
pub const BIND: &str = "bind";

#[derive(Clone)]
pub struct Proxy {
    bridge: Bridge,
    endpoint: Arc<dyn Endpoint>,
    path: Arc<[String]>,
}

impl Proxy {
    pub(crate) fn new(bridge: Bridge, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            bridge,
            endpoint,
            path: Arc::from(Vec::new()),
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    /// A proxy for member `name`. Sends nothing.
    pub fn access(&self, name: &str) -> Proxy {
        let mut path = self.path.to_vec();
        path.push(name.to_string());
        self.with_path(path)
    }

    /// Calls the member at this path with the path's parent as receiver.
    ///
    /// A trailing `bind` segment is not forwarded: the call returns the parent
    /// proxy itself.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        if let Some((last, parent)) = self.path.split_last() {
            if last == BIND {
                return Ok(Value::Proxy(self.with_path(parent.to_vec())));
            }
        }
        if self.path.is_empty() {
            return Err(Error::EmptyCallPath);
        }

        let request = Request::new(Op::Apply, self.path.to_vec()).arguments(self.wrap_all(args)?);
        self.round_trip(request).await
    }

    /// Constructs an instance remotely. Instances always come back as live
    /// remote handles.
    pub async fn construct(&self, args: Vec<Value>) -> Result<Proxy> {
        if self.path.is_empty() {
            return Err(Error::EmptyCallPath);
        }

        let request = Request::new(Op::Construct, self.path.to_vec()).arguments(self.wrap_all(args)?);
        match self.round_trip(request).await? {
            Value::Proxy(instance) => Ok(instance),
            other => Err(Error::Protocol(format!(
                "constructor returned a {} instead of a remote handle",
                other.kind()
            ))),
        }
    }

    /// Reads member `name`.
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        self.access(name).resolve_value().await
    }

    /// Assigns member `name`. `value` is sent as-is and must be cloneable.
    pub async fn set_property(&self, name: &str, value: impl Into<Value>) -> Result<bool> {
        let mut path = self.path.to_vec();
        path.push(name.to_string());

        let request = Request::new(Op::Set, path).assign(name, value.into());
        let acknowledged = self.round_trip(request).await?;
        Ok(acknowledged.as_bool().unwrap_or(false))
    }

    /// Fetches the value at this path.
    pub async fn resolve_value(&self) -> Result<Value> {
        let request = Request::new(Op::Get, self.path.to_vec());
        self.round_trip(request).await
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.path) as *const String as usize
    }

    fn with_path(&self, path: Vec<String>) -> Proxy {
        Proxy {
            bridge: self.bridge.clone(),
            endpoint: self.endpoint.clone(),
            path: Arc::from(path),
        }
    }

    fn wrap_all(&self, args: Vec<Value>) -> Result<Vec<crate::wire::WireValue>> {
        let codec = self.bridge.codec();
        args.into_iter().map(|arg| codec.wrap(arg)).collect()
    }

    async fn round_trip(&self, request: Request) -> Result<Value> {
        let response = exchange::send(
            self.endpoint.as_ref(),
            self.bridge.ids(),
            request,
            self.bridge.options().max_depth,
        )
        .await?;
        self.bridge.codec().unwrap(response.value)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Proxy({})", self.path.join("."))
    }
}
