//! # Transfer Handlers
//!
//! Values that cannot be structurally cloned cross the boundary through a named
//! transfer handler. The registry is an ordered list: the first handler whose
//! `can_handle` matches wins, so registrations should not overlap.
//!
//! Two handlers are built in:
//!
//! - `PROXY` ([`ProxyHandler`]): proxy-eligible values. The sender opens a fresh
//!   channel, exposes the value on one end and ships the other end. The
//!   receiver turns that end into a [`Proxy`](crate::Proxy).
//! - `THROW` ([`ThrowHandler`]): thrown errors. Shipped as one string holding
//!   the description and trace, raised again as [`Error::RemoteThrow`].

use std::sync::Arc;
use std::sync::RwLock;

use tracing::debug;

use crate::bridge::Bridge;
use crate::error::Error;
use crate::error::Result;
use crate::port::MessageChannel;
use crate::value::Mark;
use crate::value::Value;
use crate::wire::RAW;

/// Registry name of the remote-object handler.
pub const PROXY: &str = "PROXY";
/// Registry name of the thrown-error handler.
pub const THROW: &str = "THROW";

/// Serializer and deserializer for one kind of non-cloneable value.
///
/// `serialize` must return something the channel can clone; ports inside the
/// payload are moved through the transfer list automatically.
pub trait TransferHandler: Send + Sync + 'static {
    fn can_handle(&self, value: &Value) -> bool;

    fn serialize(&self, value: Value, bridge: &Bridge) -> Result<Value>;

    fn deserialize(&self, payload: Value, bridge: &Bridge) -> Result<Value>;
}

/// Turns proxy-eligible values into live remote handles.
pub struct ProxyHandler;

impl TransferHandler for ProxyHandler {
    fn can_handle(&self, value: &Value) -> bool {
        value.mark() == Some(Mark::Proxy)
    }

    fn serialize(&self, value: Value, bridge: &Bridge) -> Result<Value> {
        let target = match value {
            Value::Marked(Mark::Proxy, inner) => *inner,
            other => other,
        };

        let (local, remote) = MessageChannel::pair();
        bridge.expose(target, local)?;
        debug!(port = remote.id(), "opened sub-channel for remote handle");
        Ok(Value::Port(remote))
    }

    fn deserialize(&self, payload: Value, bridge: &Bridge) -> Result<Value> {
        match payload {
            Value::Port(port) => Ok(Value::Proxy(bridge.proxy(port)?)),
            other => Err(Error::Protocol(format!(
                "{} payload must be a port, got {}",
                PROXY,
                other.kind()
            ))),
        }
    }
}

/// Carries thrown errors as text.
pub struct ThrowHandler;

impl ThrowHandler {
    fn text(value: &Value) -> String {
        match value {
            Value::Marked(_, inner) => Self::text(inner),
            Value::Error(e) => match &e.trace {
                Some(trace) => format!("{}\n{}", e.description, trace),
                None => e.description.clone(),
            },
            other => other.describe(),
        }
    }
}

impl TransferHandler for ThrowHandler {
    fn can_handle(&self, value: &Value) -> bool {
        value.mark() == Some(Mark::Thrown)
    }

    fn serialize(&self, value: Value, _bridge: &Bridge) -> Result<Value> {
        Ok(Value::Str(Self::text(&value)))
    }

    fn deserialize(&self, payload: Value, _bridge: &Bridge) -> Result<Value> {
        match payload {
            Value::Str(text) => Err(Error::RemoteThrow(text)),
            other => Err(Error::RemoteThrow(other.describe())),
        }
    }
}

type Entry = (String, Arc<dyn TransferHandler>);

/// Ordered, name-keyed set of transfer handlers. Clones share the same list.
#[derive(Clone)]
pub struct Registry {
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl Registry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// A registry holding `PROXY` then `THROW`.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        {
            let mut entries = registry.write();
            entries.push((PROXY.to_string(), Arc::new(ProxyHandler)));
            entries.push((THROW.to_string(), Arc::new(ThrowHandler)));
        }
        registry
    }

    /// Registers a handler. An existing name is replaced in place and keeps its
    /// precedence; a new name goes last.
    pub fn register(&self, name: &str, handler: Arc<dyn TransferHandler>) -> Result<()> {
        if name == RAW {
            return Err(Error::Protocol(format!("handler name {} is reserved", RAW)));
        }
        let mut entries = self.write();
        match entries.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = handler,
            None => entries.push((name.to_string(), handler)),
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|(existing, _)| existing != name);
        entries.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TransferHandler>> {
        self.read()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, handler)| handler.clone())
    }

    /// The first handler that can handle `value`, with its name.
    ///
    /// `can_handle` runs on a snapshot, outside the lock, so a handler may
    /// itself use the registry.
    pub fn find(&self, value: &Value) -> Option<(String, Arc<dyn TransferHandler>)> {
        let snapshot: Vec<Entry> = self.read().clone();
        snapshot.into_iter().find(|(_, handler)| handler.can_handle(value))
    }

    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|(name, _)| name.clone()).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
