//! # Endpoint Abstraction
//!
//! A minimal interface for moving structured messages between execution contexts.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: The Endpoint knows nothing about requests, responses or
//!   call paths. It moves `Value` messages plus a transfer list.
//! - **Listener-Driven**: Delivery is push-based. Every registered listener sees
//!   every message, in order, and decides for itself whether it cares.
//! - **One-Shot Friendly**: A listener can ask to be removed in the same delivery
//!   that satisfied it, so correlation listeners never outlive their response.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;
use crate::port::Port;
use crate::value::Buffer;
use crate::value::Value;

/// Handle returned by [`Endpoint::add_listener`], used to deregister.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// What a listener wants after seeing a message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerAction {
    Keep,
    Remove,
}

/// A message listener. Runs synchronously on the delivery path and must not block.
pub type Listener = Arc<dyn Fn(&Value) -> ListenerAction + Send + Sync>;

/// Which halves of the endpoint contract are available.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub send: bool,
    pub listen: bool,
}

impl Capabilities {
    pub const FULL: Self = Self { send: true, listen: true };
    pub const NONE: Self = Self { send: false, listen: false };
}

/// A value the host moves rather than copies.
#[derive(Clone, Debug)]
pub enum Transferable {
    Port(Port),
    Bytes(Buffer),
}

impl Transferable {
    pub fn identity(&self) -> usize {
        match self {
            Self::Port(port) => port.identity(),
            Self::Bytes(buffer) => buffer.identity(),
        }
    }
}

/// A bidirectional message boundary.
///
/// This trait is designed to be object-safe (`Arc<dyn Endpoint>`).
pub trait Endpoint: Send + Sync + 'static {
    /// Posts a message to the other side.
    ///
    /// # invariants
    /// - Every port embedded in `message` must also appear in `transfer`.
    /// - Must not block waiting for the other side.
    fn post(&self, message: Value, transfer: Vec<Transferable>) -> Result<()>;

    /// Registers a listener for inbound messages.
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Deregisters a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Begins delivery of queued and future messages. Idempotent.
    fn start(&self) {}

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }
}

impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn post(&self, message: Value, transfer: Vec<Transferable>) -> Result<()> {
        (**self).post(message, transfer)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        (**self).add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        (**self).remove_listener(id)
    }

    fn start(&self) {
        (**self).start()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }
}

/// Rejects endpoints that cannot both send and listen.
pub(crate) fn check_contract(endpoint: &dyn Endpoint, role: &str) -> Result<()> {
    let caps = endpoint.capabilities();
    if !caps.send {
        return Err(Error::EndpointContractViolation(format!(
            "{} endpoint cannot send messages",
            role
        )));
    }
    if !caps.listen {
        return Err(Error::EndpointContractViolation(format!(
            "{} endpoint cannot receive messages",
            role
        )));
    }
    Ok(())
}

/// Lists every transferable leaf in `value`, each exactly once.
///
/// Shared handles are visited once by identity, so a port or buffer that is
/// referenced from several places is only listed once.
pub fn transferables(value: &Value, max_depth: usize) -> Result<Vec<Transferable>> {
    let mut found = Vec::new();
    let mut visited = HashSet::new();
    scan(value, 0, max_depth, &mut visited, &mut found)?;
    Ok(found)
}

fn scan(
    value: &Value,
    depth: usize,
    max_depth: usize,
    visited: &mut HashSet<usize>,
    found: &mut Vec<Transferable>,
) -> Result<()> {
    if depth > max_depth {
        return Err(Error::DepthLimitExceeded(max_depth));
    }
    if let Some(identity) = value.identity() {
        if !visited.insert(identity) {
            return Ok(());
        }
    }

    match value {
        Value::Port(port) => found.push(Transferable::Port(port.clone())),
        Value::Bytes(buffer) => found.push(Transferable::Bytes(buffer.clone())),
        Value::List(items) => {
            for item in items {
                scan(item, depth + 1, max_depth, visited, found)?;
            }
        }
        Value::Map(fields) => {
            for item in fields.values() {
                scan(item, depth + 1, max_depth, visited, found)?;
            }
        }
        Value::Marked(_, inner) => scan(inner, depth + 1, max_depth, visited, found)?,
        _ => {}
    }
    Ok(())
}
