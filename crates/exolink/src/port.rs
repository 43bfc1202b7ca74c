//! # In-Process Message Ports
//!
//! `MessageChannel::pair()` returns two entangled [`Port`]s. Whatever is posted
//! on one is delivered to the listeners of the other.
//!
//! ## Invariants
//!
//! - **Queue Until Started**: messages posted before the receiving port is
//!   started wait in its inbox and are delivered, in order, once it starts.
//! - **Clone Check**: a post is rejected with `DataClone` if the message holds
//!   anything live (objects, functions, proxies, marked values) or a port that
//!   is not in the transfer list.
//! - **Teardown Releases Listeners**: when the peer port goes away (last handle
//!   dropped, or `close()`), the delivery pump stops and drops every listener.
//!   Listeners may own a handle to their own port, so this is what ends those
//!   reference cycles.
//! - **Pump Follows Its Port**: dropping the last handle of a port stops its
//!   own pump too, which drops the inbox so the peer's posts start failing.
//! - **Disconnected Is Final**: once a pump has stopped, `post` fails with
//!   `ChannelClosed` and newly added listeners are dropped on the spot, so a
//!   waiter registered late still observes the teardown.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::endpoint::Capabilities;
use crate::endpoint::Endpoint;
use crate::endpoint::Listener;
use crate::endpoint::ListenerAction;
use crate::endpoint::ListenerId;
use crate::endpoint::Transferable;
use crate::error::Error;
use crate::error::Result;
use crate::value::Value;

/// Messages nested deeper than this are refused by the clone check. Bridges
/// cap their `max_depth` below it, see [`crate::bridge::DEPTH_CEILING`].
pub(crate) const CLONE_DEPTH_LIMIT: usize = 512;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

type Listeners = Arc<DashMap<ListenerId, Listener>>;

/// Factory for entangled port pairs.
pub struct MessageChannel;

impl MessageChannel {
    /// Creates two ports connected to each other.
    pub fn pair() -> (Port, Port) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        // a posts into b's inbox and vice versa
        let a = Port::from_parts(tx_b, rx_a);
        let b = Port::from_parts(tx_a, rx_b);
        debug!(a = a.id(), b = b.id(), "message channel created");
        (a, b)
    }
}

struct PortInner {
    id: u64,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    listeners: Listeners,
    next_listener: AtomicU64,
    shutdown: Arc<Notify>,
    disconnected: Arc<AtomicBool>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Drop for PortInner {
    fn drop(&mut self) {
        // the pump holds the inbox, not the port
        self.shutdown.notify_one();
    }
}

/// One end of a [`MessageChannel`]. Clones share the same end.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    fn from_parts(peer_tx: mpsc::UnboundedSender<Value>, inbox: mpsc::UnboundedReceiver<Value>) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
                peer_tx: Mutex::new(Some(peer_tx)),
                inbox: Mutex::new(Some(inbox)),
                listeners: Arc::new(DashMap::new()),
                next_listener: AtomicU64::new(1),
                shutdown: Arc::new(Notify::new()),
                disconnected: Arc::new(AtomicBool::new(false)),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether this port's delivery pump has stopped.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Disentangles this port. The peer observes the disconnect and releases
    /// its listeners; listeners on this port are released immediately.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.inner.peer_tx).take();
        lock(&self.inner.inbox).take();
        self.inner.shutdown.notify_one();
        self.inner.listeners.clear();
        debug!(port = self.id(), "port closed");
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn check_clone(&self, message: &Value, transfer: &[Transferable]) -> Result<()> {
        let listed: HashSet<usize> = transfer
            .iter()
            .filter(|t| matches!(t, Transferable::Port(_)))
            .map(Transferable::identity)
            .collect();

        for item in transfer {
            if let Transferable::Port(port) = item {
                if port.identity() == self.identity() {
                    return Err(Error::DataClone("a port cannot transfer itself".into()));
                }
            }
        }

        check_cloneable(message, &listed, 0)
    }
}

fn check_cloneable(value: &Value, listed: &HashSet<usize>, depth: usize) -> Result<()> {
    if depth > CLONE_DEPTH_LIMIT {
        return Err(Error::DepthLimitExceeded(CLONE_DEPTH_LIMIT));
    }
    match value {
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Str(_)
        | Value::Bytes(_)
        | Value::Error(_) => Ok(()),
        Value::Port(port) => {
            if listed.contains(&port.identity()) {
                Ok(())
            } else {
                Err(Error::DataClone(format!("{:?} is not in the transfer list", port)))
            }
        }
        Value::List(items) => items.iter().try_for_each(|item| check_cloneable(item, listed, depth + 1)),
        Value::Map(fields) => fields.values().try_for_each(|item| check_cloneable(item, listed, depth + 1)),
        other => Err(Error::DataClone(format!("{:?} could not be cloned", other))),
    }
}

impl Endpoint for Port {
    fn post(&self, message: Value, transfer: Vec<Transferable>) -> Result<()> {
        if self.is_closed() || self.is_disconnected() {
            return Err(Error::ChannelClosed);
        }
        self.check_clone(&message, &transfer)?;

        let guard = lock(&self.inner.peer_tx);
        let Some(tx) = guard.as_ref() else {
            return Err(Error::ChannelClosed);
        };
        tx.send(message).map_err(|_| Error::ChannelClosed)?;
        trace!(port = self.id(), transferred = transfer.len(), "message posted");
        Ok(())
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        if self.is_closed() {
            return id;
        }
        self.inner.listeners.insert(id, listener);
        // pairs with the flag store in `Release::drop`: either the pump's final
        // clear sees this entry, or this check sees the flag
        if self.is_disconnected() {
            self.inner.listeners.remove(&id);
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }

    fn start(&self) {
        if self.is_closed() || self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(inbox) = lock(&self.inner.inbox).take() else {
            return;
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(port = self.id(), "cannot start port outside a runtime: {}", e);
                *lock(&self.inner.inbox) = Some(inbox);
                self.inner.started.store(false, Ordering::Release);
                return;
            }
        };

        let port = self.id();
        let listeners = self.inner.listeners.clone();
        let shutdown = self.inner.shutdown.clone();
        let disconnected = self.inner.disconnected.clone();
        handle.spawn(pump(port, inbox, listeners, shutdown, disconnected));
        debug!(port, "port started");
    }

    fn capabilities(&self) -> Capabilities {
        if self.is_closed() {
            Capabilities::NONE
        } else {
            Capabilities::FULL
        }
    }
}

/// Delivers inbound messages to the listeners, in registration order.
///
/// Holds only the inbox and the listener table, never the port itself, so it
/// cannot keep its own port alive.
async fn pump(
    port: u64,
    mut inbox: mpsc::UnboundedReceiver<Value>,
    listeners: Listeners,
    shutdown: Arc<Notify>,
    disconnected: Arc<AtomicBool>,
) {
    // also runs if the pump is cancelled by its runtime shutting down
    let _release = Release {
        port,
        listeners: listeners.clone(),
        disconnected,
    };

    loop {
        let message = tokio::select! {
            message = inbox.recv() => message,
            _ = shutdown.notified() => None,
        };
        let Some(message) = message else {
            break;
        };

        let mut snapshot: Vec<(ListenerId, Listener)> = listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);

        for (id, listener) in snapshot {
            // an earlier listener may have removed this one
            if !listeners.contains_key(&id) {
                continue;
            }
            if listener(&message) == ListenerAction::Remove {
                listeners.remove(&id);
            }
        }
    }
}

struct Release {
    port: u64,
    listeners: Listeners,
    disconnected: Arc<AtomicBool>,
}

impl Drop for Release {
    fn drop(&mut self) {
        self.disconnected.store(true, Ordering::SeqCst);
        let dropped = self.listeners.len();
        self.listeners.clear();
        debug!(port = self.port, dropped, "port disconnected, listeners released");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Port({})", self.inner.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::value::Function;

    fn collector() -> (Listener, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |message: &Value| {
            let _ = tx.send(message.clone());
            ListenerAction::Keep
        });
        (listener, rx)
    }

    #[tokio::test]
    async fn test_messages_queue_until_started() {
        let (a, b) = MessageChannel::pair();
        a.post(Value::Int(1), vec![]).unwrap();
        a.post(Value::Int(2), vec![]).unwrap();

        let (listener, mut rx) = collector();
        b.add_listener(listener);
        b.start();

        assert_eq!(rx.recv().await, Some(Value::Int(1)));
        assert_eq!(rx.recv().await, Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn test_one_shot_listener_removes_itself() {
        let (a, b) = MessageChannel::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.add_listener(Arc::new(move |message: &Value| {
            let _ = tx.send(message.clone());
            ListenerAction::Remove
        }));
        b.start();

        a.post(Value::from("first"), vec![]).unwrap();
        assert_eq!(rx.recv().await, Some(Value::from("first")));
        assert_eq!(b.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_live_values_are_not_cloneable() {
        let (a, _b) = MessageChannel::pair();
        let f = Function::sync("f", |_, _| Ok(Value::Null));
        let err = a.post(Value::List(vec![f.into()]), vec![]).unwrap_err();
        assert!(matches!(err, Error::DataClone(_)));
    }

    #[tokio::test]
    async fn test_ports_must_be_transferred() {
        let (a, _b) = MessageChannel::pair();
        let (c, _d) = MessageChannel::pair();

        let err = a.post(Value::Port(c.clone()), vec![]).unwrap_err();
        assert!(matches!(err, Error::DataClone(_)));

        a.post(Value::Port(c.clone()), vec![Transferable::Port(c)]).unwrap();
    }

    #[tokio::test]
    async fn test_dropping_peer_releases_listeners() {
        let (a, b) = MessageChannel::pair();
        let (listener, mut rx) = collector();
        b.add_listener(listener);
        b.start();

        drop(a);
        // the collector's sender is dropped along with the listener
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(closed, None);
        assert_eq!(b.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_a_port_stops_its_own_pump() {
        let (a, b) = MessageChannel::pair();
        let (listener, mut rx) = collector();
        a.add_listener(listener);
        a.start();

        drop(a);
        let released = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(released, None);
        assert_eq!(b.post(Value::Int(1), vec![]).unwrap_err(), Error::ChannelClosed);
    }

    #[tokio::test]
    async fn test_listener_added_after_disconnect_is_dropped() {
        let (a, b) = MessageChannel::pair();
        b.start();
        drop(a);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !b.is_disconnected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let (listener, mut rx) = collector();
        b.add_listener(listener);
        assert_eq!(b.listener_count(), 0);
        assert_eq!(rx.recv().await, None);
        assert_eq!(b.post(Value::Null, vec![]).unwrap_err(), Error::ChannelClosed);
    }

    #[tokio::test]
    async fn test_closed_port_reports_no_capabilities() {
        let (a, b) = MessageChannel::pair();
        a.close();
        assert_eq!(a.capabilities(), Capabilities::NONE);
        assert_eq!(a.post(Value::Null, vec![]).unwrap_err(), Error::ChannelClosed);
        assert_eq!(b.post(Value::Null, vec![]).unwrap_err(), Error::ChannelClosed);
    }
}
