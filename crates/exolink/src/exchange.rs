//! # Request/Response Exchange
//!
//! Correlates each outbound request with its response by id.
//!
//! ## Invariants
//!
//! - Ids are `seed-counter`: a per-bridge random seed and a strictly increasing
//!   counter. Every id is used once.
//! - The one-shot listener is registered before the request is posted, so an
//!   immediate response cannot be missed. It removes itself on the matching
//!   delivery and ignores every other message.
//! - No timeout. If the endpoint tears down first, the listener is dropped and
//!   the caller gets `ChannelClosed`. If the caller stops waiting, the guard
//!   deregisters the listener and any late response is never matched.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::trace;

use crate::endpoint::Endpoint;
use crate::endpoint::ListenerAction;
use crate::endpoint::ListenerId;
use crate::endpoint::transferables;
use crate::error::Error;
use crate::error::Result;
use crate::value::Value;
use crate::wire::ENVELOPE_DEPTH;
use crate::wire::Request;
use crate::wire::Response;
use crate::wire::message_id;

/// Produces request ids unique to one bridge.
#[derive(Debug)]
pub struct IdGenerator {
    seed: u64,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(0),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{}", self.seed, n)
    }
}

/// Deregisters a listener when the waiting side goes away.
struct ListenerGuard<'a> {
    endpoint: &'a dyn Endpoint,
    id: ListenerId,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.endpoint.remove_listener(self.id);
    }
}

/// Sends `request` and waits for the response carrying its id.
pub(crate) async fn send(
    endpoint: &dyn Endpoint,
    ids: &IdGenerator,
    mut request: Request,
    max_depth: usize,
) -> Result<Response> {
    let id = ids.next_id();
    request.id = id.clone();
    let op = request.op;
    let message = request.into_value();
    let transfer = transferables(&message, max_depth + ENVELOPE_DEPTH)?;

    let (tx, rx) = oneshot::channel::<Value>();
    let slot = Mutex::new(Some(tx));
    let expected = id.clone();
    let listener = Arc::new(move |message: &Value| {
        if message_id(message) != Some(expected.as_str()) {
            return ListenerAction::Keep;
        }
        let sender = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(sender) = sender {
            let _ = sender.send(message.clone());
        }
        ListenerAction::Remove
    });

    let _guard = ListenerGuard {
        endpoint,
        id: endpoint.add_listener(listener),
    };
    endpoint.post(message, transfer)?;
    trace!(id = %id, op = %op, "request sent");

    let reply = rx.await.map_err(|_| Error::ChannelClosed)?;
    trace!(id = %id, "response received");
    Response::from_value(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::port::MessageChannel;
    use crate::wire::Op;
    use crate::wire::WireValue;

    #[test]
    fn test_ids_are_distinct() {
        let ids = IdGenerator::new(0xfeed);
        let generated: HashSet<String> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(generated.len(), 10_000);
        assert!(generated.contains("feed-0"));
    }

    #[tokio::test]
    async fn test_matching_response_resolves_and_others_are_ignored() {
        let (client, server) = MessageChannel::pair();
        client.start();

        // answer with a stray response first, then the real one
        let responder = server.clone();
        server.add_listener(Arc::new(move |message: &Value| {
            let Some(id) = message_id(message) else {
                return ListenerAction::Keep;
            };
            let stray = Response {
                id: "nobody-0".into(),
                value: WireValue::raw("stray"),
            };
            let real = Response {
                id: id.to_string(),
                value: WireValue::raw("pong"),
            };
            responder.post(stray.into_value(), vec![]).unwrap();
            responder.post(real.into_value(), vec![]).unwrap();
            ListenerAction::Keep
        }));
        server.start();

        let ids = IdGenerator::new(1);
        let request = Request::new(Op::Get, vec!["ping".into()]);
        let response = send(&client, &ids, request, 16).await.unwrap();
        assert_eq!(response.id, "1-0");
        assert_eq!(response.value, WireValue::raw("pong"));
        assert_eq!(client.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_request() {
        let (client, server) = MessageChannel::pair();
        client.start();

        let ids = IdGenerator::new(2);
        let pending = tokio::spawn({
            let client = client.clone();
            async move {
                let request = Request::new(Op::Get, vec![]);
                send(&client, &ids, request, 16).await
            }
        });

        tokio::task::yield_now().await;
        drop(server);
        assert_eq!(pending.await.unwrap().unwrap_err(), Error::ChannelClosed);
    }
}
