//! # Dispatcher
//!
//! The exposing side. Listens on an endpoint, resolves each request's call path
//! against a root value, performs the operation and posts the outcome back.
//!
//! ## Invariants
//!
//! - Messages without an `id` or a `callPath` are ignored.
//! - Every request gets exactly one response. Failures of any kind (a bad path,
//!   a malformed request, a throwing member, an uncloneable result) are answered
//!   with a thrown error, and only affect that one request.
//! - Each request runs in its own task, so a slow call never holds up others.
//! - Constructed instances are always returned as remote handles.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::debug;
use tracing::warn;

use crate::bridge::Bridge;
use crate::endpoint::Endpoint;
use crate::endpoint::Listener;
use crate::endpoint::ListenerAction;
use crate::endpoint::ListenerId;
use crate::endpoint::transferables;
use crate::error::Error;
use crate::error::Result;
use crate::value::Exception;
use crate::value::Value;
use crate::wire::ENVELOPE_DEPTH;
use crate::wire::Op;
use crate::wire::Request;
use crate::wire::Response;
use crate::wire::message_id;

/// A root value being served on an endpoint.
///
/// Dropping the dispatcher does not stop it. Serving ends when the endpoint
/// tears down or [`Dispatcher::close`] is called.
pub struct Dispatcher {
    endpoint: Arc<dyn Endpoint>,
    listener: ListenerId,
}

impl Dispatcher {
    pub(crate) fn attach(bridge: Bridge, root: Value, endpoint: Arc<dyn Endpoint>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Runtime(e.to_string()))?;

        let responder = endpoint.clone();
        let listener: Listener = Arc::new(move |message: &Value| {
            if !Request::is_request(message) {
                return ListenerAction::Keep;
            }
            let Some(id) = message_id(message).map(str::to_string) else {
                return ListenerAction::Keep;
            };
            let parsed = Request::from_value(message);
            runtime.spawn(serve(
                bridge.clone(),
                root.clone(),
                responder.clone(),
                id,
                parsed,
            ));
            ListenerAction::Keep
        });

        let listener = endpoint.add_listener(listener);
        endpoint.start();
        debug!(%listener, "root exposed");
        Ok(Self { endpoint, listener })
    }

    /// Stops serving. Requests already running still answer.
    pub fn close(&self) -> bool {
        self.endpoint.remove_listener(self.listener)
    }
}

async fn serve(bridge: Bridge, root: Value, endpoint: Arc<dyn Endpoint>, id: String, parsed: Result<Request>) {
    let outcome = match parsed {
        Ok(request) => {
            debug!(id = %id, op = %request.op, path = ?request.call_path, "request received");
            match execute(&bridge, &root, request).await {
                Ok(value) => value,
                Err(exception) => Value::thrown(exception),
            }
        }
        Err(e) => {
            warn!(id = %id, "malformed request: {}", e);
            Value::thrown(Exception::from(e))
        }
    };
    respond(&bridge, endpoint.as_ref(), id, outcome);
}

/// Performs one request. A thrown member surfaces as `Err`.
async fn execute(bridge: &Bridge, root: &Value, request: Request) -> std::result::Result<Value, Exception> {
    let path = request.call_path;

    let Some((name, parents)) = path.split_last() else {
        return match request.op {
            Op::Get => Ok(root.clone()),
            _ => Err(Exception::from(Error::EmptyCallPath)),
        };
    };
    let that = walk(root, parents).await?;

    match request.op {
        Op::Get => that.get(name).await,
        Op::Set => {
            let property = request.property.as_deref().unwrap_or(name);
            that.set(property, request.value.unwrap_or(Value::Null)).await?;
            Ok(Value::Bool(true))
        }
        Op::Apply => {
            let target = that.get(name).await?;
            let args = unwrap_all(bridge, request.arguments)?;
            match strip(target) {
                Value::Function(f) => f.call(that, args).await,
                Value::Proxy(remote) => Ok(remote.call(args).await?),
                other => Err(Exception::new(format!("'{}' is a {}, not a function", path.join("."), other.kind()))),
            }
        }
        Op::Construct => {
            let target = that.get(name).await?;
            let args = unwrap_all(bridge, request.arguments)?;
            match strip(target) {
                Value::Function(f) => Ok(Value::proxied(f.construct(args).await?)),
                Value::Proxy(remote) => Ok(Value::proxied(remote.construct(args).await?)),
                other => Err(Exception::new(format!(
                    "'{}' is a {}, not a constructor",
                    path.join("."),
                    other.kind()
                ))),
            }
        }
    }
}

async fn walk(root: &Value, segments: &[String]) -> std::result::Result<Value, Exception> {
    let mut current = root.clone();
    for segment in segments {
        current = current.get(segment).await?;
    }
    Ok(current)
}

fn strip(value: Value) -> Value {
    match value {
        Value::Marked(_, inner) => strip(*inner),
        other => other,
    }
}

fn unwrap_all(bridge: &Bridge, arguments: Vec<crate::wire::WireValue>) -> Result<Vec<Value>> {
    let codec = bridge.codec();
    arguments.into_iter().map(|arg| codec.unwrap(arg)).collect()
}

/// Posts the response for `id`. If the outcome cannot be encoded or cloned, a
/// thrown error saying so is posted instead.
fn respond(bridge: &Bridge, endpoint: &dyn Endpoint, id: String, outcome: Value) {
    let first = encode(bridge, id.clone(), outcome).and_then(|(message, transfer)| endpoint.post(message, transfer));
    let Err(e) = first else {
        return;
    };
    if e == Error::ChannelClosed {
        debug!(id = %id, "endpoint closed before the response could be posted");
        return;
    }

    warn!(id = %id, "result could not be sent: {}", e);
    let fallback = Value::thrown(Exception::new(format!("result could not be sent: {}", e)));
    let second = encode(bridge, id.clone(), fallback).and_then(|(message, transfer)| endpoint.post(message, transfer));
    if let Err(e) = second {
        warn!(id = %id, "error response could not be sent: {}", e);
    }
}

fn encode(bridge: &Bridge, id: String, outcome: Value) -> Result<(Value, Vec<crate::endpoint::Transferable>)> {
    let value = bridge.codec().dispatch(outcome)?;
    let message = Response { id, value }.into_value();
    let transfer = transferables(&message, bridge.options().max_depth + ENVELOPE_DEPTH)?;
    Ok((message, transfer))
}
