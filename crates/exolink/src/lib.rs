//! # exolink
//!
//! Transparent remote-object proxies over message endpoints.
//!
//! One context exposes a root value on an endpoint; another context wraps the
//! other end in a [`Proxy`] and reads, assigns, calls and constructs members of
//! that root as if it were local. Each operation becomes a request message and
//! resolves when the response carrying the same id comes back.
//!
//! ```text
//!  caller                                  exposing side
//!  Proxy ──APPLY {id, callPath, args}──▶   Dispatcher ─▶ root.a.b(args)
//!        ◀──────── {id, value} ─────────   (wrapped result or thrown error)
//! ```
//!
//! Live values cross the boundary only when marked with [`proxy_value`]: the
//! sender then opens a dedicated channel, serves the value on it, and the
//! receiver gets a proxy onto it.

pub mod bridge;
pub mod codec;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod handler;
pub mod port;
pub mod proxy;
pub mod value;
pub mod wire;
pub mod worker;

pub use bridge::Bridge;
pub use bridge::BridgeBuilder;
pub use bridge::Options;
pub use codec::Codec;
pub use dispatch::Dispatcher;
pub use endpoint::Endpoint;
pub use endpoint::ListenerAction;
pub use endpoint::ListenerId;
pub use endpoint::Transferable;
pub use error::Error;
pub use error::Result;
pub use handler::Registry;
pub use handler::TransferHandler;
pub use port::MessageChannel;
pub use port::Port;
pub use proxy::Proxy;
pub use value::Buffer;
pub use value::Exception;
pub use value::Function;
pub use value::Object;
pub use value::Record;
pub use value::Value;
pub use wire::WireValue;
pub use worker::Worker;

/// Marks a value so that crossing the boundary yields a live remote handle.
pub fn proxy_value(value: impl Into<Value>) -> Value {
    Value::proxied(value)
}
