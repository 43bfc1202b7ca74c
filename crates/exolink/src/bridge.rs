//! # Bridge
//!
//! The per-context handle. It owns the transfer handler registry, the request id
//! generator and the options, and is where proxies and dispatchers come from.
//! Clones share everything.

use std::sync::Arc;

use tracing::debug;

use crate::codec::Codec;
use crate::dispatch::Dispatcher;
use crate::endpoint::Endpoint;
use crate::endpoint::check_contract;
use crate::error::Error;
use crate::error::Result;
use crate::exchange::IdGenerator;
use crate::handler::Registry;
use crate::handler::TransferHandler;
use crate::port::CLONE_DEPTH_LIMIT;
use crate::proxy::Proxy;
use crate::value::Value;
use crate::wire::ENVELOPE_DEPTH;

/// Largest accepted `max_depth`. A value nested this deep still fits, with its
/// request envelope, under the in-process clone check.
pub const DEPTH_CEILING: usize = CLONE_DEPTH_LIMIT - ENVELOPE_DEPTH;

/// Tunables for one bridge.
#[derive(Clone, Debug)]
pub struct Options {
    /// Deepest nesting the codec will traverse.
    pub max_depth: usize,
    /// Seed part of every request id.
    pub seed: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_depth: 64,
            seed: rand::random(),
        }
    }
}

struct BridgeInner {
    registry: Registry,
    ids: IdGenerator,
    options: Options,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// A bridge with default options and the built-in handlers.
    pub fn new() -> Self {
        Self::from_parts(Options::default(), Registry::with_builtins())
    }

    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    fn from_parts(options: Options, registry: Registry) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                registry,
                ids: IdGenerator::new(options.seed),
                options,
            }),
        }
    }

    /// Wraps `endpoint` in a root proxy. Starts the endpoint.
    pub fn proxy<E: Endpoint>(&self, endpoint: E) -> Result<Proxy> {
        check_contract(&endpoint, "proxy")?;
        endpoint.start();
        Ok(Proxy::new(self.clone(), Arc::new(endpoint)))
    }

    /// Serves `root` on `endpoint` until the endpoint tears down or the
    /// returned dispatcher is closed. Starts the endpoint.
    pub fn expose<E: Endpoint>(&self, root: impl Into<Value>, endpoint: E) -> Result<Dispatcher> {
        check_contract(&endpoint, "exposed")?;
        Dispatcher::attach(self.clone(), root.into(), Arc::new(endpoint))
    }

    pub fn codec(&self) -> Codec<'_> {
        Codec::new(self)
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn TransferHandler>) -> Result<()> {
        self.inner.registry.register(name, handler)?;
        debug!(handler = name, "transfer handler registered");
        Ok(())
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub(crate) fn ids(&self) -> &IdGenerator {
        &self.inner.ids
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("seed", &format_args!("{:x}", self.inner.ids.seed()))
            .field("max_depth", &self.inner.options.max_depth)
            .field("handlers", &self.inner.registry)
            .finish()
    }
}

/// Fluent builder for a [`Bridge`].
pub struct BridgeBuilder {
    options: Options,
    handlers: Vec<(String, Arc<dyn TransferHandler>)>,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            handlers: Vec::new(),
        }
    }

    /// At most [`DEPTH_CEILING`]; `build` refuses anything larger.
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.options.max_depth = max_depth;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.options.seed = seed;
        self
    }

    /// Registers a handler after the built-ins, or replaces one by name.
    pub fn handler(mut self, name: &str, handler: Arc<dyn TransferHandler>) -> Self {
        self.handlers.push((name.to_string(), handler));
        self
    }

    pub fn build(self) -> Result<Bridge> {
        if self.options.max_depth > DEPTH_CEILING {
            return Err(Error::DepthLimitExceeded(DEPTH_CEILING));
        }
        let registry = Registry::with_builtins();
        for (name, handler) in self.handlers {
            registry.register(&name, handler)?;
        }
        Ok(Bridge::from_parts(self.options, registry))
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
