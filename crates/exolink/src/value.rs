//! # Value model
//!
//! Everything that crosses an endpoint, or lives behind one, is a `Value`.
//!
//! ## Philosophy
//!
//! - **Data vs. Live**: `Null` through `Error` are plain data the channel can
//!   structurally clone. `Object`, `Function`, `Proxy` and `Marked` are live and
//!   never cloned; they cross the boundary only through a transfer handler.
//! - **Identity**: shared handles (`Bytes`, `Port`, `Object`, `Function`, `Proxy`)
//!   carry a pointer identity. Traversals use it as their visited-set key.
//! - **Opt-in Marks**: a live object becomes a remote handle only when exposed
//!   code marks it with [`Value::proxied`]. A thrown error is flagged with
//!   [`Value::thrown`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::port::Port;
use crate::proxy::Proxy;

/// A binary buffer. Clones share storage; the codec treats it as a leaf.
#[derive(Clone, PartialEq, Eq)]
pub struct Buffer(Arc<[u8]>);

impl Buffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.0.len())
    }
}

/// Opt-in markers set by exposing code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mark {
    /// Crossing the boundary yields a live remote handle instead of a copy.
    Proxy,
    /// This is a thrown error, not a normal result.
    Thrown,
}

/// An error raised by exposed code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exception {
    pub description: String,
    pub trace: Option<String>,
}

impl Exception {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

impl std::error::Error for Exception {}

impl From<Error> for Exception {
    fn from(e: Error) -> Self {
        match e {
            // keep the remote text verbatim when rethrowing across a second hop
            Error::RemoteThrow(text) => Self::new(text),
            other => Self::new(other.to_string()),
        }
    }
}

impl From<&str> for Exception {
    fn from(description: &str) -> Self {
        Self::new(description)
    }
}

impl From<String> for Exception {
    fn from(description: String) -> Self {
        Self::new(description)
    }
}

type Callable = dyn Fn(Value, Vec<Value>) -> BoxFuture<'static, Result<Value, Exception>> + Send + Sync;

/// A callable member of an exposed object.
///
/// The first argument is the receiver (`this`): the container the function was
/// resolved from, or `Null` when invoked as a constructor.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    body: Arc<Callable>,
}

impl Function {
    pub fn new<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Exception>> + Send + 'static,
    {
        let body: Arc<Callable> = Arc::new(move |this: Value, args: Vec<Value>| -> BoxFuture<'static, Result<Value, Exception>> {
            Box::pin(f(this, args))
        });
        Self { name: Arc::from(name), body }
    }

    /// Wraps a synchronous closure.
    pub fn sync<F>(name: &str, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        Self::new(name, move |this, args| {
            let outcome = f(this, args);
            async move { outcome }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invokes the function with `this` as receiver.
    pub async fn call(&self, this: Value, args: Vec<Value>) -> Result<Value, Exception> {
        (self.body)(this, args).await
    }

    /// Invokes the function as a constructor. The return value is the instance.
    pub async fn construct(&self, args: Vec<Value>) -> Result<Value, Exception> {
        (self.body)(Value::Null, args).await
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.body) as *const () as usize
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.name)
    }
}

/// A live object whose members can be read and assigned.
///
/// Reading a member that does not exist yields `Null`.
#[async_trait::async_trait]
pub trait Object: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Value, Exception>;

    async fn set(&self, name: &str, _value: Value) -> Result<(), Exception> {
        Err(Exception::new(format!("cannot assign to read-only property '{}'", name)))
    }
}

pub type ObjectRef = Arc<dyn Object>;

/// A map-backed object with interior mutability.
///
/// Function members receive the record itself as their receiver, so
/// `this.get(..)` and `this.set(..)` reach the record's own fields.
#[derive(Default)]
pub struct Record {
    fields: RwLock<BTreeMap<String, Value>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.get_mut().insert(name.into(), value.into());
        self
    }

    /// Adds a synchronous method, builder style.
    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(Value, Vec<Value>) -> Result<Value, Exception> + Send + Sync + 'static,
    {
        self.with(name, Function::sync(name, f))
    }

    /// Copies out the current field values.
    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        self.fields.read().await.clone()
    }

    pub fn into_value(self) -> Value {
        Value::Object(Arc::new(self))
    }
}

#[async_trait::async_trait]
impl Object for Record {
    async fn get(&self, name: &str) -> Result<Value, Exception> {
        Ok(self.fields.read().await.get(name).cloned().unwrap_or(Value::Null))
    }

    async fn set(&self, name: &str, value: Value) -> Result<(), Exception> {
        self.fields.write().await.insert(name.to_string(), value);
        Ok(())
    }
}

/// A value crossing, or living behind, an endpoint.
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Buffer),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Error data. Becomes a thrown error only when marked.
    Error(Exception),
    Port(Port),
    Object(ObjectRef),
    Function(Function),
    Proxy(Proxy),
    Marked(Mark, Box<Value>),
}

impl Value {
    /// Marks a value as proxy-eligible.
    pub fn proxied(value: impl Into<Value>) -> Self {
        match value.into() {
            marked @ Value::Marked(Mark::Proxy, _) => marked,
            other => Value::Marked(Mark::Proxy, Box::new(other)),
        }
    }

    /// Flags an error as thrown.
    pub fn thrown(exception: impl Into<Exception>) -> Self {
        Value::Marked(Mark::Thrown, Box::new(Value::Error(exception.into())))
    }

    pub fn object(object: impl Object) -> Self {
        Value::Object(Arc::new(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn into_proxy(self) -> Option<Proxy> {
        match self {
            Value::Proxy(proxy) => Some(proxy),
            _ => None,
        }
    }

    pub fn mark(&self) -> Option<Mark> {
        match self {
            Value::Marked(mark, _) => Some(*mark),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Error(_) => "error",
            Value::Port(_) => "port",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Proxy(_) => "proxy",
            Value::Marked(_, _) => "marked value",
        }
    }

    /// Pointer identity of shared handles. Plain data has none.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Bytes(buffer) => Some(buffer.identity()),
            Value::Port(port) => Some(port.identity()),
            Value::Object(object) => Some(Arc::as_ptr(object) as *const () as usize),
            Value::Function(function) => Some(function.identity()),
            Value::Proxy(proxy) => Some(proxy.identity()),
            Value::Marked(_, inner) => inner.identity(),
            _ => None,
        }
    }

    /// Human-readable rendering, used as the text of thrown non-error values.
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(s) => s.clone(),
            Value::Error(e) => e.description.clone(),
            Value::Marked(_, inner) => inner.describe(),
            other => format!("{:?}", other),
        }
    }

    /// Reads a member, the way a property access would.
    ///
    /// Maps and objects resolve by name, lists by decimal index, and a proxy
    /// extends its call path without sending anything. Reading from `Null`
    /// fails; reading from any other primitive yields `Null`.
    pub async fn get(&self, name: &str) -> Result<Value, Exception> {
        let mut target = self;
        while let Value::Marked(_, inner) = target {
            target = inner.as_ref();
        }

        match target {
            Value::Null => Err(Exception::new(format!("cannot read property '{}' of null", name))),
            Value::Object(object) => object.get(name).await,
            Value::Map(fields) => Ok(fields.get(name).cloned().unwrap_or(Value::Null)),
            Value::List(items) => Ok(name
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index).cloned())
                .unwrap_or(Value::Null)),
            Value::Proxy(proxy) => Ok(Value::Proxy(proxy.access(name))),
            _ => Ok(Value::Null),
        }
    }

    /// Assigns a member. Only live objects accept assignment.
    pub async fn set(&self, name: &str, value: Value) -> Result<(), Exception> {
        let mut target = self;
        while let Value::Marked(_, inner) = target {
            target = inner.as_ref();
        }

        match target {
            Value::Object(object) => object.set(name, value).await,
            other => Err(Exception::new(format!(
                "cannot assign property '{}' on a {}",
                name,
                other.kind()
            ))),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(v) => write!(f, "Int({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Bytes(buffer) => buffer.fmt(f),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Map(fields) => f.debug_map().entries(fields).finish(),
            Value::Error(e) => write!(f, "Error({:?})", e.description),
            Value::Port(port) => port.fmt(f),
            Value::Object(object) => write!(f, "Object({:p})", Arc::as_ptr(object) as *const ()),
            Value::Function(function) => function.fmt(f),
            Value::Proxy(proxy) => proxy.fmt(f),
            Value::Marked(mark, inner) => write!(f, "Marked({:?}, {:?})", mark, inner),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Marked(m, a), Value::Marked(n, b)) => m == n && a == b,
            (Value::Port(_), Value::Port(_))
            | (Value::Object(_), Value::Object(_))
            | (Value::Function(_), Value::Function(_))
            | (Value::Proxy(_), Value::Proxy(_)) => self.identity() == other.identity(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Value::Map(fields)
    }
}

impl From<Buffer> for Value {
    fn from(buffer: Buffer) -> Self {
        Value::Bytes(buffer)
    }
}

impl From<Exception> for Value {
    fn from(e: Exception) -> Self {
        Value::Error(e)
    }
}

impl From<Port> for Value {
    fn from(port: Port) -> Self {
        Value::Port(port)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<Proxy> for Value {
    fn from(proxy: Proxy) -> Self {
        Value::Proxy(proxy)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_methods_see_receiver() {
        let record = Record::new().with("value", 41).into_value();
        record.set("value", Value::Int(42)).await.unwrap();
        assert_eq!(record.get("value").await.unwrap(), Value::Int(42));
        assert_eq!(record.get("missing").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_read_from_null_fails() {
        let err = Value::Null.get("x").await.unwrap_err();
        assert!(err.description.contains("of null"));
        assert_eq!(Value::Int(3).get("x").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_list_index_and_map_lookup() {
        let mut fields = BTreeMap::new();
        fields.insert("items".to_string(), Value::List(vec!["a".into(), "b".into()]));
        let map = Value::Map(fields);

        let items = map.get("items").await.unwrap();
        assert_eq!(items.get("1").await.unwrap(), Value::from("b"));
        assert_eq!(items.get("9").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_assignment_requires_object() {
        let err = Value::Map(BTreeMap::new()).set("x", Value::Null).await.unwrap_err();
        assert!(err.description.contains("map"));
    }

    #[test]
    fn test_marks_and_identity() {
        let f = Function::sync("f", |_, _| Ok(Value::Null));
        let marked = Value::proxied(f.clone());
        assert_eq!(marked.mark(), Some(Mark::Proxy));
        assert_eq!(marked.identity(), Value::Function(f).identity());

        // marking twice does not nest
        assert_eq!(Value::proxied(marked.clone()), marked);

        let thrown = Value::thrown("boom");
        assert_eq!(thrown.mark(), Some(Mark::Thrown));
        assert_eq!(thrown.describe(), "boom");
    }

    #[test]
    fn test_data_equality_is_structural() {
        let a = Value::Bytes(Buffer::new(vec![1, 2, 3]));
        let b = Value::Bytes(Buffer::new(vec![1, 2, 3]));
        assert_eq!(a, b);
        assert_ne!(a.identity(), b.identity());
    }

    #[tokio::test]
    async fn test_function_call_and_construct() {
        let echo_this = Function::sync("echo", |this, args| {
            Ok(Value::List(vec![this, Value::Int(args.len() as i64)]))
        });
        let called = echo_this.call(Value::from("me"), vec![Value::Null]).await.unwrap();
        assert_eq!(called, Value::List(vec!["me".into(), Value::Int(1)]));

        let constructed = echo_this.construct(vec![]).await.unwrap();
        assert_eq!(constructed, Value::List(vec![Value::Null, Value::Int(0)]));
    }
}
