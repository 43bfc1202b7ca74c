//! # Wire Messages
//!
//! Requests, responses and `WireValue` envelopes, and their mapping onto plain
//! `Value::Map` messages.
//!
//! ## Message shapes
//!
//! ```text
//! Request   { id, type: APPLY|CONSTRUCT|GET|SET, callPath: [str], argumentsList?: [WireValue],
//!             property?: str, value?: any }
//! Response  { id, value: WireValue }
//! WireValue { type: "RAW", value: any, wrappedChildren: [{ path: [str], wrappedValue: WireValue }] }
//!         | { type: <handler name>, value: <handler payload> }
//! ```
//!
//! Field names are part of the protocol. A map lacking `id` or `callPath` is not
//! a request and is left alone, so unrelated traffic can share an endpoint.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::error::Result;
use crate::value::Value;

/// Tag of a structurally cloned carrier.
pub const RAW: &str = "RAW";

/// Nesting the envelope itself adds on top of a payload (request map, argument
/// list, wire value, wrapped children list, child entry).
pub(crate) const ENVELOPE_DEPTH: usize = 8;

const ID: &str = "id";
const TYPE: &str = "type";
const CALL_PATH: &str = "callPath";
const ARGUMENTS_LIST: &str = "argumentsList";
const PROPERTY: &str = "property";
const VALUE: &str = "value";
const WRAPPED_CHILDREN: &str = "wrappedChildren";
const PATH: &str = "path";
const WRAPPED_VALUE: &str = "wrappedValue";

/// The four operations a proxy can forward.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Apply,
    Construct,
    Get,
    Set,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Apply => "APPLY",
            Op::Construct => "CONSTRUCT",
            Op::Get => "GET",
            Op::Set => "SET",
        }
    }

    pub fn parse(tag: &str) -> Option<Op> {
        match tag {
            "APPLY" => Some(Op::Apply),
            "CONSTRUCT" => Some(Op::Construct),
            "GET" => Some(Op::Get),
            "SET" => Some(Op::Set),
            _ => None,
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handled value recorded during traversal, together with where it was found.
#[derive(Clone, Debug, PartialEq)]
pub struct WrappedChild {
    pub path: Vec<String>,
    pub wrapped_value: WireValue,
}

/// How a value was encoded for transport.
#[derive(Clone, Debug, PartialEq)]
pub enum WireValue {
    /// Structurally cloned, with handled positions nulled out and listed.
    Raw {
        value: Value,
        wrapped_children: Vec<WrappedChild>,
    },
    /// Serialized by the transfer handler registered as `kind`.
    Handled { kind: String, value: Value },
}

impl WireValue {
    pub fn raw(value: impl Into<Value>) -> Self {
        WireValue::Raw {
            value: value.into(),
            wrapped_children: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            WireValue::Raw { .. } => RAW,
            WireValue::Handled { kind, .. } => kind,
        }
    }

    pub fn into_value(self) -> Value {
        let mut fields = BTreeMap::new();
        match self {
            WireValue::Raw { value, wrapped_children } => {
                fields.insert(TYPE.to_string(), Value::from(RAW));
                fields.insert(VALUE.to_string(), value);
                let children = wrapped_children
                    .into_iter()
                    .map(|child| {
                        let mut entry = BTreeMap::new();
                        entry.insert(PATH.to_string(), strings_to_value(child.path));
                        entry.insert(WRAPPED_VALUE.to_string(), child.wrapped_value.into_value());
                        Value::Map(entry)
                    })
                    .collect();
                fields.insert(WRAPPED_CHILDREN.to_string(), Value::List(children));
            }
            WireValue::Handled { kind, value } => {
                fields.insert(TYPE.to_string(), Value::Str(kind));
                fields.insert(VALUE.to_string(), value);
            }
        }
        Value::Map(fields)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(mut fields) = value else {
            return Err(Error::Protocol(format!("wire value must be a map, got {}", value.kind())));
        };
        let kind = match fields.remove(TYPE) {
            Some(Value::Str(kind)) => kind,
            _ => return Err(Error::Protocol("wire value is missing its type tag".into())),
        };
        let value = fields.remove(VALUE).unwrap_or(Value::Null);

        if kind != RAW {
            return Ok(WireValue::Handled { kind, value });
        }

        let wrapped_children = match fields.remove(WRAPPED_CHILDREN) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::List(children)) => children
                .into_iter()
                .map(child_from_value)
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "wrappedChildren must be a list, got {}",
                    other.kind()
                )));
            }
        };
        Ok(WireValue::Raw { value, wrapped_children })
    }
}

fn child_from_value(value: Value) -> Result<WrappedChild> {
    let Value::Map(mut entry) = value else {
        return Err(Error::Protocol("wrapped child must be a map".into()));
    };
    let path = match entry.remove(PATH) {
        Some(path) => strings_from_value(path, PATH)?,
        None => return Err(Error::Protocol("wrapped child is missing its path".into())),
    };
    let wrapped_value = match entry.remove(WRAPPED_VALUE) {
        Some(inner) => WireValue::from_value(inner)?,
        None => return Err(Error::Protocol("wrapped child is missing its wrappedValue".into())),
    };
    Ok(WrappedChild { path, wrapped_value })
}

/// An outbound operation on a remote object.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: String,
    pub op: Op,
    pub call_path: Vec<String>,
    pub arguments: Vec<WireValue>,
    pub property: Option<String>,
    pub value: Option<Value>,
}

impl Request {
    /// A request without an id. The exchange assigns one when it is sent.
    pub fn new(op: Op, call_path: Vec<String>) -> Self {
        Self {
            id: String::new(),
            op,
            call_path,
            arguments: Vec::new(),
            property: None,
            value: None,
        }
    }

    pub fn arguments(mut self, arguments: Vec<WireValue>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn assign(mut self, property: impl Into<String>, value: Value) -> Self {
        self.property = Some(property.into());
        self.value = Some(value);
        self
    }

    /// True for messages carrying a non-empty `id` and a `callPath`.
    pub fn is_request(message: &Value) -> bool {
        let Some(fields) = message.as_map() else {
            return false;
        };
        message_id(message).is_some_and(|id| !id.is_empty()) && fields.contains_key(CALL_PATH)
    }

    pub fn into_value(self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert(ID.to_string(), Value::Str(self.id));
        fields.insert(TYPE.to_string(), Value::from(self.op.as_str()));
        fields.insert(CALL_PATH.to_string(), strings_to_value(self.call_path));
        if matches!(self.op, Op::Apply | Op::Construct) {
            let arguments = self.arguments.into_iter().map(WireValue::into_value).collect();
            fields.insert(ARGUMENTS_LIST.to_string(), Value::List(arguments));
        }
        if let Some(property) = self.property {
            fields.insert(PROPERTY.to_string(), Value::Str(property));
        }
        if let Some(value) = self.value {
            fields.insert(VALUE.to_string(), value);
        }
        Value::Map(fields)
    }

    pub fn from_value(message: &Value) -> Result<Self> {
        let Some(fields) = message.as_map() else {
            return Err(Error::Protocol(format!("request must be a map, got {}", message.kind())));
        };
        let id = match fields.get(ID) {
            Some(Value::Str(id)) if !id.is_empty() => id.clone(),
            _ => return Err(Error::Protocol("request is missing its id".into())),
        };
        let op = match fields.get(TYPE) {
            Some(Value::Str(tag)) => Op::parse(tag)
                .ok_or_else(|| Error::Protocol(format!("unknown request type '{}'", tag)))?,
            _ => return Err(Error::Protocol("request is missing its type".into())),
        };
        let call_path = match fields.get(CALL_PATH) {
            Some(path) => strings_from_value(path.clone(), CALL_PATH)?,
            None => return Err(Error::Protocol("request is missing its callPath".into())),
        };
        let arguments = match fields.get(ARGUMENTS_LIST) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::List(items)) => items
                .iter()
                .cloned()
                .map(WireValue::from_value)
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "argumentsList must be a list, got {}",
                    other.kind()
                )));
            }
        };
        let property = match fields.get(PROPERTY) {
            None | Some(Value::Null) => None,
            Some(Value::Str(property)) => Some(property.clone()),
            Some(other) => {
                return Err(Error::Protocol(format!("property must be a string, got {}", other.kind())));
            }
        };

        Ok(Self {
            id,
            op,
            call_path,
            arguments,
            property,
            value: fields.get(VALUE).cloned(),
        })
    }
}

/// The answer to one request.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub id: String,
    pub value: WireValue,
}

impl Response {
    pub fn into_value(self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert(ID.to_string(), Value::Str(self.id));
        fields.insert(VALUE.to_string(), self.value.into_value());
        Value::Map(fields)
    }

    pub fn from_value(message: Value) -> Result<Self> {
        let Value::Map(mut fields) = message else {
            return Err(Error::Protocol("response must be a map".into()));
        };
        let id = match fields.remove(ID) {
            Some(Value::Str(id)) => id,
            _ => return Err(Error::Protocol("response is missing its id".into())),
        };
        let value = match fields.remove(VALUE) {
            Some(value) => WireValue::from_value(value)?,
            None => return Err(Error::Protocol("response is missing its value".into())),
        };
        Ok(Self { id, value })
    }
}

/// The `id` field of a message, if it has one.
pub fn message_id(message: &Value) -> Option<&str> {
    message.as_map()?.get(ID)?.as_str()
}

fn strings_to_value(items: Vec<String>) -> Value {
    Value::List(items.into_iter().map(Value::Str).collect())
}

fn strings_from_value(value: Value, field: &str) -> Result<Vec<String>> {
    let Value::List(items) = value else {
        return Err(Error::Protocol(format!("{} must be a list of strings", field)));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Str(s) => Ok(s),
            other => Err(Error::Protocol(format!(
                "{} must be a list of strings, found {}",
                field,
                other.kind()
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> Value {
        Value::Map(entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn test_request_uses_protocol_field_names() {
        let mut request = Request::new(Op::Apply, vec!["greet".into()])
            .arguments(vec![WireValue::raw("World")]);
        request.id = "abc-1".into();

        let message = request.clone().into_value();
        let fields = message.as_map().unwrap();
        assert_eq!(fields["type"], Value::from("APPLY"));
        assert_eq!(fields["callPath"], Value::List(vec!["greet".into()]));
        assert!(fields.contains_key("argumentsList"));
        assert!(Request::is_request(&message));

        assert_eq!(Request::from_value(&message).unwrap(), request);
    }

    #[test]
    fn test_unrelated_traffic_is_not_a_request() {
        assert!(!Request::is_request(&Value::from("hello")));
        assert!(!Request::is_request(&map(&[("id", "x".into())])));
        assert!(!Request::is_request(&map(&[("callPath", Value::List(vec![]))])));
        assert!(!Request::is_request(&map(&[("id", "".into()), ("callPath", Value::List(vec![]))])));
    }

    #[test]
    fn test_malformed_request_is_a_protocol_error() {
        let message = map(&[
            ("id", "x".into()),
            ("type", "DELETE".into()),
            ("callPath", Value::List(vec![])),
        ]);
        match Request::from_value(&message) {
            Err(Error::Protocol(msg)) => assert!(msg.contains("DELETE")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_wire_value_with_children() {
        let wire = WireValue::Raw {
            value: Value::List(vec![Value::Null, Value::Int(2)]),
            wrapped_children: vec![WrappedChild {
                path: vec!["0".into()],
                wrapped_value: WireValue::Handled {
                    kind: "THROW".into(),
                    value: "boom".into(),
                },
            }],
        };
        let message = wire.clone().into_value();
        let fields = message.as_map().unwrap();
        assert_eq!(fields["type"], Value::from("RAW"));
        assert_eq!(WireValue::from_value(message).unwrap(), wire);
    }

    #[test]
    fn test_missing_wrapped_children_reads_as_empty() {
        let wire = WireValue::from_value(map(&[("type", "RAW".into()), ("value", Value::Int(1))])).unwrap();
        assert_eq!(wire, WireValue::raw(1));
    }

    #[test]
    fn test_message_id() {
        let response = Response {
            id: "seed-7".into(),
            value: WireValue::raw(Value::Null),
        };
        assert_eq!(message_id(&response.into_value()), Some("seed-7"));
        assert_eq!(message_id(&Value::Int(1)), None);
    }
}
