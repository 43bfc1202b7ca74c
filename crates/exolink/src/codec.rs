//! # Value Codec
//!
//! Converts values to and from [`WireValue`] envelopes using the bridge's
//! transfer handler registry.
//!
//! ## Invariants
//!
//! - A value matched at the top level is handed to its handler whole; nothing
//!   inside it is inspected.
//! - Otherwise every handled node found in the tree is recorded as a wrapped
//!   child and nulled out in place, so the carrier can be cloned. Handled nodes
//!   are not descended into, which keeps wrapped child paths disjoint.
//! - A handled node that appears at several paths (same identity) is serialized
//!   once; every path gets the same payload, so the receiver sees one remote
//!   object rather than several.
//! - Binary buffers are leaves. Nesting deeper than the bridge's `max_depth`
//!   fails with `DepthLimitExceeded`.

use std::collections::HashMap;

use crate::bridge::Bridge;
use crate::error::Error;
use crate::error::Result;
use crate::value::Value;
use crate::wire::WireValue;
use crate::wire::WrappedChild;

/// Borrowed view of a bridge for encoding and decoding values.
pub struct Codec<'a> {
    bridge: &'a Bridge,
}

impl<'a> Codec<'a> {
    pub fn new(bridge: &'a Bridge) -> Self {
        Self { bridge }
    }

    /// Encodes an argument: top-level handler check, then a full traversal.
    pub fn wrap(&self, value: Value) -> Result<WireValue> {
        if let Some(wire) = self.try_handle(&value, None)? {
            return Ok(wire);
        }

        let mut value = value;
        let mut path = Vec::new();
        let mut seen = HashMap::new();
        let mut wrapped_children = Vec::new();
        self.collect(&mut value, &mut path, 0, &mut seen, &mut wrapped_children)?;

        Ok(WireValue::Raw {
            value,
            wrapped_children,
        })
    }

    /// Encodes a result: top-level handler check only.
    pub fn dispatch(&self, value: Value) -> Result<WireValue> {
        match self.try_handle(&value, None)? {
            Some(wire) => Ok(wire),
            None => Ok(WireValue::raw(value)),
        }
    }

    /// Decodes an envelope, restoring every wrapped child at its path.
    pub fn unwrap(&self, wire: WireValue) -> Result<Value> {
        match wire {
            WireValue::Handled { kind, value } => {
                let handler = self
                    .bridge
                    .registry()
                    .get(&kind)
                    .ok_or(Error::UnknownWireType(kind))?;
                handler.deserialize(value, self.bridge)
            }
            WireValue::Raw {
                mut value,
                wrapped_children,
            } => {
                for child in wrapped_children {
                    let restored = self.unwrap(child.wrapped_value)?;
                    replace_at_path(&mut value, &child.path, restored)?;
                }
                Ok(value)
            }
        }
    }

    /// Serializes `value` if some handler claims it. `seen` caches payloads by
    /// identity during a traversal.
    fn try_handle(
        &self,
        value: &Value,
        seen: Option<&mut HashMap<usize, WireValue>>,
    ) -> Result<Option<WireValue>> {
        let Some((kind, handler)) = self.bridge.registry().find(value) else {
            return Ok(None);
        };

        let identity = value.identity();
        if let (Some(seen), Some(identity)) = (seen.as_deref(), identity) {
            if let Some(cached) = seen.get(&identity) {
                return Ok(Some(cached.clone()));
            }
        }

        let payload = handler.serialize(value.clone(), self.bridge)?;
        let wire = WireValue::Handled { kind, value: payload };
        if let (Some(seen), Some(identity)) = (seen, identity) {
            seen.insert(identity, wire.clone());
        }
        Ok(Some(wire))
    }

    fn collect(
        &self,
        node: &mut Value,
        path: &mut Vec<String>,
        depth: usize,
        seen: &mut HashMap<usize, WireValue>,
        out: &mut Vec<WrappedChild>,
    ) -> Result<()> {
        let limit = self.bridge.options().max_depth;
        if depth > limit {
            return Err(Error::DepthLimitExceeded(limit));
        }

        match node {
            Value::List(items) => {
                for (index, item) in items.iter_mut().enumerate() {
                    path.push(index.to_string());
                    self.visit(item, path, depth, seen, out)?;
                    path.pop();
                }
            }
            Value::Map(fields) => {
                for (key, item) in fields.iter_mut() {
                    path.push(key.clone());
                    self.visit(item, path, depth, seen, out)?;
                    path.pop();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn visit(
        &self,
        item: &mut Value,
        path: &mut Vec<String>,
        depth: usize,
        seen: &mut HashMap<usize, WireValue>,
        out: &mut Vec<WrappedChild>,
    ) -> Result<()> {
        if let Some(wire) = self.try_handle(item, Some(seen))? {
            *item = Value::Null;
            out.push(WrappedChild {
                path: path.clone(),
                wrapped_value: wire,
            });
            return Ok(());
        }
        self.collect(item, path, depth + 1, seen, out)
    }
}

/// Writes `replacement` at `path` inside `root`.
fn replace_at_path(root: &mut Value, path: &[String], replacement: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(Error::Protocol("wrapped child has an empty path".into()));
    };

    let mut container = root;
    for segment in parents {
        container = child_mut(container, segment)
            .ok_or_else(|| Error::Protocol(format!("wrapped child path {:?} does not exist", path)))?;
    }

    match container {
        Value::Map(fields) => {
            fields.insert(last.clone(), replacement);
            Ok(())
        }
        Value::List(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index))
                .ok_or_else(|| Error::Protocol(format!("wrapped child path {:?} does not exist", path)))?;
            *slot = replacement;
            Ok(())
        }
        other => Err(Error::Protocol(format!(
            "wrapped child path {:?} runs through a {}",
            path,
            other.kind()
        ))),
    }
}

fn child_mut<'v>(value: &'v mut Value, segment: &str) -> Option<&'v mut Value> {
    match value {
        Value::Map(fields) => fields.get_mut(segment),
        Value::List(items) => segment.parse::<usize>().ok().and_then(|index| items.get_mut(index)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::handler::THROW;
    use crate::handler::TransferHandler;
    use crate::value::Buffer;
    use crate::value::Exception;
    use crate::value::Function;
    use crate::wire::RAW;

    fn sample() -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), Value::from("exolink"));
        fields.insert("ratio".to_string(), Value::Float(0.5));
        fields.insert("blob".to_string(), Value::Bytes(Buffer::new(vec![1, 2, 3])));
        fields.insert(
            "nested".to_string(),
            Value::List(vec![Value::Int(1), Value::Null, Value::Bool(true)]),
        );
        Value::Map(fields)
    }

    #[test]
    fn test_plain_data_round_trips() {
        let bridge = Bridge::new();
        let codec = bridge.codec();

        let wire = codec.wrap(sample()).unwrap();
        match &wire {
            WireValue::Raw { wrapped_children, .. } => assert!(wrapped_children.is_empty()),
            other => panic!("Expected RAW, got {:?}", other),
        }
        assert_eq!(codec.unwrap(wire).unwrap(), sample());
    }

    #[test]
    fn test_top_level_handled_value_is_not_traversed() {
        let bridge = Bridge::new();
        let wire = bridge.codec().wrap(Value::thrown("boom")).unwrap();
        assert_eq!(
            wire,
            WireValue::Handled {
                kind: THROW.into(),
                value: "boom".into()
            }
        );
    }

    #[test]
    fn test_nested_handled_values_are_nulled_and_listed() {
        let bridge = Bridge::new();
        let value = Value::List(vec![
            Value::Int(1),
            Value::Map(BTreeMap::from([("err".to_string(), Value::thrown("inner"))])),
        ]);

        let wire = bridge.codec().wrap(value).unwrap();
        let WireValue::Raw { value, wrapped_children } = &wire else {
            panic!("Expected RAW carrier");
        };
        assert_eq!(
            value,
            &Value::List(vec![
                Value::Int(1),
                Value::Map(BTreeMap::from([("err".to_string(), Value::Null)]))
            ])
        );
        assert_eq!(wrapped_children.len(), 1);
        assert_eq!(wrapped_children[0].path, vec!["1".to_string(), "err".to_string()]);

        // unwrapping re-raises the nested thrown error
        let err = bridge.codec().unwrap(wire).unwrap_err();
        assert_eq!(err, Error::RemoteThrow("inner".into()));
    }

    struct Tagged;

    impl TransferHandler for Tagged {
        fn can_handle(&self, value: &Value) -> bool {
            matches!(value, Value::Function(_))
        }

        fn serialize(&self, value: Value, _bridge: &Bridge) -> crate::Result<Value> {
            match value {
                Value::Function(f) => Ok(Value::from(f.name())),
                _ => Ok(Value::Null),
            }
        }

        fn deserialize(&self, payload: Value, _bridge: &Bridge) -> crate::Result<Value> {
            Ok(Value::from(format!("fn:{}", payload.describe())))
        }
    }

    #[test]
    fn test_custom_handler_children_are_restored() {
        let bridge = Bridge::new();
        bridge.register_handler("FN", Arc::new(Tagged)).unwrap();

        let f = Function::sync("shout", |_, _| Ok(Value::Null));
        let value = Value::List(vec![f.clone().into(), Value::from("x"), f.into()]);

        let wire = bridge.codec().wrap(value).unwrap();
        let restored = bridge.codec().unwrap(wire).unwrap();
        assert_eq!(
            restored,
            Value::List(vec!["fn:shout".into(), "x".into(), "fn:shout".into()])
        );
    }

    #[test]
    fn test_unknown_wire_type() {
        let bridge = Bridge::new();
        let wire = WireValue::Handled {
            kind: "MYSTERY".into(),
            value: Value::Null,
        };
        assert_eq!(
            bridge.codec().unwrap(wire).unwrap_err(),
            Error::UnknownWireType("MYSTERY".into())
        );

        let nested = WireValue::Raw {
            value: Value::List(vec![Value::Null]),
            wrapped_children: vec![WrappedChild {
                path: vec!["0".into()],
                wrapped_value: WireValue::Handled {
                    kind: "MYSTERY".into(),
                    value: Value::Null,
                },
            }],
        };
        assert!(matches!(bridge.codec().unwrap(nested), Err(Error::UnknownWireType(_))));
    }

    #[test]
    fn test_bad_child_path_is_a_protocol_error() {
        let bridge = Bridge::new();
        let wire = WireValue::Raw {
            value: Value::List(vec![]),
            wrapped_children: vec![WrappedChild {
                path: vec!["3".into()],
                wrapped_value: WireValue::raw(1),
            }],
        };
        assert!(matches!(bridge.codec().unwrap(wire), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_depth_limit() {
        let bridge = Bridge::builder().max_depth(3).build().unwrap();
        let mut deep = Value::Int(0);
        for _ in 0..6 {
            deep = Value::List(vec![deep]);
        }
        assert_eq!(bridge.codec().wrap(deep).unwrap_err(), Error::DepthLimitExceeded(3));
    }

    #[test]
    fn test_dispatch_checks_top_level_only() {
        let bridge = Bridge::new();
        let value = Value::List(vec![Value::thrown(Exception::new("hidden"))]);
        let wire = bridge.codec().dispatch(value.clone()).unwrap();
        assert_eq!(wire.kind(), RAW);
        assert_eq!(wire, WireValue::raw(value));
    }
}
