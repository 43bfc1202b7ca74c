//! Generated round trips through the codec and the wire map encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::collection::btree_map;
use proptest::collection::vec;
use proptest::prelude::*;

use exolink::Bridge;
use exolink::Buffer;
use exolink::Error;
use exolink::Exception;
use exolink::TransferHandler;
use exolink::Value;
use exolink::WireValue;
use exolink::wire::Op;
use exolink::wire::Request;
use exolink::wire::Response;

const MAX_DEPTH: usize = 16;

/// Carries error values as `{description, trace}` maps, so that generated
/// trees have handled nodes at arbitrary positions.
struct Faults;

impl TransferHandler for Faults {
    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Error(_))
    }

    fn serialize(&self, value: Value, _bridge: &Bridge) -> exolink::Result<Value> {
        let Value::Error(exception) = value else {
            return Err(Error::Protocol("not an error".into()));
        };
        let mut fields = BTreeMap::new();
        fields.insert("description".to_string(), Value::Str(exception.description));
        fields.insert(
            "trace".to_string(),
            exception.trace.map(Value::Str).unwrap_or(Value::Null),
        );
        Ok(Value::Map(fields))
    }

    fn deserialize(&self, payload: Value, _bridge: &Bridge) -> exolink::Result<Value> {
        let description = payload.as_map().and_then(|f| f.get("description")).and_then(Value::as_str);
        let Some(description) = description else {
            return Err(Error::Protocol("fault without description".into()));
        };
        let mut exception = Exception::new(description);
        if let Some(trace) = payload.as_map().and_then(|f| f.get("trace")).and_then(Value::as_str) {
            exception = exception.with_trace(trace);
        }
        Ok(Value::Error(exception))
    }
}

fn bridge() -> Bridge {
    Bridge::builder()
        .max_depth(MAX_DEPTH)
        .handler("FAULT", Arc::new(Faults))
        .build()
        .unwrap()
}

/// Map keys, biased towards ones that look like indices or wire field names.
fn key() -> impl Strategy<Value = String> {
    prop_oneof![
        any::<String>(),
        Just(String::new()),
        Just("0".to_string()),
        Just("a.b".to_string()),
        Just("type".to_string()),
        Just("wrappedChildren".to_string()),
    ]
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1.0e12f64..1.0e12).prop_map(Value::Float),
        any::<String>().prop_map(Value::Str),
        vec(any::<u8>(), 0..16).prop_map(|bytes| Value::Bytes(Buffer::new(bytes))),
        (any::<String>(), proptest::option::of(any::<String>())).prop_map(|(description, trace)| {
            let exception = Exception::new(description);
            Value::Error(match trace {
                Some(trace) => exception.with_trace(trace),
                None => exception,
            })
        }),
    ]
}

fn tree() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(8, 64, 6, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..6).prop_map(Value::List),
            btree_map(key(), inner, 0..6).prop_map(Value::Map),
        ]
    })
}

/// `depth` containers around an integer, alternating lists and maps.
fn nested(depth: usize) -> Value {
    let mut value = Value::Int(7);
    for level in 0..depth {
        value = if level % 2 == 0 {
            Value::List(vec![Value::Null, value])
        } else {
            let mut fields = BTreeMap::new();
            fields.insert(level.to_string(), value);
            Value::Map(fields)
        };
    }
    value
}

proptest! {
    #[test]
    fn test_codec_round_trip(value in tree()) {
        let bridge = bridge();
        let codec = bridge.codec();
        let wire = codec.wrap(value.clone()).unwrap();
        prop_assert_eq!(codec.unwrap(wire).unwrap(), value);
    }

    #[test]
    fn test_wire_map_round_trip(value in tree()) {
        let bridge = bridge();
        let codec = bridge.codec();
        let wire = codec.wrap(value.clone()).unwrap();

        let decoded = WireValue::from_value(wire.clone().into_value()).unwrap();
        prop_assert_eq!(&decoded, &wire);
        prop_assert_eq!(codec.unwrap(decoded).unwrap(), value);
    }

    #[test]
    fn test_request_and_response_round_trip(value in tree(), path in vec(key(), 1..4)) {
        let bridge = bridge();
        let codec = bridge.codec();

        let mut request = Request::new(Op::Apply, path.clone())
            .arguments(vec![codec.wrap(value.clone()).unwrap(), WireValue::raw(Value::Null)]);
        request.id = "seed-1".to_string();
        let parsed = Request::from_value(&request.clone().into_value()).unwrap();
        prop_assert_eq!(&parsed, &request);
        prop_assert_eq!(parsed.call_path, path);
        let argument = parsed.arguments.into_iter().next().unwrap();
        prop_assert_eq!(codec.unwrap(argument).unwrap(), value.clone());

        let response = Response { id: "seed-1".to_string(), value: codec.dispatch(value.clone()).unwrap() };
        let parsed = Response::from_value(response.into_value()).unwrap();
        prop_assert_eq!(parsed.id.as_str(), "seed-1");
        prop_assert_eq!(codec.unwrap(parsed.value).unwrap(), value);
    }

    #[test]
    fn test_nesting_up_to_max_depth_round_trips(depth in 0..=MAX_DEPTH) {
        let bridge = bridge();
        let codec = bridge.codec();
        let value = nested(depth);
        let wire = codec.wrap(value.clone()).unwrap();
        let decoded = WireValue::from_value(wire.into_value()).unwrap();
        prop_assert_eq!(codec.unwrap(decoded).unwrap(), value);
    }
}

#[test]
fn test_nesting_past_max_depth_is_refused() {
    let bridge = bridge();
    let err = bridge.codec().wrap(nested(MAX_DEPTH + 1)).unwrap_err();
    assert_eq!(err, Error::DepthLimitExceeded(MAX_DEPTH));
}
