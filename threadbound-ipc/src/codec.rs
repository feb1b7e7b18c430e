//! Argument codec
//!
//! Tags every argument crossing the proxy boundary with its kind and converts
//! the payload into whatever the active transport can carry. Functions are
//! replaced by callback ids, the owning instance by a `"self"` marker, and
//! buffers are base64 text, a binary view or the live value depending on the
//! [`EncodingStrategy`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::callbacks::CallbackRegistry;
use crate::error::CodecError;
use crate::value::{Callback, InstanceRef, Value};

/// Marker carried by an object argument that refers to the owning instance
pub const SELF_REFERENCE: &str = "self";

/// How argument payloads are prepared for a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingStrategy {
    /// Messages are serialized to JSON text (child processes)
    Json,
    /// Messages move between threads by value; buffers travel as binary
    StructuredClone,
    /// Caller and worker share a runtime; values are handed over untouched
    InProcess,
}

/// Wire tag of an argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Number,
    Undefined,
    Null,
    Object,
    Function,
    Buffer,
    Other,
}

/// Payload of an [`ArgDefinition`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Json(JsonValue),
    Binary(Bytes),
    /// Object graph moved by value between threads, never serialized
    #[serde(skip)]
    Structured(Value),
}

impl WireValue {
    pub fn is_string(&self) -> bool {
        matches!(self, WireValue::Json(JsonValue::String(_)))
    }
}

/// One encoded argument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgDefinition {
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    pub value: WireValue,
    /// Live value handed over without conversion (in-process only)
    #[serde(skip)]
    pub original: Option<Value>,
}

impl ArgDefinition {
    pub fn new(arg_type: ArgType, value: WireValue) -> Self {
        Self {
            arg_type,
            value,
            original: None,
        }
    }

    fn passthrough(arg_type: ArgType, original: Value) -> Self {
        Self {
            arg_type,
            value: WireValue::Json(JsonValue::Null),
            original: Some(original),
        }
    }

    pub fn self_reference() -> Self {
        Self::new(
            ArgType::Object,
            WireValue::Json(JsonValue::String(SELF_REFERENCE.to_string())),
        )
    }

    pub fn undefined() -> Self {
        Self::new(ArgType::Undefined, WireValue::Json(JsonValue::Null))
    }

    pub fn is_self_reference(&self) -> bool {
        self.arg_type == ArgType::Object
            && matches!(&self.value, WireValue::Json(JsonValue::String(s)) if s == SELF_REFERENCE)
    }
}

/// Encoder state for one side of a connection
pub struct EncodeContext<'a> {
    strategy: EncodingStrategy,
    callbacks: &'a mut CallbackRegistry,
    instance: Option<&'a InstanceRef>,
}

impl<'a> EncodeContext<'a> {
    pub fn new(strategy: EncodingStrategy, callbacks: &'a mut CallbackRegistry) -> Self {
        Self {
            strategy,
            callbacks,
            instance: None,
        }
    }

    /// Values identical to `instance` are encoded as self references
    pub fn with_instance(mut self, instance: &'a InstanceRef) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn encode_args(&mut self, args: Vec<Value>) -> Result<Vec<ArgDefinition>, CodecError> {
        args.into_iter().map(|arg| self.encode(arg)).collect()
    }

    pub fn encode(&mut self, value: Value) -> Result<ArgDefinition, CodecError> {
        if let (Value::Instance(candidate), Some(instance)) = (&value, self.instance) {
            if candidate.ptr_eq(instance) {
                return Ok(ArgDefinition::self_reference());
            }
        }

        let definition = match value {
            Value::Undefined => ArgDefinition::undefined(),
            Value::Null => ArgDefinition::new(ArgType::Null, WireValue::Json(JsonValue::Null)),
            Value::Bool(b) => ArgDefinition::new(ArgType::Other, WireValue::Json(JsonValue::Bool(b))),
            Value::Number(n) => ArgDefinition::new(ArgType::Number, WireValue::Json(number_to_json(n))),
            Value::String(s) => {
                ArgDefinition::new(ArgType::String, WireValue::Json(JsonValue::String(s)))
            }
            Value::Buffer(bytes) => match self.strategy {
                EncodingStrategy::Json => ArgDefinition::new(
                    ArgType::Buffer,
                    WireValue::Json(JsonValue::String(BASE64.encode(&bytes))),
                ),
                EncodingStrategy::StructuredClone => {
                    ArgDefinition::new(ArgType::Buffer, WireValue::Binary(bytes))
                }
                EncodingStrategy::InProcess => {
                    ArgDefinition::passthrough(ArgType::Buffer, Value::Buffer(bytes))
                }
            },
            Value::Function(callback) => {
                let id = self.callbacks.register(&callback);
                ArgDefinition::new(ArgType::Function, WireValue::Json(JsonValue::from(id)))
            }
            Value::Instance(instance) => match self.strategy {
                EncodingStrategy::InProcess => {
                    ArgDefinition::passthrough(ArgType::Object, Value::Instance(instance))
                }
                _ => {
                    return Err(CodecError::UnsupportedAttribute(
                        "a reference to another instance cannot leave its worker".to_string(),
                    ))
                }
            },
            value @ (Value::Array(_) | Value::Object(_)) => match self.strategy {
                EncodingStrategy::InProcess => ArgDefinition::passthrough(ArgType::Object, value),
                EncodingStrategy::StructuredClone => {
                    ensure_cloneable(&value)?;
                    ArgDefinition::new(ArgType::Object, WireValue::Structured(value))
                }
                EncodingStrategy::Json => {
                    ArgDefinition::new(ArgType::Object, WireValue::Json(to_plain_json(&value)?))
                }
            },
        };
        Ok(definition)
    }
}

/// Decoder state for one side of a connection
pub struct DecodeContext<'a> {
    instance: Box<dyn Fn() -> Option<InstanceRef> + 'a>,
    resolve_callback: Box<dyn Fn(u64) -> Callback + 'a>,
}

impl<'a> DecodeContext<'a> {
    /// `resolve_callback` turns a remote callback id into a callable handle
    pub fn new(resolve_callback: impl Fn(u64) -> Callback + 'a) -> Self {
        Self {
            instance: Box::new(|| None),
            resolve_callback: Box::new(resolve_callback),
        }
    }

    /// The provider is consulted lazily, only when a self reference shows up
    pub fn with_instance(mut self, provider: impl Fn() -> Option<InstanceRef> + 'a) -> Self {
        self.instance = Box::new(provider);
        self
    }

    pub fn decode_args(&self, definitions: Vec<ArgDefinition>) -> Result<Vec<Value>, CodecError> {
        definitions.into_iter().map(|def| self.decode(def)).collect()
    }

    pub fn decode(&self, definition: ArgDefinition) -> Result<Value, CodecError> {
        if let Some(original) = definition.original {
            return Ok(original);
        }

        match (definition.arg_type, definition.value) {
            (ArgType::Undefined, _) => Ok(Value::Undefined),
            (ArgType::Null, _) => Ok(Value::Null),
            (ArgType::String, WireValue::Json(JsonValue::String(s))) => Ok(Value::String(s)),
            (ArgType::Number, WireValue::Json(json)) => number_from_json(&json).map(Value::Number),
            (ArgType::Other, WireValue::Json(json)) => Ok(Value::from_json(json)),
            (ArgType::Buffer, WireValue::Json(JsonValue::String(encoded))) => BASE64
                .decode(encoded.as_bytes())
                .map(|bytes| Value::Buffer(Bytes::from(bytes)))
                .map_err(|e| CodecError::InvalidBuffer(e.to_string())),
            (ArgType::Buffer, WireValue::Json(JsonValue::Array(items))) => items
                .iter()
                .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(|bytes| Value::Buffer(Bytes::from(bytes)))
                .ok_or_else(|| CodecError::InvalidBuffer("expected a list of bytes".to_string())),
            (ArgType::Buffer, WireValue::Binary(bytes)) => Ok(Value::Buffer(bytes)),
            (ArgType::Function, WireValue::Json(json)) => {
                let id = json.as_u64().ok_or_else(|| {
                    CodecError::MalformedArgument(format!("invalid callback id {}", json))
                })?;
                Ok(Value::Function((self.resolve_callback)(id)))
            }
            (ArgType::Object, WireValue::Json(JsonValue::String(marker)))
                if marker == SELF_REFERENCE =>
            {
                (self.instance)()
                    .map(Value::Instance)
                    .ok_or(CodecError::MissingInstance)
            }
            (ArgType::Object, WireValue::Json(json)) => Ok(Value::from_json(json)),
            (ArgType::Object, WireValue::Structured(value)) => Ok(value),
            (arg_type, value) => Err(CodecError::MalformedArgument(format!(
                "{:?} argument carried an unexpected payload: {:?}",
                arg_type, value
            ))),
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    match serde_json::Number::from_f64(n) {
        Some(number) => JsonValue::Number(number),
        None if n.is_nan() => JsonValue::String("NaN".to_string()),
        None if n > 0.0 => JsonValue::String("Infinity".to_string()),
        None => JsonValue::String("-Infinity".to_string()),
    }
}

fn number_from_json(json: &JsonValue) -> Result<f64, CodecError> {
    match json {
        JsonValue::Number(n) => n
            .as_f64()
            .ok_or_else(|| CodecError::MalformedArgument(format!("number out of range: {}", n))),
        JsonValue::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(CodecError::MalformedArgument(format!("not a number: {}", other))),
        },
        other => Err(CodecError::MalformedArgument(format!("not a number: {}", other))),
    }
}

/// Plain data conversion used by the JSON strategy.
///
/// Only top-level arguments carry type tags, so nested values follow plain
/// JSON rules: `NaN`, infinities and undefined become `null`.
fn to_plain_json(value: &Value) -> Result<JsonValue, CodecError> {
    Ok(match value {
        Value::Undefined | Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(to_plain_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), to_plain_json(v)?)))
                .collect::<Result<serde_json::Map<_, _>, CodecError>>()?,
        ),
        Value::Buffer(_) | Value::Function(_) | Value::Instance(_) => {
            return Err(nested_handle_error(value))
        }
    })
}

/// Structured clone moves data, buffers included, but no handles
fn ensure_cloneable(value: &Value) -> Result<(), CodecError> {
    match value {
        Value::Array(items) => items.iter().try_for_each(ensure_cloneable),
        Value::Object(map) => map.values().try_for_each(ensure_cloneable),
        Value::Function(_) | Value::Instance(_) => Err(nested_handle_error(value)),
        _ => Ok(()),
    }
}

fn nested_handle_error(value: &Value) -> CodecError {
    CodecError::UnsupportedAttribute(format!(
        "a {} nested inside an object or array cannot be transferred",
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const STRATEGIES: [EncodingStrategy; 3] = [
        EncodingStrategy::Json,
        EncodingStrategy::StructuredClone,
        EncodingStrategy::InProcess,
    ];

    fn no_callbacks(id: u64) -> Callback {
        Callback::from_fn(move |_| Err(format!("unexpected callback {}", id).into()))
    }

    fn round_trip(value: Value, strategy: EncodingStrategy) -> Value {
        let mut registry = CallbackRegistry::new();
        let encoded = EncodeContext::new(strategy, &mut registry)
            .encode(value)
            .unwrap();
        // JSON definitions really travel as text
        let encoded = if strategy == EncodingStrategy::Json {
            let text = serde_json::to_string(&encoded).unwrap();
            serde_json::from_str(&text).unwrap()
        } else {
            encoded
        };
        DecodeContext::new(no_callbacks).decode(encoded).unwrap()
    }

    #[test]
    fn test_primitives_round_trip_under_every_strategy() {
        let mut house = BTreeMap::new();
        house.insert("rooms".to_string(), Value::Array(vec!["south".into(), 2.into()]));
        house.insert("open".to_string(), Value::Bool(false));

        let samples = vec![
            Value::from("hello"),
            Value::from(""),
            Value::Number(42.5),
            Value::Number(-0.25),
            Value::Null,
            Value::Undefined,
            Value::Bool(true),
            Value::Object(house),
            Value::Array(vec![Value::Null, Value::from("x")]),
            Value::Buffer(Bytes::new()),
        ];

        for strategy in STRATEGIES {
            for sample in &samples {
                assert_eq!(&round_trip(sample.clone(), strategy), sample, "{:?}", strategy);
            }
        }
    }

    #[test]
    fn test_non_finite_numbers_survive_json() {
        for n in [f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(round_trip(Value::Number(n), EncodingStrategy::Json), Value::Number(n));
        }
        let nan = round_trip(Value::Number(f64::NAN), EncodingStrategy::Json);
        assert!(nan.as_f64().unwrap().is_nan());
    }

    #[test]
    fn test_nested_non_finite_numbers_become_null_under_json() {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Undefined);
        let nested = Value::Array(vec![
            Value::Number(f64::NAN),
            Value::Undefined,
            Value::Number(f64::INFINITY),
            Value::Object(inner),
        ]);

        let mut registry = CallbackRegistry::new();
        let encoded = EncodeContext::new(EncodingStrategy::Json, &mut registry)
            .encode(nested)
            .unwrap();
        match encoded.value {
            WireValue::Json(json) => {
                assert_eq!(json, serde_json::json!([null, null, null, {"x": null}]))
            }
            other => panic!("expected plain JSON, got {:?}", other),
        }
    }

    #[test]
    fn test_full_byte_range_buffer() {
        let all_bytes: Vec<u8> = (0..=255u8).collect();
        let buffer = Value::Buffer(Bytes::from(all_bytes.clone()));

        let mut registry = CallbackRegistry::new();
        let json = EncodeContext::new(EncodingStrategy::Json, &mut registry)
            .encode(buffer.clone())
            .unwrap();
        assert!(json.value.is_string());

        let structured = EncodeContext::new(EncodingStrategy::StructuredClone, &mut registry)
            .encode(buffer.clone())
            .unwrap();
        assert!(!structured.value.is_string());

        for strategy in [EncodingStrategy::Json, EncodingStrategy::StructuredClone] {
            let decoded = round_trip(buffer.clone(), strategy);
            assert_eq!(decoded.as_buffer().unwrap().as_ref(), all_bytes.as_slice());
        }
    }

    #[test]
    fn test_self_reference_under_every_strategy() {
        let instance = InstanceRef::new(Arc::new(7u32));

        for strategy in STRATEGIES {
            let mut registry = CallbackRegistry::new();
            let encoded = EncodeContext::new(strategy, &mut registry)
                .with_instance(&instance)
                .encode(Value::Instance(instance.clone()))
                .unwrap();
            assert!(encoded.is_self_reference());
            assert!(encoded.original.is_none());

            let decoded = DecodeContext::new(no_callbacks)
                .with_instance(|| Some(instance.clone()))
                .decode(encoded)
                .unwrap();
            assert!(decoded.as_instance().unwrap().ptr_eq(&instance));
        }
    }

    #[test]
    fn test_self_reference_without_instance_fails() {
        let result = DecodeContext::new(no_callbacks).decode(ArgDefinition::self_reference());
        assert_eq!(result.unwrap_err(), CodecError::MissingInstance);
    }

    #[test]
    fn test_in_process_keeps_reference_identity() {
        let other = InstanceRef::new(Arc::new(String::from("other")));
        let mut registry = CallbackRegistry::new();
        let encoded = EncodeContext::new(EncodingStrategy::InProcess, &mut registry)
            .encode(Value::Instance(other.clone()))
            .unwrap();
        assert!(encoded.original.is_some());

        let decoded = DecodeContext::new(no_callbacks).decode(encoded).unwrap();
        assert!(decoded.as_instance().unwrap().ptr_eq(&other));
    }

    #[test]
    fn test_callback_ids_are_identity_preserving() {
        let first = Callback::from_fn(|_| Ok(Value::Null));
        let second = Callback::from_fn(|_| Ok(Value::Null));

        let mut registry = CallbackRegistry::new();
        let mut ctx = EncodeContext::new(EncodingStrategy::Json, &mut registry);
        let a = ctx.encode(Value::Function(first.clone())).unwrap();
        let b = ctx.encode(Value::Function(first)).unwrap();
        let c = ctx.encode(Value::Function(second)).unwrap();

        assert_eq!(a.arg_type, ArgType::Function);
        let id = |def: &ArgDefinition| match &def.value {
            WireValue::Json(json) => json.as_u64().unwrap(),
            other => panic!("unexpected payload {:?}", other),
        };
        assert_eq!(id(&a), id(&b));
        assert_ne!(id(&a), id(&c));
    }

    #[test]
    fn test_nested_handles_are_rejected() {
        let callback = Callback::from_fn(|_| Ok(Value::Null));
        let nested = Value::Array(vec![Value::Function(callback)]);

        for strategy in [EncodingStrategy::Json, EncodingStrategy::StructuredClone] {
            let mut registry = CallbackRegistry::new();
            let err = EncodeContext::new(strategy, &mut registry)
                .encode(nested.clone())
                .unwrap_err();
            assert!(matches!(err, CodecError::UnsupportedAttribute(_)));
        }

        let mut registry = CallbackRegistry::new();
        let buffer_in_object = Value::Array(vec![Value::Buffer(Bytes::from_static(b"ab"))]);
        let err = EncodeContext::new(EncodingStrategy::Json, &mut registry)
            .encode(buffer_in_object.clone())
            .unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedAttribute(_)));
        assert_eq!(
            round_trip(buffer_in_object.clone(), EncodingStrategy::StructuredClone),
            buffer_in_object
        );
    }

    #[test]
    fn test_wire_shape() {
        let mut registry = CallbackRegistry::new();
        let encoded = EncodeContext::new(EncodingStrategy::Json, &mut registry)
            .encode(Value::from("south"))
            .unwrap();
        let json = serde_json::to_value(&encoded).unwrap();
        assert_eq!(json, serde_json::json!({"type": "string", "value": "south"}));
    }
}
