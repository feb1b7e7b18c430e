//! Dynamic values exchanged between a proxy and the object it stands for

use bytes::Bytes;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use crate::error::CallError;

type CallbackFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync;

/// A function that can be handed across the proxy boundary.
///
/// Cloning shares the same function; two callbacks are the same callback only
/// if they were cloned from one another.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        Self(Arc::new(move |args| Box::pin(f(args))))
    }

    /// Wrap a synchronous function
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        Self::new(move |args| std::future::ready(f(args)))
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, CallError>> {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Callback) -> bool {
        self.addr() == other.addr()
    }

    pub fn downgrade(&self) -> WeakCallback {
        WeakCallback(Arc::downgrade(&self.0))
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:#x})", self.addr())
    }
}

/// Non-owning handle to a [`Callback`]
#[derive(Clone)]
pub struct WeakCallback(Weak<CallbackFn>);

impl WeakCallback {
    pub fn upgrade(&self) -> Option<Callback> {
        self.0.upgrade().map(Callback)
    }
}

/// Opaque identity of a proxied instance.
///
/// Compared by reference: a value carrying the owning instance's reference is
/// encoded as a self reference instead of being copied.
#[derive(Clone)]
pub struct InstanceRef(Arc<dyn Any + Send + Sync>);

impl InstanceRef {
    pub fn new<T: Any + Send + Sync>(target: Arc<T>) -> Self {
        Self(target)
    }

    pub fn ptr_eq(&self, other: &InstanceRef) -> bool {
        self.addr() == other.addr()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceRef({:#x})", self.addr())
    }
}

/// A dynamically typed value
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Buffer(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(Callback),
    Instance(InstanceRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Buffer(_) => "buffer",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Instance(_) => "instance",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&Bytes> {
        match self {
            Value::Buffer(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_callback(&self) -> Option<&Callback> {
        match self {
            Value::Function(cb) => Some(cb),
            _ => None,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceRef> {
        match self {
            Value::Instance(r) => Some(r),
            _ => None,
        }
    }

    /// Build a value from plain JSON data
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Instance(a), Value::Instance(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Buffer(bytes)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Buffer(Bytes::from(bytes))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl From<Callback> for Value {
    fn from(cb: Callback) -> Self {
        Value::Function(cb)
    }
}

impl From<InstanceRef> for Value {
    fn from(r: InstanceRef) -> Self {
        Value::Instance(r)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Undefined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_identity_follows_clones() {
        let a = Callback::from_fn(|_| Ok(Value::Null));
        let b = a.clone();
        let c = Callback::from_fn(|_| Ok(Value::Null));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(Value::Function(a.clone()), Value::Function(b));
        assert_ne!(Value::Function(a), Value::Function(c));
    }

    #[test]
    fn test_weak_callback_dies_with_last_clone() {
        let cb = Callback::from_fn(|_| Ok(Value::Null));
        let weak = cb.downgrade();
        assert!(weak.upgrade().is_some());
        drop(cb);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_instance_ref_downcast_and_identity() {
        let target = Arc::new(String::from("house"));
        let a = InstanceRef::new(target.clone());
        let b = a.clone();
        let c = InstanceRef::new(Arc::new(String::from("house")));

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.downcast::<String>().as_deref(), Some(&"house".to_string()));
        assert!(a.downcast::<u32>().is_none());
    }

    #[tokio::test]
    async fn test_callback_call() {
        let double = Callback::from_fn(|args| {
            let n = args.first().and_then(Value::as_f64).unwrap_or(0.0);
            Ok(Value::Number(n * 2.0))
        });

        let result = double.call(vec![Value::from(21)]).await.unwrap();
        assert_eq!(result, Value::Number(42.0));
    }

    #[test]
    fn test_from_json() {
        let value = Value::from_json(serde_json::json!({"rooms": ["south", 2], "open": true}));
        let object = value.as_object().unwrap();
        assert_eq!(
            object.get("rooms"),
            Some(&Value::Array(vec![Value::from("south"), Value::Number(2.0)]))
        );
        assert_eq!(object.get("open"), Some(&Value::Bool(true)));
    }
}
