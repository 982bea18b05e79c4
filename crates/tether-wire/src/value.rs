//! The local value model.
//!
//! A [`Value`] is what application code hands to, and receives from, the
//! protocol layer. The [`transform`](crate::transform) module decides how
//! each variant crosses the wire.

use crate::host::{ArrayObject, FunctionObject, HostObject, ObjectKind, ObjectRef, PlainObject};
use crate::remote::RemoteObject;

use serde_json::{Number, Value as Json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value crossing (or about to cross) the channel.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Byte buffer, sent by value as base64.
    Bytes(Vec<u8>),
    /// Arbitrary data forced to travel by value.
    Json(Json),
    /// Container sent by value whose direct members are classified one by one.
    OneLevel(Members),
    /// An application failure value.
    Error(String),
    /// Inline list; sent by reference.
    List(Vec<Value>),
    /// Inline map; sent by reference.
    Map(BTreeMap<String, Value>),
    /// An object owned by this peer; sent by reference.
    Object(ObjectRef),
    /// An object owned by the other peer.
    Remote(RemoteObject),
}

/// Members of a one-level container.
#[derive(Debug, Clone, PartialEq)]
pub enum Members {
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Force `data` to be sent by value.
    pub fn json(data: Json) -> Self {
        Value::Json(data)
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    pub fn object(object: impl HostObject) -> Self {
        Value::Object(Arc::new(object))
    }

    /// Convert a JSON primitive. Containers are kept as forced-by-value data.
    pub fn from_json(data: Json) -> Self {
        match data {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n),
            Json::String(s) => Value::String(s),
            other => Value::Json(other),
        }
    }

    /// Primitives cross the wire unchanged.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for local callables and for every remote object.
    pub fn is_callable(&self) -> bool {
        match self {
            Value::Object(obj) => obj.kind() == ObjectKind::Callable,
            Value::Remote(_) => true,
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
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
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteObject> {
        match self {
            Value::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Value::Json(j) => write!(f, "Json({j})"),
            Value::OneLevel(m) => f.debug_tuple("OneLevel").field(m).finish(),
            Value::Error(e) => write!(f, "Error({e:?})"),
            Value::List(items) => f.debug_tuple("List").field(items).finish(),
            Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Value::Object(obj) => write!(f, "Object({:?})", obj.kind()),
            Value::Remote(remote) => write!(f, "Remote({})", remote.handle()),
        }
    }
}

fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Objects and remotes compare by identity, everything else by value.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::OneLevel(a), Value::OneLevel(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => same_object(a, b),
            (Value::Remote(a), Value::Remote(b)) => a.same_object(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::Number(Number::from(n))
            }
        })*
    };
}

impl_from_integer!(i32, i64, u32, u64, usize);

impl From<f64> for Value {
    /// Non-finite numbers have no JSON form and become `Null`.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        Value::Number(n)
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

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

impl From<PlainObject> for Value {
    fn from(obj: PlainObject) -> Self {
        Value::object(obj)
    }
}

impl From<ArrayObject> for Value {
    fn from(obj: ArrayObject) -> Self {
        Value::object(obj)
    }
}

impl From<FunctionObject> for Value {
    fn from(obj: FunctionObject) -> Self {
        Value::object(obj)
    }
}

impl From<RemoteObject> for Value {
    fn from(remote: RemoteObject) -> Self {
        Value::Remote(remote)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Retains held by [`retain_all_remotes`]; released once.
#[must_use = "dropping the guard releases the retained remotes"]
pub struct RetainGuard {
    remotes: Vec<RemoteObject>,
}

impl RetainGuard {
    /// Number of remotes this guard keeps alive.
    pub fn len(&self) -> usize {
        self.remotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Release every retained remote now.
    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        for remote in self.remotes.drain(..) {
            remote.release();
        }
    }
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn collect_remotes(value: &Value, out: &mut Vec<RemoteObject>) {
    match value {
        Value::Remote(remote) => out.push(remote.clone()),
        Value::List(items) | Value::OneLevel(Members::List(items)) => {
            for item in items {
                collect_remotes(item, out);
            }
        }
        Value::Map(map) | Value::OneLevel(Members::Map(map)) => {
            for item in map.values() {
                collect_remotes(item, out);
            }
        }
        _ => {}
    }
}

/// Retain every remote reachable from `value` through inline containers.
///
/// Remotes that are already released are skipped.
pub fn retain_all_remotes(value: &Value) -> RetainGuard {
    let mut found = Vec::new();
    collect_remotes(value, &mut found);
    let remotes = found
        .into_iter()
        .filter(|remote| remote.retain().is_ok())
        .collect();
    RetainGuard { remotes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitive_conversions() {
        assert_eq!(Value::from(42).as_i64(), Some(42));
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from(f64::NAN), Value::Null);
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert!(Value::from(true).is_primitive());
        assert!(!Value::bytes(vec![1, 2]).is_primitive());
    }

    #[test]
    fn test_from_json() {
        assert_eq!(Value::from_json(json!(3)), Value::from(3));
        assert_eq!(Value::from_json(json!(null)), Value::Null);
        assert_eq!(
            Value::from_json(json!({"a": 1})),
            Value::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_objects_compare_by_identity() {
        let a: ObjectRef = PlainObject::new().into_ref();
        let b: ObjectRef = PlainObject::new().into_ref();
        assert_eq!(Value::Object(a.clone()), Value::Object(a.clone()));
        assert_ne!(Value::Object(a), Value::Object(b));
    }

    #[test]
    fn test_is_callable() {
        assert!(Value::from(FunctionObject::sync(0, |_| Ok(Value::Null))).is_callable());
        assert!(!Value::from(PlainObject::new()).is_callable());
        assert!(!Value::from(3).is_callable());
    }

    #[test]
    fn test_retain_all_without_remotes() {
        let value = Value::List(vec![Value::from(1), Value::Map(BTreeMap::new())]);
        let guard = retain_all_remotes(&value);
        assert!(guard.is_empty());
        guard.release();
    }
}
