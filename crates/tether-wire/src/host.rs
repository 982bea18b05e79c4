//! Application objects a peer can expose to the other side.
//!
//! Anything stored in the [`ObjectStore`](crate::store::ObjectStore) is a
//! [`HostObject`]. The trait is deliberately small: a property table plus an
//! optional call operation. [`PlainObject`], [`ArrayObject`] and
//! [`FunctionObject`] cover the common cases; embedders implement the trait
//! directly for anything richer.

use crate::value::Value;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Shared reference to an exposed object.
pub type ObjectRef = Arc<dyn HostObject>;

/// Error returned by application objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Shape of an exposed object, as far as the protocol cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Plain,
    /// Gets a synthetic `length` property.
    Array,
    /// Invokable with an empty property name; also gets `length`.
    Callable,
}

/// An object owned by this peer and reachable by the other one.
#[async_trait]
pub trait HostObject: Send + Sync + 'static {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Plain
    }

    /// Own property names, in definition order.
    fn keys(&self) -> Vec<String>;

    /// Read a property; `None` when it does not exist.
    fn get(&self, name: &str) -> Option<Value>;

    fn set(&self, name: &str, value: Value) -> Result<(), HostError>;

    fn delete(&self, name: &str) -> Result<(), HostError>;

    /// Value of the synthetic `length` property of arrays and callables.
    fn length(&self) -> Option<usize> {
        None
    }

    async fn call(&self, _args: Vec<Value>) -> Result<Value, HostError> {
        Err(HostError::new("The object is not callable"))
    }

    /// Hook run when the spawn this object roots is destroyed.
    fn on_destroy(&self) -> Result<(), HostError> {
        Ok(())
    }
}

impl fmt::Debug for dyn HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({:?}, {:?})", self.kind(), self.keys())
    }
}

type DestroyHook = Box<dyn Fn() -> Result<(), HostError> + Send + Sync>;

struct Property {
    name: String,
    value: Value,
    writable: bool,
}

/// A string-keyed object with ordered properties.
#[derive(Default)]
pub struct PlainObject {
    props: RwLock<Vec<Property>>,
    on_destroy: Option<DestroyHook>,
}

impl PlainObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a writable property.
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.define(name.into(), value.into(), true);
        self
    }

    /// Add a property that rejects assignment and deletion.
    pub fn with_readonly(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.define(name.into(), value.into(), false);
        self
    }

    /// Add a synchronous method.
    pub fn with_method<F>(self, name: impl Into<String>, arity: usize, method: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        self.with(name, FunctionObject::sync(arity, method))
    }

    /// Run `hook` when the spawn rooted at this object is destroyed.
    pub fn with_on_destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), HostError> + Send + Sync + 'static,
    {
        self.on_destroy = Some(Box::new(hook));
        self
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        map.into_iter()
            .fold(Self::new(), |obj, (name, value)| obj.with(name, value))
    }

    pub fn into_ref(self) -> ObjectRef {
        Arc::new(self)
    }

    /// Copy of every property.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let props = self.props.read().unwrap_or_else(|e| e.into_inner());
        props
            .iter()
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect()
    }

    fn define(&self, name: String, value: Value, writable: bool) {
        let mut props = self.props.write().unwrap_or_else(|e| e.into_inner());
        match props.iter_mut().find(|p| p.name == name) {
            Some(prop) => {
                prop.value = value;
                prop.writable = writable;
            }
            None => props.push(Property {
                name,
                value,
                writable,
            }),
        }
    }
}

#[async_trait]
impl HostObject for PlainObject {
    fn keys(&self) -> Vec<String> {
        let props = self.props.read().unwrap_or_else(|e| e.into_inner());
        props.iter().map(|p| p.name.clone()).collect()
    }

    fn get(&self, name: &str) -> Option<Value> {
        let props = self.props.read().unwrap_or_else(|e| e.into_inner());
        props.iter().find(|p| p.name == name).map(|p| p.value.clone())
    }

    fn set(&self, name: &str, value: Value) -> Result<(), HostError> {
        let mut props = self.props.write().unwrap_or_else(|e| e.into_inner());
        match props.iter_mut().find(|p| p.name == name) {
            Some(prop) if !prop.writable => Err(HostError::new(format!(
                "Cannot assign to read only property '{name}'"
            ))),
            Some(prop) => {
                prop.value = value;
                Ok(())
            }
            None => {
                props.push(Property {
                    name: name.to_string(),
                    value,
                    writable: true,
                });
                Ok(())
            }
        }
    }

    fn delete(&self, name: &str) -> Result<(), HostError> {
        let mut props = self.props.write().unwrap_or_else(|e| e.into_inner());
        match props.iter().position(|p| p.name == name) {
            Some(idx) if !props[idx].writable => Err(HostError::new(format!(
                "Cannot delete property '{name}'"
            ))),
            Some(idx) => {
                props.remove(idx);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn on_destroy(&self) -> Result<(), HostError> {
        match &self.on_destroy {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}

/// An index-addressed list. Property names are decimal indices.
#[derive(Default)]
pub struct ArrayObject {
    items: RwLock<Vec<Value>>,
}

impl ArrayObject {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items: RwLock::new(items),
        }
    }

    pub fn into_ref(self) -> ObjectRef {
        Arc::new(self)
    }

    pub fn items(&self) -> Vec<Value> {
        self.items.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn parse_index(name: &str) -> Option<usize> {
    if name.is_empty() || (name.len() > 1 && name.starts_with('0')) {
        return None;
    }
    name.parse().ok()
}

#[async_trait]
impl HostObject for ArrayObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Array
    }

    fn keys(&self) -> Vec<String> {
        let len = self.items.read().unwrap_or_else(|e| e.into_inner()).len();
        (0..len).map(|i| i.to_string()).collect()
    }

    fn get(&self, name: &str) -> Option<Value> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        parse_index(name).and_then(|i| items.get(i).cloned())
    }

    fn set(&self, name: &str, value: Value) -> Result<(), HostError> {
        let idx = parse_index(name)
            .ok_or_else(|| HostError::new(format!("'{name}' is not an array index")))?;
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        if idx >= items.len() {
            items.resize(idx + 1, Value::Null);
        }
        items[idx] = value;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), HostError> {
        // Leaves a hole, like deleting an element of a sparse array.
        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = parse_index(name).and_then(|i| items.get_mut(i)) {
            *slot = Value::Null;
        }
        Ok(())
    }

    fn length(&self) -> Option<usize> {
        Some(self.items.read().unwrap_or_else(|e| e.into_inner()).len())
    }
}

type CallFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, HostError>> + Send + Sync;

/// A callable object wrapping a closure.
pub struct FunctionObject {
    arity: usize,
    func: Box<CallFn>,
}

impl FunctionObject {
    /// Wrap an async closure. `arity` is reported as the `length` property.
    pub fn new<F, Fut>(arity: usize, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HostError>> + Send + 'static,
    {
        Self {
            arity,
            func: Box::new(move |args| func(args).boxed()),
        }
    }

    /// Wrap a synchronous closure.
    pub fn sync<F>(arity: usize, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        Self::new(arity, move |args| {
            let func = Arc::clone(&func);
            async move { func(args) }
        })
    }

    pub fn into_ref(self) -> ObjectRef {
        Arc::new(self)
    }
}

#[async_trait]
impl HostObject for FunctionObject {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Callable
    }

    fn keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    fn set(&self, name: &str, _value: Value) -> Result<(), HostError> {
        Err(HostError::new(format!(
            "Cannot assign property '{name}' on a function"
        )))
    }

    fn delete(&self, _name: &str) -> Result<(), HostError> {
        Ok(())
    }

    fn length(&self) -> Option<usize> {
        Some(self.arity)
    }

    async fn call(&self, args: Vec<Value>) -> Result<Value, HostError> {
        (self.func)(args).await
    }
}
