//! Command dispatcher: answers the other peer's commands.
//!
//! Every inbound command is shape-checked first; anything malformed fails
//! uniformly before routing. `New` and `Destroy` act on the spawn table and
//! the type registry, all other commands resolve their handle against the
//! [`ObjectStore`](crate::store::ObjectStore) and act on the stored object.

use crate::channel::CommandHandler;
use crate::host::{HostError, ObjectKind, ObjectRef};
use crate::link::Link;
use crate::message::Command;
use crate::transform::{prep_inbound_arguments, prep_inbound_value, prep_outbound_value};
use crate::value::Value;
use crate::LOCAL_RELEASE_DELAY;

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tether_types::{ErrorKind, Handle, RpcError, SpawnId};
use tracing::{debug, info, warn};

/// Builds the root object of a new spawn from the raw `New` arguments.
pub type Factory = dyn Fn(Json) -> Result<ObjectRef, HostError> + Send + Sync;

/// Mimetype → factory table shared by every peer of a node.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<Factory>>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a creatable object type, replacing any previous factory.
    pub fn register<F>(&self, mimetype: &str, factory: F) -> Result<(), RpcError>
    where
        F: Fn(Json) -> Result<ObjectRef, HostError> + Send + Sync + 'static,
    {
        if mimetype.trim().is_empty() {
            return Err(RpcError::new(
                ErrorKind::InvalidObjectType,
                "Must provide a valid object type, e.g. application/myApp",
            ));
        }
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(mimetype.to_string(), Arc::new(factory));
        debug!(mimetype, "object type registered");
        Ok(())
    }

    pub fn get(&self, mimetype: &str) -> Option<Arc<Factory>> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.get(mimetype).cloned()
    }

    pub fn contains(&self, mimetype: &str) -> bool {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.contains_key(mimetype)
    }

    pub fn mimetypes(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Interprets inbound commands against one peer's store.
#[derive(Clone)]
pub struct Dispatcher {
    link: Link,
    types: TypeRegistry,
}

impl Dispatcher {
    pub fn new(link: Link, types: TypeRegistry) -> Self {
        Self { link, types }
    }

    /// Validate and execute one raw command.
    pub async fn dispatch(&self, raw: Json) -> Result<Json, RpcError> {
        let command = match Command::parse(&raw) {
            Ok(command) => command,
            Err(e) => {
                warn!(command = %raw, "rejecting malformed command");
                return Err(e);
            }
        };
        debug!(command = command.name(), handle = ?command.handle(), "dispatching");

        match command {
            Command::New { mimetype, args } => self.handle_new(&mimetype, args),
            Command::Destroy { spawn_id } => self.handle_destroy(spawn_id),
            Command::Enum { handle } => Ok(handle_enum(&self.resolve(handle)?)),
            Command::GetP { handle, name } => self.handle_get(handle, &name),
            Command::SetP {
                handle,
                name,
                value,
            } => self.handle_set(handle, &name, value).await,
            Command::DelP { handle, name } => self.handle_delete(handle, &name),
            Command::RelObj { handle } => self.handle_release(handle),
            Command::Invoke { handle, name, args } => self.handle_invoke(handle, &name, args).await,
        }
    }

    fn resolve(&self, handle: Handle) -> Result<ObjectRef, RpcError> {
        self.link
            .store()
            .get_object(handle)
            .ok_or_else(RpcError::invalid_object)
    }

    /// Encode a result into the spawn the command addressed.
    fn outbound(&self, handle: Handle, value: Value, kind: ErrorKind) -> Result<Json, RpcError> {
        let spawn = self
            .link
            .store()
            .spawn(handle.spawn_id)
            .ok_or_else(RpcError::invalid_object)?;
        prep_outbound_value(&spawn, value).map_err(|e| e.into_rpc(kind))
    }

    fn handle_new(&self, mimetype: &str, args: Json) -> Result<Json, RpcError> {
        let factory = self.types.get(mimetype).ok_or_else(|| {
            RpcError::new(
                ErrorKind::InvalidObjectType,
                format!("Object type {mimetype} is not supported"),
            )
        })?;
        let args = if args.is_null() { json!({}) } else { args };
        let root = factory(args)
            .map_err(|e| RpcError::new(ErrorKind::CouldNotCreateObject, e.0))?;
        let spawn_id = self.link.store().new_spawn(root);
        info!(mimetype, spawn_id, "object created");
        Ok(json!(spawn_id))
    }

    fn handle_destroy(&self, spawn_id: SpawnId) -> Result<Json, RpcError> {
        let missing =
            || RpcError::new(ErrorKind::CouldNotDestroyObject, "The object does not exist");
        let root = self
            .link
            .store()
            .destroy_spawn(spawn_id)
            .ok_or_else(missing)?;
        root.on_destroy()
            .map_err(|e| RpcError::new(ErrorKind::CouldNotDestroyObject, e.0))?;
        Ok(json!(spawn_id))
    }

    fn handle_get(&self, handle: Handle, name: &str) -> Result<Json, RpcError> {
        let object = self.resolve(handle)?;
        let value = match object.get(name) {
            Some(value) => value,
            None => synthetic_length(&object, name)
                .ok_or_else(|| RpcError::missing_property(ErrorKind::CouldNotGetProperty))?,
        };
        self.outbound(handle, value, ErrorKind::CouldNotGetProperty)
    }

    async fn handle_set(&self, handle: Handle, name: &str, value: Json) -> Result<Json, RpcError> {
        let object = self.resolve(handle)?;
        if object.get(name).is_none() {
            return Err(RpcError::missing_property(ErrorKind::CouldNotSetProperty));
        }
        let value = prep_inbound_value(&self.link, value)
            .await
            .map_err(|e| e.into_rpc(ErrorKind::CouldNotSetProperty))?;
        self.link
            .store()
            .set_object_property(handle, name, value)
            .map_err(|e| RpcError::new(ErrorKind::CouldNotSetProperty, e.0))?;
        Ok(Json::Null)
    }

    fn handle_delete(&self, handle: Handle, name: &str) -> Result<Json, RpcError> {
        let object = self.resolve(handle)?;
        if object.get(name).is_none() {
            return Err(RpcError::missing_property(ErrorKind::CouldNotDeleteProperty));
        }
        self.link
            .store()
            .delete_object_property(handle, name)
            .map_err(|e| {
                RpcError::new(
                    ErrorKind::CouldNotDeleteProperty,
                    format!("The property could not be deleted: {e}"),
                )
            })?;
        Ok(Json::Null)
    }

    fn handle_release(&self, handle: Handle) -> Result<Json, RpcError> {
        self.resolve(handle)?;
        // Roots only go away through Destroy.
        if handle.is_root() {
            return Ok(Json::Null);
        }
        let store = self.link.store().clone();
        tokio::spawn(async move {
            tokio::time::sleep(LOCAL_RELEASE_DELAY).await;
            if store.release_object(handle) {
                debug!(%handle, "object forgotten after RelObj");
            }
        });
        Ok(Json::Null)
    }

    async fn handle_invoke(
        &self,
        handle: Handle,
        name: &str,
        args: Vec<Json>,
    ) -> Result<Json, RpcError> {
        let object = self.resolve(handle)?;
        let kind = if name.is_empty() {
            ErrorKind::CouldNotInvokeObject
        } else {
            ErrorKind::CouldNotInvokeProperty
        };

        let target = if name.is_empty() {
            if object.kind() != ObjectKind::Callable {
                return Err(RpcError::new(kind, "The object is not callable"));
            }
            Value::Object(object)
        } else {
            let property = object
                .get(name)
                .ok_or_else(|| RpcError::missing_property(kind.clone()))?;
            if !property.is_callable() {
                return Err(RpcError::new(kind, "Property is not callable"));
            }
            property
        };

        let args = prep_inbound_arguments(&self.link, args)
            .await
            .map_err(|e| e.into_rpc(kind.clone()))?;

        let result = match &target {
            Value::Object(callable) => callable
                .call(args)
                .await
                .map_err(|e| RpcError::new(ErrorKind::ExceptionThrown, e.0))?,
            // A proxy stored as a property: forward the call to its owner.
            Value::Remote(remote) => remote
                .call(args)
                .await
                .map_err(|e| e.into_rpc(ErrorKind::ExceptionThrown))?,
            _ => return Err(RpcError::new(kind, "Property is not callable")),
        };

        if let Value::Error(message) = &result {
            return Err(RpcError::new(
                ErrorKind::ExceptionThrown,
                format!("Invoke error: {message}"),
            ));
        }
        self.outbound(handle, result, kind)
    }
}

#[async_trait]
impl CommandHandler for Dispatcher {
    async fn handle(&self, command: Json) -> Result<Json, RpcError> {
        self.dispatch(command).await
    }
}

fn handle_enum(object: &ObjectRef) -> Json {
    let mut names: Vec<String> = object
        .keys()
        .into_iter()
        .filter(|name| !name.starts_with('_'))
        .collect();
    if matches!(object.kind(), ObjectKind::Array | ObjectKind::Callable) {
        names.push("length".to_string());
    }
    json!(names)
}

fn synthetic_length(object: &ObjectRef, name: &str) -> Option<Value> {
    (name == "length")
        .then(|| object.length())
        .flatten()
        .map(Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LoopbackChannel;
    use crate::host::{ArrayObject, FunctionObject, PlainObject};
    use crate::store::ObjectStore;

    fn dispatcher() -> Dispatcher {
        let (a, _b) = LoopbackChannel::pair();
        let types = TypeRegistry::new();
        types
            .register("app/x", |_args| {
                Ok(PlainObject::new()
                    .with("a", 1)
                    .with_method("fn", 2, |args| {
                        let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                        let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                        Ok(Value::from(a * b))
                    })
                    .with("_private", true)
                    .into_ref())
            })
            .unwrap();
        types
            .register("app/broken", |_args| Err(HostError::new("no can do")))
            .unwrap();
        Dispatcher::new(Link::new(a, ObjectStore::new()), types)
    }

    async fn err_of(d: &Dispatcher, raw: Json) -> RpcError {
        d.dispatch(raw).await.unwrap_err()
    }

    #[test]
    fn test_register_rejects_empty_mimetype() {
        let types = TypeRegistry::new();
        let err = types
            .register("", |_| Ok(PlainObject::new().into_ref()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidObjectType);
        assert!(types.mimetypes().is_empty());
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let d = dispatcher();
        assert_eq!(d.dispatch(json!(["New", "app/x", {}])).await.unwrap(), json!(1));
        assert_eq!(d.dispatch(json!(["Enum", 1, 0])).await.unwrap(), json!(["a", "fn"]));
        assert_eq!(d.dispatch(json!(["GetP", 1, 0, "a"])).await.unwrap(), json!(1));
        assert_eq!(
            d.dispatch(json!(["SetP", 1, 0, "a", "y"])).await.unwrap(),
            Json::Null
        );
        assert_eq!(d.dispatch(json!(["GetP", 1, 0, "a"])).await.unwrap(), json!("y"));
        assert_eq!(
            d.dispatch(json!(["Invoke", 1, 0, "fn", [6, 7]])).await.unwrap(),
            json!(42)
        );
        assert_eq!(d.dispatch(json!(["Destroy", 1])).await.unwrap(), json!(1));
        let err = err_of(&d, json!(["Enum", 1, 0])).await;
        assert_eq!(err.kind, ErrorKind::InvalidObject);
        assert_eq!(err.message, "The object does not exist");
    }

    #[tokio::test]
    async fn test_new_failures() {
        let d = dispatcher();
        let err = err_of(&d, json!(["New", "stuff", {}])).await;
        assert_eq!(err.kind, ErrorKind::InvalidObjectType);
        assert_eq!(err.message, "Object type stuff is not supported");
        let err = err_of(&d, json!(["New", "app/broken", null])).await;
        assert_eq!(err.kind, ErrorKind::CouldNotCreateObject);
        assert_eq!(err.message, "no can do");
    }

    #[tokio::test]
    async fn test_destroy_unknown_spawn() {
        let d = dispatcher();
        for raw in [json!(["Destroy", 0]), json!(["Destroy", 7])] {
            let err = err_of(&d, raw).await;
            assert_eq!(err.kind, ErrorKind::CouldNotDestroyObject);
        }
    }

    #[tokio::test]
    async fn test_malformed_is_uniform() {
        let d = dispatcher();
        for raw in [json!(["GetP", 1, 0]), json!(["Nope"]), json!({"a": 1})] {
            assert_eq!(err_of(&d, raw).await.kind, ErrorKind::MalformedMessage);
        }
    }

    #[tokio::test]
    async fn test_missing_properties() {
        let d = dispatcher();
        d.dispatch(json!(["New", "app/x", {}])).await.unwrap();
        let cases = [
            (json!(["GetP", 1, 0, "zz"]), ErrorKind::CouldNotGetProperty),
            (json!(["SetP", 1, 0, "zz", 1]), ErrorKind::CouldNotSetProperty),
            (json!(["DelP", 1, 0, "zz"]), ErrorKind::CouldNotDeleteProperty),
            (json!(["Invoke", 1, 0, "zz", []]), ErrorKind::CouldNotInvokeProperty),
        ];
        for (raw, kind) in cases {
            let err = err_of(&d, raw).await;
            assert_eq!(err.kind, kind);
            assert_eq!(err.message, "Property does not exist on this object");
        }
    }

    #[tokio::test]
    async fn test_invoke_non_callable() {
        let d = dispatcher();
        d.dispatch(json!(["New", "app/x", {}])).await.unwrap();
        let err = err_of(&d, json!(["Invoke", 1, 0, "a", []])).await;
        assert_eq!(err.kind, ErrorKind::CouldNotInvokeProperty);
        assert_eq!(err.message, "Property is not callable");
        let err = err_of(&d, json!(["Invoke", 1, 0, "", []])).await;
        assert_eq!(err.kind, ErrorKind::CouldNotInvokeObject);
    }

    #[tokio::test]
    async fn test_synthetic_length() {
        let d = dispatcher();
        let spawn = d.link.store().ad_hoc();
        let arr = spawn
            .put_object(ArrayObject::new(vec![Value::from(1), Value::from(2)]).into_ref())
            .unwrap();
        let func = spawn
            .put_object(FunctionObject::sync(3, |_| Ok(Value::Null)).into_ref())
            .unwrap();
        assert_eq!(
            d.dispatch(json!(["Enum", 0, arr])).await.unwrap(),
            json!(["0", "1", "length"])
        );
        assert_eq!(d.dispatch(json!(["GetP", 0, arr, "length"])).await.unwrap(), json!(2));
        assert_eq!(d.dispatch(json!(["Enum", 0, func])).await.unwrap(), json!(["length"]));
        assert_eq!(d.dispatch(json!(["GetP", 0, func, "length"])).await.unwrap(), json!(3));
        assert_eq!(d.dispatch(json!(["Invoke", 0, func, "", []])).await.unwrap(), Json::Null);
    }

    #[tokio::test]
    async fn test_exceptions_and_error_values() {
        let d = dispatcher();
        let obj = PlainObject::new()
            .with_method("throws", 0, |_| Err(HostError::new("kaboom")))
            .with_method("fails", 0, |_| Ok(Value::Error("soft".into())));
        let id = d.link.store().ad_hoc().put_object(obj.into_ref()).unwrap();
        let err = err_of(&d, json!(["Invoke", 0, id, "throws", []])).await;
        assert_eq!(err.kind, ErrorKind::ExceptionThrown);
        assert_eq!(err.message, "kaboom");
        let err = err_of(&d, json!(["Invoke", 0, id, "fails", []])).await;
        assert_eq!(err.kind, ErrorKind::ExceptionThrown);
        assert_eq!(err.message, "Invoke error: soft");
    }

    #[tokio::test]
    async fn test_delete_property() {
        let d = dispatcher();
        d.dispatch(json!(["New", "app/x", {}])).await.unwrap();
        d.dispatch(json!(["DelP", 1, 0, "a"])).await.unwrap();
        assert_eq!(d.dispatch(json!(["Enum", 1, 0])).await.unwrap(), json!(["fn"]));
    }

    #[tokio::test]
    async fn test_readonly_set_fails() {
        let d = dispatcher();
        let id = d
            .link
            .store()
            .ad_hoc()
            .put_object(PlainObject::new().with_readonly("k", 1).into_ref())
            .unwrap();
        let err = err_of(&d, json!(["SetP", 0, id, "k", 2])).await;
        assert_eq!(err.kind, ErrorKind::CouldNotSetProperty);
        assert!(err.message.contains("read only"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relobj_forgets_after_delay() {
        let d = dispatcher();
        let id = d
            .link
            .store()
            .ad_hoc()
            .put_object(PlainObject::new().into_ref())
            .unwrap();
        assert_eq!(d.dispatch(json!(["RelObj", 0, id])).await.unwrap(), Json::Null);
        assert!(d.dispatch(json!(["Enum", 0, id])).await.is_ok());
        tokio::time::sleep(LOCAL_RELEASE_DELAY * 2).await;
        let err = err_of(&d, json!(["Enum", 0, id])).await;
        assert_eq!(err.kind, ErrorKind::InvalidObject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relobj_ignores_roots() {
        let d = dispatcher();
        d.dispatch(json!(["New", "app/x", {}])).await.unwrap();
        d.dispatch(json!(["RelObj", 1, 0])).await.unwrap();
        tokio::time::sleep(LOCAL_RELEASE_DELAY * 2).await;
        assert!(d.dispatch(json!(["Enum", 1, 0])).await.is_ok());
    }
}
