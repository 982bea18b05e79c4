//! Builtin `toolkit` object type.
//!
//! Gives the other peer a few helpers that only make sense on the owning
//! side: reading a container by value one level deep and scheduling a call.

use crate::dispatch::TypeRegistry;
use crate::host::{HostError, ObjectKind, ObjectRef, PlainObject};
use crate::value::{retain_all_remotes, Members, Value};

use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::time::Duration;
use tether_types::{ErrorKind, RpcError, TetherError};
use tracing::{debug, warn};

/// Mimetype the toolkit is registered under.
pub const TOOLKIT_MIMETYPE: &str = "toolkit";

/// Register the toolkit type with `types`.
pub fn register(types: &TypeRegistry) -> Result<(), RpcError> {
    types.register(TOOLKIT_MIMETYPE, |_args| Ok(toolkit()))
}

/// Build a toolkit root object.
pub fn toolkit() -> ObjectRef {
    PlainObject::new()
        .with_method("eval", 1, |_| Err(HostError::new("eval not supported")))
        .with_method("readArray", 1, |args| read_array(args.into_iter().next()))
        .with_method("readObject", 1, |args| read_object(args.into_iter().next()))
        .with_method("invokeWithDelay", 4, invoke_with_delay)
        .into_ref()
}

fn read_array(value: Option<Value>) -> Result<Value, HostError> {
    let items = match value {
        None | Some(Value::Null) => {
            return Err(HostError::new("Invalid arguments, array does not exist"))
        }
        Some(Value::List(items)) => items,
        Some(Value::Json(Json::Array(items))) => items.into_iter().map(Value::from_json).collect(),
        Some(Value::Object(object)) if object.kind() == ObjectKind::Array => object
            .keys()
            .iter()
            .map(|key| object.get(key).unwrap_or_default())
            .collect(),
        Some(_) => return Err(HostError::new("Invalid arguments, array is not an array")),
    };
    Ok(Value::OneLevel(Members::List(items)))
}

fn read_object(value: Option<Value>) -> Result<Value, HostError> {
    let map = match value {
        None | Some(Value::Null) => {
            return Err(HostError::new("Invalid arguments, object does not exist"))
        }
        Some(Value::Map(map)) => map,
        Some(Value::Json(Json::Object(map))) => map
            .into_iter()
            .map(|(name, v)| (name, Value::from_json(v)))
            .collect(),
        Some(Value::Object(object)) if object.kind() == ObjectKind::Plain => object
            .keys()
            .into_iter()
            .filter_map(|key| object.get(&key).map(|v| (key, v)))
            .collect::<BTreeMap<_, _>>(),
        Some(_) => return Err(HostError::new("Invalid arguments, object is not an object")),
    };
    Ok(Value::OneLevel(Members::Map(map)))
}

fn invalid_delay_args() -> HostError {
    HostError::new(
        "Invalid arguments: Must provide at least delay (Number), obj (Function or Object), and args (Array)",
    )
}

/// `invokeWithDelay(delay, target, args, name?)`
fn invoke_with_delay(args: Vec<Value>) -> Result<Value, HostError> {
    let mut args = args.into_iter();
    let delay = args
        .next()
        .and_then(|d| d.as_f64())
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
        .ok_or_else(invalid_delay_args)?;
    let target = args.next().unwrap_or_default();
    let call_args = match args.next() {
        Some(Value::List(items)) => items,
        Some(Value::Json(Json::Array(items))) => items.into_iter().map(Value::from_json).collect(),
        _ => return Err(invalid_delay_args()),
    };
    let name = match args.next() {
        Some(Value::String(name)) if !name.is_empty() => Some(name),
        _ => None,
    };

    let callee = match (&target, &name) {
        (Value::Remote(_), _) => target.clone(),
        (Value::Object(object), Some(name)) => object.get(name).unwrap_or_default(),
        (Value::Object(_), None) => target.clone(),
        _ => Value::Null,
    };
    if !callee.is_callable() {
        return Err(invalid_delay_args());
    }

    let held = Value::List(vec![callee.clone(), Value::List(call_args.clone())]);
    let hold = retain_all_remotes(&held);
    debug!(delay_ms = delay.as_millis() as u64, "scheduling delayed invoke");

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let result = match (&callee, &name) {
            (Value::Remote(remote), Some(name)) => remote.invoke(name, call_args).await.map(drop),
            (Value::Remote(remote), None) => remote.call(call_args).await.map(drop),
            (Value::Object(object), _) => object
                .call(call_args)
                .await
                .map(drop)
                .map_err(|e| TetherError::Rpc(RpcError::new(ErrorKind::ExceptionThrown, e.0))),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "delayed invoke failed");
        }
        hold.release();
    });
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ArrayObject, FunctionObject};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_register() {
        let types = TypeRegistry::new();
        register(&types).unwrap();
        assert!(types.contains(TOOLKIT_MIMETYPE));
    }

    #[test]
    fn test_read_array() {
        let out = read_array(Some(Value::List(vec![Value::from(1)]))).unwrap();
        assert_eq!(out, Value::OneLevel(Members::List(vec![Value::from(1)])));
        let arr = ArrayObject::new(vec![Value::from("a")]).into_ref();
        let out = read_array(Some(Value::Object(arr))).unwrap();
        assert_eq!(out, Value::OneLevel(Members::List(vec![Value::from("a")])));
        assert_eq!(
            read_array(None).unwrap_err().0,
            "Invalid arguments, array does not exist"
        );
        assert_eq!(
            read_array(Some(Value::from(3))).unwrap_err().0,
            "Invalid arguments, array is not an array"
        );
    }

    #[test]
    fn test_read_object() {
        let obj = PlainObject::new().with("k", 2).into_ref();
        let out = read_object(Some(Value::Object(obj))).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("k".to_string(), Value::from(2));
        assert_eq!(out, Value::OneLevel(Members::Map(expected)));
        assert_eq!(
            read_object(Some(Value::from("x"))).unwrap_err().0,
            "Invalid arguments, object is not an object"
        );
    }

    #[tokio::test]
    async fn test_eval_is_refused() {
        let tk = toolkit();
        let Some(Value::Object(eval)) = tk.get("eval") else {
            panic!("eval missing");
        };
        assert_eq!(
            eval.call(vec![Value::from("1+1")]).await.unwrap_err().0,
            "eval not supported"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_with_delay_local() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let target = PlainObject::new().with(
            "bump",
            FunctionObject::sync(1, move |args| {
                let by = args.first().and_then(Value::as_u64).unwrap_or(1) as usize;
                counter.fetch_add(by, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        );
        let out = invoke_with_delay(vec![
            Value::from(100),
            Value::from(target),
            Value::List(vec![Value::from(5)]),
            Value::from("bump"),
        ])
        .unwrap();
        assert_eq!(out, Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_invoke_with_delay_validation() {
        let err = invoke_with_delay(vec![
            Value::from("soon"),
            Value::from(PlainObject::new()),
            Value::List(vec![]),
        ])
        .unwrap_err();
        assert!(err.0.starts_with("Invalid arguments"));
        let err = invoke_with_delay(vec![
            Value::from(1),
            Value::from(PlainObject::new()),
            Value::List(vec![]),
        ])
        .unwrap_err();
        assert!(err.0.starts_with("Invalid arguments"));
    }

    #[test]
    fn test_invoke_with_delay_rejects_unrepresentable_delay() {
        let target = || Value::from(PlainObject::new().with_method("f", 0, |_| Ok(Value::Null)));
        for delay in [1e300, -5.0, f64::MAX] {
            let err = invoke_with_delay(vec![
                Value::from(delay),
                target(),
                Value::List(vec![]),
                Value::from("f"),
            ])
            .unwrap_err();
            assert!(err.0.starts_with("Invalid arguments"), "delay {delay}");
        }
    }
}
