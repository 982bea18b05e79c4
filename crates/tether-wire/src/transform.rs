//! Value classification between local [`Value`]s and wire JSON.
//!
//! Outbound, primitives and by-value variants are encoded in place while
//! objects and inline containers are stored in the sender's spawn and
//! replaced by a `ref`. Inbound, `ref`s become [`RemoteObject`] proxies,
//! `local-ref`s are looked up in our own store and containers are resolved
//! member by member, concurrently.

use crate::host::{ArrayObject, ObjectRef, PlainObject};
use crate::link::Link;
use crate::remote::RemoteObject;
use crate::store::SpawnRef;
use crate::value::{retain_all_remotes, Members, RetainGuard, Value};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_types::wire::{handle_ref, tagged, untag};
use tether_types::{Handle, RpcError, TetherResult, WireTag};

/// Encode a value for the wire, storing objects in `spawn`.
pub fn prep_outbound_value(spawn: &SpawnRef, value: Value) -> TetherResult<Json> {
    let stored = |object: ObjectRef| -> TetherResult<Json> {
        spawn
            .put_object(object)
            .map(|object_id| handle_ref(WireTag::Ref, Handle::new(spawn.spawn_id(), object_id)))
            .ok_or_else(|| RpcError::invalid_object().into())
    };
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(b)),
        Value::Number(n) => Ok(Json::Number(n)),
        Value::String(s) => Ok(Json::String(s)),
        Value::Json(data) => Ok(tagged(WireTag::Json, data)),
        Value::Bytes(bytes) => Ok(tagged(WireTag::Binary, Json::String(BASE64.encode(bytes)))),
        Value::Error(message) => Ok(tagged(WireTag::Error, Json::String(message))),
        Value::OneLevel(Members::List(items)) => {
            let data = prep_outbound_arguments(spawn, items)?;
            Ok(tagged(WireTag::OneLevel, Json::Array(data)))
        }
        Value::OneLevel(Members::Map(map)) => {
            let data = map
                .into_iter()
                .map(|(name, member)| Ok((name, prep_outbound_value(spawn, member)?)))
                .collect::<TetherResult<Map<String, Json>>>()?;
            Ok(tagged(WireTag::OneLevel, Json::Object(data)))
        }
        Value::List(items) => stored(Arc::new(ArrayObject::new(items))),
        Value::Map(map) => stored(Arc::new(PlainObject::from_map(map))),
        Value::Object(object) => stored(object),
        // The other peer owns it; it resolves the handle in its own store.
        Value::Remote(remote) => Ok(handle_ref(WireTag::LocalRef, remote.handle())),
    }
}

/// Encode an argument list element-wise, preserving order.
pub fn prep_outbound_arguments(spawn: &SpawnRef, args: Vec<Value>) -> TetherResult<Vec<Json>> {
    args.into_iter()
        .map(|arg| prep_outbound_value(spawn, arg))
        .collect()
}

fn parse_handle(data: &Json) -> TetherResult<Handle> {
    serde_json::from_value(data.clone()).map_err(|_| RpcError::malformed().into())
}

/// Decode a wire value received over `link`.
pub fn prep_inbound_value(link: &Link, value: Json) -> BoxFuture<'static, TetherResult<Value>> {
    inbound(link.clone(), value).boxed()
}

async fn inbound(link: Link, value: Json) -> TetherResult<Value> {
    let Some((tag, data)) = untag(&value).map(|(tag, data)| (tag, data.clone())) else {
        return match value {
            Json::Array(_) | Json::Object(_) => resolve_container(&link, value).await,
            primitive => Ok(Value::from_json(primitive)),
        };
    };
    match tag {
        WireTag::LocalRef => {
            let handle = parse_handle(&data)?;
            // A stale local-ref resolves to nothing rather than failing.
            Ok(link
                .store()
                .get_object(handle)
                .map(Value::Object)
                .unwrap_or(Value::Null))
        }
        WireTag::Ref => {
            let handle = parse_handle(&data)?;
            RemoteObject::wrap(link, handle).await.map(Value::Remote)
        }
        WireTag::Json => Ok(Value::Json(data)),
        WireTag::Binary => {
            let encoded = data.as_str().ok_or_else(RpcError::malformed)?;
            let bytes = BASE64
                .decode(encoded)
                .map_err(|_| RpcError::malformed())?;
            Ok(Value::Bytes(bytes))
        }
        WireTag::Error => Ok(Value::Error(match data {
            Json::String(message) => message,
            other => other.to_string(),
        })),
        WireTag::OneLevel => resolve_container(&link, data).await,
    }
}

/// Decode an argument list, resolving every argument concurrently.
pub async fn prep_inbound_arguments(link: &Link, args: Vec<Json>) -> TetherResult<Vec<Value>> {
    let (values, guards) = resolve_members(link, args).await;
    drop(guards);
    values.into_iter().collect()
}

/// Resolve members concurrently, retaining each proxy as soon as it appears.
///
/// The returned guards keep those proxies alive until the caller drops them,
/// so a slow sibling cannot let an earlier proxy auto-release.
async fn resolve_members(
    link: &Link,
    members: Vec<Json>,
) -> (Vec<TetherResult<Value>>, Vec<RetainGuard>) {
    let pending = members.into_iter().map(|member| {
        prep_inbound_value(link, member).map(|result| {
            let guard = result.as_ref().ok().map(retain_all_remotes);
            (result, guard)
        })
    });
    let (values, guards): (Vec<_>, Vec<_>) = join_all(pending).await.into_iter().unzip();
    (values, guards.into_iter().flatten().collect())
}

async fn resolve_container(link: &Link, data: Json) -> TetherResult<Value> {
    match data {
        Json::Array(items) => {
            let (values, guards) = resolve_members(link, items).await;
            let result = values.into_iter().collect::<TetherResult<Vec<_>>>();
            drop(guards);
            result.map(Value::List)
        }
        Json::Object(map) => {
            let (names, members): (Vec<String>, Vec<Json>) = map.into_iter().unzip();
            let (values, guards) = resolve_members(link, members).await;
            let result = names
                .into_iter()
                .zip(values)
                .map(|(name, value)| Ok((name, value?)))
                .collect::<TetherResult<BTreeMap<_, _>>>();
            drop(guards);
            result.map(Value::Map)
        }
        other => Ok(Value::from_json(other)),
    }
}
