//! Remote proxies: local stand-ins for objects owned by the other peer.
//!
//! A [`RemoteObject`] is created whenever an inbound value carries a `ref`.
//! It enumerates the target on construction and then exposes property access
//! and invocation, each translated into one wire command.
//!
//! Lifetime is reference counted. Every call the proxy makes holds a retain
//! until [`CALL_HOLD`] after the response arrives; once the count drops to
//! zero and stays there for [`RELEASE_GRACE`], the proxy sends `RelObj` and
//! becomes permanently released. Spawn roots are never `RelObj`'d; they are
//! torn down with [`RemoteObject::destroy`].

use crate::link::Link;
use crate::message::Command;
use crate::transform::{prep_inbound_value, prep_outbound_arguments, prep_outbound_value};
use crate::value::{retain_all_remotes, Value};
use crate::{CALL_HOLD, RELEASE_GRACE};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tether_types::{ErrorKind, Handle, ObjectId, RpcError, SpawnId, TetherError, TetherResult};
use tracing::{debug, warn};

#[derive(Default)]
struct RemoteState {
    ref_count: u32,
    released: bool,
    /// Bumped by every retain and every release reaching zero; a pending
    /// release only fires if nothing happened since it was scheduled.
    generation: u64,
}

struct RemoteInner {
    handle: Handle,
    link: Link,
    state: Mutex<RemoteState>,
    properties: RwLock<Vec<String>>,
}

/// Proxy for one `(spawnId, objectId)` owned by the other peer.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteInner>,
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("RemoteObject")
            .field("handle", &self.inner.handle)
            .field("ref_count", &state.ref_count)
            .field("released", &state.released)
            .finish()
    }
}

impl RemoteObject {
    /// Build a proxy for `handle`, discovering its property names with `Enum`.
    pub async fn wrap(link: Link, handle: Handle) -> TetherResult<Self> {
        let remote = Self {
            inner: Arc::new(RemoteInner {
                handle,
                link,
                state: Mutex::new(RemoteState::default()),
                properties: RwLock::new(Vec::new()),
            }),
        };
        let names = remote.send(Command::Enum { handle }).await?;
        let names: Vec<String> = serde_json::from_value(names)
            .map_err(|e| TetherError::InvalidResponse(format!("Enum of {handle}: {e}")))?;
        debug!(%handle, properties = names.len(), "remote object wrapped");
        *remote
            .inner
            .properties
            .write()
            .unwrap_or_else(|e| e.into_inner()) = names;
        Ok(remote)
    }

    pub fn handle(&self) -> Handle {
        self.inner.handle
    }

    pub fn spawn_id(&self) -> SpawnId {
        self.inner.handle.spawn_id
    }

    pub fn object_id(&self) -> ObjectId {
        self.inner.handle.object_id
    }

    pub fn is_root(&self) -> bool {
        self.inner.handle.is_root()
    }

    pub fn ref_count(&self) -> u32 {
        self.lock_state().ref_count
    }

    pub fn is_released(&self) -> bool {
        self.lock_state().released
    }

    /// Property names reported by `Enum` when the proxy was built.
    pub fn properties(&self) -> Vec<String> {
        self.inner
            .properties
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Named accessor for an enumerated property.
    pub fn accessor(&self, name: &str) -> Option<PropertyAccessor> {
        self.properties()
            .into_iter()
            .find(|p| p == name)
            .map(|name| PropertyAccessor {
                remote: self.clone(),
                name,
            })
    }

    /// One accessor per enumerated property.
    pub fn accessors(&self) -> BTreeMap<String, PropertyAccessor> {
        self.properties()
            .into_iter()
            .map(|name| {
                let accessor = PropertyAccessor {
                    remote: self.clone(),
                    name: name.clone(),
                };
                (name, accessor)
            })
            .collect()
    }

    /// True when both values are the same proxy instance.
    pub fn same_object(&self, other: &RemoteObject) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Take one counted reference. Fails once the proxy is released.
    pub fn retain(&self) -> TetherResult<()> {
        let mut state = self.lock_state();
        if state.released {
            return Err(TetherError::Released);
        }
        state.ref_count += 1;
        state.generation += 1;
        Ok(())
    }

    /// Drop one counted reference.
    ///
    /// Over-releasing clamps at zero. When the count reaches zero on a
    /// non-root proxy, `RelObj` is sent after [`RELEASE_GRACE`] unless the
    /// proxy is retained again in the meantime.
    pub fn release(&self) {
        let pending = {
            let mut state = self.lock_state();
            if state.ref_count == 0 {
                debug!(handle = %self.inner.handle, "release below zero ignored");
            }
            state.ref_count = state.ref_count.saturating_sub(1);
            if state.ref_count > 0 || state.released || self.is_root() {
                None
            } else {
                state.generation += 1;
                Some(state.generation)
            }
        };
        let Some(generation) = pending else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(handle = %self.inner.handle, "no runtime; release not scheduled");
            return;
        };
        let remote = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(RELEASE_GRACE).await;
            remote.release_if_unused(generation).await;
        });
    }

    async fn release_if_unused(&self, generation: u64) {
        {
            let mut state = self.lock_state();
            if state.released || state.ref_count > 0 || state.generation != generation {
                return;
            }
            state.released = true;
        }
        let handle = self.inner.handle;
        debug!(%handle, "sending RelObj");
        if let Err(e) = self.inner.link.send(Command::RelObj { handle }).await {
            warn!(%handle, error = %e, "RelObj failed");
        }
    }

    /// Read a property.
    ///
    /// `GetP` is issued immediately. The returned [`PropertyFetch`] can be
    /// awaited for the value or called when the property is a function.
    /// Must be called from within a tokio runtime.
    pub fn get_property(&self, name: &str) -> TetherResult<PropertyFetch> {
        self.ensure_live()?;
        let remote = self.clone();
        let command = Command::GetP {
            handle: self.inner.handle,
            name: name.to_string(),
        };
        let task = tokio::spawn(async move {
            let raw = remote.send(command).await?;
            prep_inbound_value(&remote.inner.link, raw).await
        });
        let value = async move {
            task.await
                .unwrap_or_else(|e| Err(TetherError::Transport(format!("GetP task failed: {e}"))))
        }
        .boxed()
        .shared();
        Ok(PropertyFetch { value })
    }

    pub async fn set_property(&self, name: &str, value: impl Into<Value>) -> TetherResult<()> {
        self.ensure_live()?;
        let spawn = self.inner.link.store().ad_hoc();
        let value = prep_outbound_value(&spawn, value.into())?;
        self.send(Command::SetP {
            handle: self.inner.handle,
            name: name.to_string(),
            value,
        })
        .await?;
        Ok(())
    }

    pub async fn delete_property(&self, name: &str) -> TetherResult<()> {
        self.ensure_live()?;
        self.send(Command::DelP {
            handle: self.inner.handle,
            name: name.to_string(),
        })
        .await?;
        Ok(())
    }

    /// Call a method; an empty `name` calls the object itself.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> TetherResult<Value> {
        self.ensure_live()?;
        let spawn = self.inner.link.store().ad_hoc();
        let args = prep_outbound_arguments(&spawn, args)?;
        let raw = self
            .send(Command::Invoke {
                handle: self.inner.handle,
                name: name.to_string(),
                args,
            })
            .await?;
        prep_inbound_value(&self.inner.link, raw).await
    }

    /// Call the object itself.
    pub async fn call(&self, args: Vec<Value>) -> TetherResult<Value> {
        self.invoke("", args).await
    }

    /// Destroy the spawn this root proxy addresses. Returns its spawn id.
    pub async fn destroy(&self) -> TetherResult<SpawnId> {
        if !self.is_root() {
            return Err(RpcError::new(
                ErrorKind::CouldNotDestroyObject,
                "Only root objects can be destroyed",
            )
            .into());
        }
        self.ensure_live()?;
        let spawn_id = self.spawn_id();
        let raw = self.inner.link.send(Command::Destroy { spawn_id }).await?;
        self.lock_state().released = true;
        debug!(spawn_id, "remote spawn destroyed");
        Ok(raw.as_u64().unwrap_or(spawn_id))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_live(&self) -> TetherResult<()> {
        if self.is_released() {
            return Err(TetherError::Released);
        }
        Ok(())
    }

    /// Send one command while holding a retain on this proxy.
    async fn send(&self, command: Command) -> TetherResult<Json> {
        self.retain()?;
        let _hold = CallHold {
            remote: self.clone(),
            delay: CALL_HOLD,
        };
        self.inner.link.send(command).await
    }
}

/// Releases the call's retain [`CALL_HOLD`] after the call settles or is dropped.
struct CallHold {
    remote: RemoteObject,
    delay: Duration,
}

impl Drop for CallHold {
    fn drop(&mut self) {
        let remote = self.remote.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let delay = self.delay;
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    remote.release();
                });
            }
            Err(_) => remote.release(),
        }
    }
}

/// A property read in flight: awaitable for the value, callable for methods.
#[derive(Clone)]
pub struct PropertyFetch {
    value: Shared<BoxFuture<'static, TetherResult<Value>>>,
}

impl PropertyFetch {
    pub async fn value(&self) -> TetherResult<Value> {
        self.value.clone().await
    }

    /// Call the fetched value.
    ///
    /// The fetched proxy is retained for the duration of the call and
    /// released once it settles, whatever the outcome.
    pub async fn call(&self, args: Vec<Value>) -> TetherResult<Value> {
        let value = self.value().await?;
        let Value::Remote(target) = &value else {
            return Err(RpcError::new(
                ErrorKind::CouldNotInvokeObject,
                "The object is not invokable",
            )
            .into());
        };
        let guard = retain_all_remotes(&value);
        let result = target.call(args).await;
        guard.release();
        result
    }
}

impl IntoFuture for PropertyFetch {
    type Output = TetherResult<Value>;
    type IntoFuture = Shared<BoxFuture<'static, TetherResult<Value>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.value
    }
}

/// Get/set capability bound to one enumerated property of a proxy.
#[derive(Clone)]
pub struct PropertyAccessor {
    remote: RemoteObject,
    name: String,
}

impl PropertyAccessor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> TetherResult<PropertyFetch> {
        self.remote.get_property(&self.name)
    }

    pub async fn set(&self, value: impl Into<Value>) -> TetherResult<()> {
        self.remote.set_property(&self.name, value).await
    }
}
