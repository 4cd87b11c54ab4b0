//! Observable key/value state shared between the agent and the coordinator.
//!
//! [`SharedState`] is a cheap handle; clones share one map and one
//! subscriber list. Every mutation notifies all subscribers in the order
//! they subscribed. Each notification carries the [`ChangeOrigin`] so the
//! channel can forward local edits without echoing remote ones.
//!
//! The API is split by execution context:
//!
//! | call                          | allowed from          | misuse error               |
//! |-------------------------------|-----------------------|----------------------------|
//! | `set`, `delete`               | plain threads         | [`StateError::AsyncContext`] |
//! | `set_async`, `update_async`, `delete_async` | inside a tokio runtime | [`StateError::SyncContext`] |
//!
//! Reads (`get`, `contains_key`, `len`, `snapshot`) work anywhere and never notify.

use crate::error::StateError;
use acqsync_protocol::{ChannelMessage, MessageKind, StateValue};
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::{Builder, Handle};
use tracing::debug;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Made through this process's API
    Local,
    /// Applied from a coordinator message
    Remote,
}

/// One mutation, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub key: String,
    /// New value; for partial updates only the merged-in map. `None` on delete.
    pub value: Option<StateValue>,
    pub kind: MessageKind,
    pub origin: ChangeOrigin,
}

impl StateChange {
    /// Wire form of the change. Deletes go out as a null full update.
    pub fn to_message(&self) -> ChannelMessage {
        ChannelMessage {
            kind: self.kind,
            attribute: self.key.clone(),
            value: self.value.clone().unwrap_or(StateValue::Null),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type SyncCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;
type AsyncCallback = Arc<dyn Fn(StateChange) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
enum Subscriber {
    Sync(SyncCallback),
    Async(AsyncCallback),
}

#[derive(Default)]
struct Inner {
    values: BTreeMap<String, StateValue>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SharedState")
            .field("values", &inner.values)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.lock().values.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.lock().values.clone()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe_sync<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.add_subscriber(Subscriber::Sync(Arc::new(callback)))
    }

    pub fn subscribe_async<F, Fut>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(StateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: AsyncCallback = Arc::new(move |change| Box::pin(callback(change)));
        self.add_subscriber(Subscriber::Async(boxed))
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    fn add_subscriber(&self, subscriber: Subscriber) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, subscriber));
        id
    }

    // ========================================================================
    // Synchronous mutation
    // ========================================================================

    /// Replace `key`. Async subscribers are driven on a temporary runtime.
    pub fn set(&self, key: impl Into<String>, value: impl Into<StateValue>) -> Result<()> {
        if Handle::try_current().is_ok() {
            return Err(StateError::AsyncContext);
        }
        let change = self.apply_set(key.into(), value.into(), ChangeOrigin::Local);
        self.notify_blocking(&change)
    }

    /// Remove `key`, returning its value. Subscribers are only notified when
    /// something was removed.
    pub fn delete(&self, key: &str) -> Result<Option<StateValue>> {
        if Handle::try_current().is_ok() {
            return Err(StateError::AsyncContext);
        }
        let Some((removed, change)) = self.apply_delete(key, ChangeOrigin::Local) else {
            return Ok(None);
        };
        self.notify_blocking(&change)?;
        Ok(Some(removed))
    }

    // ========================================================================
    // Asynchronous mutation
    // ========================================================================

    pub async fn set_async(&self, key: impl Into<String>, value: impl Into<StateValue>) -> Result<()> {
        ensure_runtime()?;
        let change = self.apply_set(key.into(), value.into(), ChangeOrigin::Local);
        self.notify(&change).await;
        Ok(())
    }

    /// Merge `value` into `key` when both are maps (notifying a partial
    /// update), otherwise replace it.
    pub async fn update_async(&self, key: impl Into<String>, value: impl Into<StateValue>) -> Result<()> {
        ensure_runtime()?;
        let change = self.apply_merge(key.into(), value.into(), ChangeOrigin::Local);
        self.notify(&change).await;
        Ok(())
    }

    pub async fn delete_async(&self, key: &str) -> Result<Option<StateValue>> {
        ensure_runtime()?;
        let Some((removed, change)) = self.apply_delete(key, ChangeOrigin::Local) else {
            return Ok(None);
        };
        self.notify(&change).await;
        Ok(Some(removed))
    }

    /// Apply a coordinator message. The resulting change is marked
    /// [`ChangeOrigin::Remote`].
    pub async fn apply_remote(&self, message: &ChannelMessage) -> Result<()> {
        ensure_runtime()?;
        let change = match message.kind {
            MessageKind::StateUpdate => {
                self.apply_set(message.attribute.clone(), message.value.clone(), ChangeOrigin::Remote)
            }
            MessageKind::StateUpdatePartial => {
                self.apply_merge(message.attribute.clone(), message.value.clone(), ChangeOrigin::Remote)
            }
        };
        debug!(key = %change.key, kind = %change.kind, "Applied remote state change");
        self.notify(&change).await;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_set(&self, key: String, value: StateValue, origin: ChangeOrigin) -> StateChange {
        self.lock().values.insert(key.clone(), value.clone());
        StateChange {
            key,
            value: Some(value),
            kind: MessageKind::StateUpdate,
            origin,
        }
    }

    fn apply_merge(&self, key: String, value: StateValue, origin: ChangeOrigin) -> StateChange {
        let mut inner = self.lock();
        let merged = match (inner.values.get_mut(&key), &value) {
            (Some(StateValue::Object(existing)), StateValue::Object(update)) => {
                for (k, v) in update {
                    existing.insert(k.clone(), v.clone());
                }
                true
            }
            _ => false,
        };
        drop(inner);

        if !merged {
            return self.apply_set(key, value, origin);
        }
        StateChange {
            key,
            value: Some(value),
            kind: MessageKind::StateUpdatePartial,
            origin,
        }
    }

    fn apply_delete(&self, key: &str, origin: ChangeOrigin) -> Option<(StateValue, StateChange)> {
        let removed = self.lock().values.remove(key)?;
        Some((
            removed,
            StateChange {
                key: key.to_string(),
                value: None,
                kind: MessageKind::StateUpdate,
                origin,
            },
        ))
    }

    fn subscribers(&self) -> Vec<Subscriber> {
        self.lock().subscribers.iter().map(|(_, s)| s.clone()).collect()
    }

    async fn notify(&self, change: &StateChange) {
        for subscriber in self.subscribers() {
            match subscriber {
                Subscriber::Sync(callback) => callback(change),
                Subscriber::Async(callback) => callback(change.clone()).await,
            }
        }
    }

    fn notify_blocking(&self, change: &StateChange) -> Result<()> {
        let subscribers = self.subscribers();
        let runtime = if subscribers.iter().any(|s| matches!(s, Subscriber::Async(_))) {
            Some(Builder::new_current_thread().enable_all().build()?)
        } else {
            None
        };
        for subscriber in subscribers {
            match (subscriber, &runtime) {
                (Subscriber::Sync(callback), _) => callback(change),
                (Subscriber::Async(callback), Some(rt)) => rt.block_on(callback(change.clone())),
                (Subscriber::Async(_), None) => {}
            }
        }
        Ok(())
    }
}

fn ensure_runtime() -> Result<()> {
    Handle::try_current().map(|_| ()).map_err(|_| StateError::SyncContext)
}
