// Real-time projection layer. Each subscription re-runs its query when a
// relevant store change lands and hands the consumer the full current
// result set - never a diff - so consumers replace their local copy
// wholesale. The registry owns every listener's teardown and guarantees
// it runs exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Event, Rsvp, UserProfile};
use crate::store::{MeetStore, StoreChange};

pub type ListenerId = String;

/// Snapshot callback; each invocation carries the authoritative current
/// result set for the subscribed query.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct ProjectionRegistry {
    store: Arc<MeetStore>,
    listeners: Mutex<HashMap<ListenerId, JoinHandle<()>>>,
}

impl ProjectionRegistry {
    pub fn new(store: Arc<MeetStore>) -> Self {
        Self {
            store,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Live ordered query over all events (date ascending).
    pub fn subscribe_to_events(&self, handler: Handler<Vec<Event>>) -> ListenerId {
        let store = self.store.clone();
        self.register(
            |change| matches!(change, StoreChange::Events { .. }),
            move || {
                let store = store.clone();
                async move { store.list_events().await }
            },
            handler,
        )
    }

    pub fn subscribe_to_event(&self, event_id: &str, handler: Handler<Option<Event>>) -> ListenerId {
        let store = self.store.clone();
        let id = event_id.to_string();
        let filter_id = id.clone();
        self.register(
            move |change| {
                matches!(change, StoreChange::Events { id } if *id == filter_id)
            },
            move || {
                let store = store.clone();
                let id = id.clone();
                async move { store.get_event(&id).await }
            },
            handler,
        )
    }

    pub fn subscribe_to_event_rsvps(
        &self,
        event_id: &str,
        handler: Handler<Vec<Rsvp>>,
    ) -> ListenerId {
        let store = self.store.clone();
        let id = event_id.to_string();
        let filter_id = id.clone();
        self.register(
            move |change| {
                matches!(change, StoreChange::Rsvps { event_id, .. } if *event_id == filter_id)
            },
            move || {
                let store = store.clone();
                let id = id.clone();
                async move { store.list_rsvps_for_event(&id).await }
            },
            handler,
        )
    }

    pub fn subscribe_to_user_rsvps(
        &self,
        user_id: &str,
        handler: Handler<Vec<Rsvp>>,
    ) -> ListenerId {
        let store = self.store.clone();
        let id = user_id.to_string();
        let filter_id = id.clone();
        self.register(
            move |change| {
                matches!(change, StoreChange::Rsvps { user_id, .. } if *user_id == filter_id)
            },
            move || {
                let store = store.clone();
                let id = id.clone();
                async move { store.list_rsvps_for_user(&id).await }
            },
            handler,
        )
    }

    pub fn subscribe_to_user(
        &self,
        user_id: &str,
        handler: Handler<Option<UserProfile>>,
    ) -> ListenerId {
        let store = self.store.clone();
        let id = user_id.to_string();
        let filter_id = id.clone();
        self.register(
            move |change| {
                matches!(change, StoreChange::Users { id } if *id == filter_id)
            },
            move || {
                let store = store.clone();
                let id = id.clone();
                async move { store.get_user(&id).await }
            },
            handler,
        )
    }

    /// Tear down one listener and wait for its task to finish. Idempotent:
    /// the handle leaves the registry before being aborted, so the
    /// teardown runs at most once.
    pub async fn unsubscribe(&self, listener_id: &ListenerId) {
        let handle = self
            .listeners
            .lock()
            .expect("listener registry poisoned")
            .remove(listener_id);
        if let Some(handle) = handle {
            handle.abort();
            // Awaiting the aborted handle ensures an in-flight handler
            // invocation has finished before this returns.
            let _ = handle.await;
        }
    }

    /// Tear down every registered listener, waiting for each task to
    /// finish. After this returns, no store callback reaches a previously
    /// registered handler. Used at application-level unmount; a leaked
    /// listener would keep mutating consumer state after its view is gone.
    pub async fn cleanup(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut listeners = self.listeners.lock().expect("listener registry poisoned");
            listeners.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn active_listeners(&self) -> usize {
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .len()
    }

    fn register<T, M, Q, Fut>(&self, matches: M, query: Q, handler: Handler<T>) -> ListenerId
    where
        T: Send + 'static,
        M: Fn(&StoreChange) -> bool + Send + 'static,
        Q: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<T>> + Send,
    {
        // Subscribe to the change feed before the initial query so no
        // write can slip between snapshot and first notification.
        let mut rx = self.store.subscribe_changes();

        let task = tokio::spawn(async move {
            match query().await {
                Ok(snapshot) => handler(snapshot),
                Err(err) => warn!("Initial projection snapshot failed: {}", err),
            }

            loop {
                match rx.recv().await {
                    Ok(change) => {
                        if !matches(&change) {
                            continue;
                        }
                    }
                    // Fell behind the feed: resynchronize by re-querying.
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Projection listener lagged, resyncing");
                    }
                    Err(RecvError::Closed) => break,
                }

                match query().await {
                    Ok(snapshot) => handler(snapshot),
                    Err(err) => warn!("Projection re-query failed: {}", err),
                }
            }
        });

        let listener_id = Uuid::new_v4().to_string();
        self.listeners
            .lock()
            .expect("listener registry poisoned")
            .insert(listener_id.clone(), task);
        listener_id
    }
}

// Best effort only: Drop cannot await, so tasks are aborted without
// joining. Callers wanting the strict no-callback guarantee use cleanup().
impl Drop for ProjectionRegistry {
    fn drop(&mut self) {
        let mut listeners = self.listeners.lock().expect("listener registry poisoned");
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
    }
}
