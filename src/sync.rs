// Client sync orchestrator: performs a backend write through the mutation
// layer, then waits until the store's change feed has carried the write,
// so callers observing through projections are guaranteed the
// notification was broadcast before the orchestrator returns. A
// mutation's return value alone never implies subscriber visibility;
// ordering between a write and its subscription callback is
// store-determined.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::warn;

use crate::auth::CallerIdentity;
use crate::error::AppResult;
use crate::models::{Event, Rsvp, RsvpStatus, UserProfile};
use crate::services::{EventInput, EventService, ProfileInput, UserService};
use crate::store::{MeetStore, StoreChange};

const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<MeetStore>,
    events: EventService,
    users: UserService,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<MeetStore>, events: EventService, users: UserService) -> Self {
        Self {
            store,
            events,
            users,
        }
    }

    pub async fn create_event(
        &self,
        caller: &CallerIdentity,
        input: EventInput,
    ) -> AppResult<Event> {
        // Subscribe before the write so the notification cannot be missed.
        let rx = self.store.subscribe_changes();
        let event = self.events.create_event(caller, input).await?;
        let id = event.id.clone();
        self.await_visible(rx, move |change| {
            matches!(change, StoreChange::Events { id: changed } if *changed == id)
        })
        .await;
        Ok(event)
    }

    pub async fn upsert_rsvp(
        &self,
        caller: &CallerIdentity,
        event_id: &str,
        status: RsvpStatus,
    ) -> AppResult<Rsvp> {
        let rx = self.store.subscribe_changes();
        let rsvp = self.events.upsert_rsvp(caller, event_id, status).await?;
        let id = rsvp.id.clone();
        self.await_visible(rx, move |change| {
            matches!(change, StoreChange::Rsvps { id: changed, .. } if *changed == id)
        })
        .await;
        Ok(rsvp)
    }

    pub async fn save_profile(
        &self,
        caller: &CallerIdentity,
        input: ProfileInput,
    ) -> AppResult<UserProfile> {
        let rx = self.store.subscribe_changes();
        let profile = self.users.create_or_update(caller, input).await?;
        let id = profile.id.clone();
        self.await_visible(rx, move |change| {
            matches!(change, StoreChange::Users { id: changed } if *changed == id)
        })
        .await;
        Ok(profile)
    }

    /// Wait for the change feed to carry the write. A lagged receiver
    /// counts as visible: overflow forces every projection to resync by
    /// re-querying, which includes this write. The write itself is
    /// already durable, so a missed notification is logged, not raised.
    async fn await_visible<F>(&self, mut rx: broadcast::Receiver<StoreChange>, matches: F)
    where
        F: Fn(&StoreChange) -> bool,
    {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(change) if matches(&change) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        if timeout(VISIBILITY_TIMEOUT, wait).await.is_err() {
            warn!("Timed out waiting for store change visibility");
        }
    }
}
