// Event and RSVP mutation layer. Writes go straight to the store; the
// projection layer, not return values, propagates results to observers.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::auth::CallerIdentity;
use crate::error::{AppError, AppResult};
use crate::models::{Event, Rsvp, RsvpStatus};
use crate::store::MeetStore;

#[derive(Debug, Clone)]
pub struct EventInput {
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub location: String,
}

#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub location: Option<String>,
}

#[derive(Clone)]
pub struct EventService {
    store: Arc<MeetStore>,
}

impl EventService {
    pub fn new(store: Arc<MeetStore>) -> Self {
        Self { store }
    }

    /// `created_by` comes from the authenticated caller, never the payload.
    pub async fn create_event(
        &self,
        caller: &CallerIdentity,
        input: EventInput,
    ) -> AppResult<Event> {
        for (field, value) in [
            ("title", &input.title),
            ("description", &input.description),
            ("location", &input.location),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("Missing field: {}", field)));
            }
        }

        let now = Utc::now();
        let event = Event {
            id: MeetStore::new_doc_id(),
            title: input.title,
            description: input.description,
            date: input.date,
            location: input.location,
            created_by: caller.uid.clone(),
            created_at: now,
            updated_at: now,
        };

        self.store.insert_event(&event).await?;
        Ok(event)
    }

    /// Partial update; only the creator may edit, `created_by` is immutable.
    pub async fn update_event(
        &self,
        caller: &CallerIdentity,
        event_id: &str,
        patch: EventPatch,
    ) -> AppResult<Event> {
        let mut event = self.get_event(event_id).await?;
        if event.created_by != caller.uid {
            return Err(AppError::Forbidden(
                "Only the event creator can update it".to_string(),
            ));
        }

        if let Some(title) = patch.title {
            event.title = title;
        }
        if let Some(description) = patch.description {
            event.description = description;
        }
        if let Some(date) = patch.date {
            event.date = date;
        }
        if let Some(location) = patch.location {
            event.location = location;
        }
        event.updated_at = Utc::now();

        self.store.update_event(&event).await?;
        Ok(event)
    }

    pub async fn get_event(&self, id: &str) -> AppResult<Event> {
        self.store
            .get_event(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Event {} not found", id)))
    }

    /// Always sorted ascending by date.
    pub async fn list_events(&self) -> AppResult<Vec<Event>> {
        self.store.list_events().await
    }

    /// Upsert by (user, event): the first call creates the RSVP, later
    /// calls update its status in place. The referenced event must exist.
    pub async fn upsert_rsvp(
        &self,
        caller: &CallerIdentity,
        event_id: &str,
        status: RsvpStatus,
    ) -> AppResult<Rsvp> {
        if self.store.get_event(event_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Event {} not found", event_id)));
        }

        self.store.upsert_rsvp(&caller.uid, event_id, status).await
    }

    pub async fn rsvps_for_event(&self, event_id: &str) -> AppResult<Vec<Rsvp>> {
        self.store.list_rsvps_for_event(event_id).await
    }

    pub async fn rsvps_for_user(&self, user_id: &str) -> AppResult<Vec<Rsvp>> {
        self.store.list_rsvps_for_user(user_id).await
    }
}
