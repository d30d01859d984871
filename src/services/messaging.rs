// Messaging and meeting scheduling. Messages are immutable and ordered by
// timestamp within a participant pair; meetings are immutable once created.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::auth::CallerIdentity;
use crate::error::{AppError, AppResult};
use crate::models::{Meeting, Message};
use crate::store::MeetStore;

#[derive(Debug, Clone)]
pub struct MeetingInput {
    pub participants: Vec<String>,
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub meeting_link: Option<String>,
}

#[derive(Clone)]
pub struct MessagingService {
    store: Arc<MeetStore>,
}

impl MessagingService {
    pub fn new(store: Arc<MeetStore>) -> Self {
        Self { store }
    }

    pub async fn send_message(
        &self,
        caller: &CallerIdentity,
        to: &str,
        content: &str,
    ) -> AppResult<Message> {
        if to.trim().is_empty() {
            return Err(AppError::Validation("Recipient is required".to_string()));
        }
        if to == caller.uid {
            return Err(AppError::Validation(
                "Cannot message yourself".to_string(),
            ));
        }
        if content.trim().is_empty() {
            return Err(AppError::Validation(
                "Message content is required".to_string(),
            ));
        }

        let message = Message {
            id: MeetStore::new_doc_id(),
            participants: [caller.uid.clone(), to.to_string()],
            from: caller.uid.clone(),
            to: to.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };

        self.store.insert_message(&message).await?;
        Ok(message)
    }

    /// Full conversation between the caller and the peer, oldest first.
    pub async fn conversation(
        &self,
        caller: &CallerIdentity,
        peer_id: &str,
    ) -> AppResult<Vec<Message>> {
        self.store.list_messages_for_pair(&caller.uid, peer_id).await
    }

    pub async fn schedule_meeting(
        &self,
        caller: &CallerIdentity,
        input: MeetingInput,
    ) -> AppResult<Meeting> {
        if input.summary.trim().is_empty() {
            return Err(AppError::Validation("Summary is required".to_string()));
        }
        if input.participants.is_empty() {
            return Err(AppError::Validation(
                "At least one participant is required".to_string(),
            ));
        }
        if input.end <= input.start {
            return Err(AppError::Validation(
                "Meeting end must be after start".to_string(),
            ));
        }

        let meeting = Meeting {
            id: MeetStore::new_doc_id(),
            user_id: caller.uid.clone(),
            participants: input.participants,
            summary: input.summary,
            description: input.description,
            start: input.start,
            end: input.end,
            meeting_link: input.meeting_link,
            created_at: Utc::now(),
        };

        self.store.insert_meeting(&meeting).await?;
        Ok(meeting)
    }

    pub async fn meetings_for(&self, user_id: &str) -> AppResult<Vec<Meeting>> {
        self.store.list_meetings_for_user(user_id).await
    }
}
