use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::auth::CallerIdentity;
use crate::error::{AppError, AppResult};
use crate::models::UserProfile;
use crate::store::MeetStore;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

/// Profile fields a caller may set; identity and timestamps are server-owned.
#[derive(Debug, Clone, Default)]
pub struct ProfileInput {
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub skills: Vec<String>,
    pub interests: Vec<String>,
    pub goals: Vec<String>,
    pub bio: Option<String>,
}

#[derive(Clone)]
pub struct UserService {
    store: Arc<MeetStore>,
}

impl UserService {
    pub fn new(store: Arc<MeetStore>) -> Self {
        Self { store }
    }

    /// Idempotent upsert keyed by the caller's auth UID. The identity key
    /// is externally issued and immutable; the payload cannot change it.
    pub async fn create_or_update(
        &self,
        caller: &CallerIdentity,
        input: ProfileInput,
    ) -> AppResult<UserProfile> {
        if input.name.trim().is_empty() {
            return Err(AppError::Validation("Name is required".to_string()));
        }
        if !EMAIL_RE.is_match(&input.email) {
            return Err(AppError::Validation("Invalid email address".to_string()));
        }

        let now = Utc::now();
        let profile = UserProfile {
            id: caller.uid.clone(),
            name: input.name,
            email: input.email,
            avatar: input.avatar,
            skills: input.skills,
            interests: input.interests,
            goals: input.goals,
            bio: input.bio,
            created_at: now,
            updated_at: now,
        };

        self.store.upsert_user(&profile).await
    }

    pub async fn get(&self, id: &str) -> AppResult<UserProfile> {
        self.store
            .get_user(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
    }
}
