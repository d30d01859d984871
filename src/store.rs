// MeetMate document store - SQLite-backed collections with a change feed.
//
// The store is the single source of truth. Every successful write publishes
// a typed StoreChange on a broadcast channel; the projection layer re-runs
// its queries on matching changes. Conditional writes (RSVP upsert, the
// pending-pair unique index, guarded status transitions) close the
// check-then-insert races that a naive read-then-write sequence would leave
// open.

use anyhow::Result;
use chrono::{DateTime, Utc};
use lru::LruCache;
use sqlx::{sqlite::SqlitePool, Row};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    pair_key, Connection, ConnectionStatus, Event, Meeting, Message, Rsvp, RsvpStatus, UserProfile,
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Change notification emitted after each committed write. Carries enough
/// scope for subscribers to decide whether their query is affected without
/// re-reading the document first.
#[derive(Debug, Clone)]
pub enum StoreChange {
    Users {
        id: String,
    },
    Events {
        id: String,
    },
    Rsvps {
        id: String,
        user_id: String,
        event_id: String,
    },
    Connections {
        id: String,
        sender_id: String,
        receiver_id: String,
    },
    Messages {
        pair_key: String,
    },
    Meetings {
        user_id: String,
    },
}

pub struct MeetStore {
    pub pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
    profile_cache: Arc<Mutex<LruCache<String, UserProfile>>>,
}

impl MeetStore {
    pub async fn new(database_url: &str, cache_capacity: usize) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Ok(MeetStore {
            pool,
            changes,
            profile_cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                avatar TEXT,
                skills TEXT NOT NULL,
                interests TEXT NOT NULL,
                goals TEXT NOT NULL,
                bio TEXT,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                date INTEGER NOT NULL,
                location TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // At most one RSVP per (user, event); upserts resolve on this key.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rsvps (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                UNIQUE(user_id, event_id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS connections (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                pair_key TEXT NOT NULL,
                status TEXT NOT NULL,
                created INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // One pending edge per unordered pair, enforced atomically at
        // insert time rather than by a separate existence check.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_pending_pair
             ON connections(pair_key) WHERE status = 'pending'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                pair_key TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                content TEXT NOT NULL,
                ts INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meetings (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                participants TEXT NOT NULL,
                summary TEXT NOT NULL,
                description TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                meeting_link TEXT,
                created INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        // Query-path indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_date ON events(date)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rsvps_event ON rsvps(event_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rsvps_user ON rsvps(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_connections_sender ON connections(sender_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_connections_receiver ON connections(receiver_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(pair_key, ts)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_meetings_user ON meetings(user_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Change-subscription primitive. Receivers that fall behind observe
    /// `Lagged` and should resynchronize by re-querying.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: StoreChange) {
        // No active subscribers is not an error.
        let _ = self.changes.send(change);
    }

    pub fn new_doc_id() -> String {
        Uuid::new_v4().to_string()
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Idempotent profile upsert keyed by auth UID. `created` is preserved
    /// across updates; `updated` is always bumped.
    pub async fn upsert_user(&self, profile: &UserProfile) -> AppResult<UserProfile> {
        let now = Utc::now().timestamp_millis();
        let skills = serde_json::to_string(&profile.skills).unwrap_or_else(|_| "[]".into());
        let interests = serde_json::to_string(&profile.interests).unwrap_or_else(|_| "[]".into());
        let goals = serde_json::to_string(&profile.goals).unwrap_or_else(|_| "[]".into());

        sqlx::query(
            "INSERT INTO users (id, name, email, avatar, skills, interests, goals, bio, created, updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                avatar = excluded.avatar,
                skills = excluded.skills,
                interests = excluded.interests,
                goals = excluded.goals,
                bio = excluded.bio,
                updated = excluded.updated",
        )
        .bind(&profile.id)
        .bind(&profile.name)
        .bind(&profile.email)
        .bind(&profile.avatar)
        .bind(&skills)
        .bind(&interests)
        .bind(&goals)
        .bind(&profile.bio)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.profile_cache.lock().await.pop(&profile.id);
        self.publish(StoreChange::Users {
            id: profile.id.clone(),
        });

        self.get_user(&profile.id)
            .await?
            .ok_or_else(|| AppError::Internal("User row missing after upsert".to_string()))
    }

    pub async fn get_user(&self, id: &str) -> AppResult<Option<UserProfile>> {
        {
            let mut cache = self.profile_cache.lock().await;
            if let Some(profile) = cache.get(id).cloned() {
                return Ok(Some(profile));
            }
        }

        let row = sqlx::query(
            "SELECT id, name, email, avatar, skills, interests, goals, bio, created, updated
             FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let profile = row_to_user(&row);
                self.profile_cache
                    .lock()
                    .await
                    .put(id.to_string(), profile.clone());
                Ok(Some(profile))
            }
            None => Ok(None),
        }
    }

    /// All profiles in stable id order, so match ranking sees candidates
    /// in the same order on every call.
    pub async fn list_users(&self) -> AppResult<Vec<UserProfile>> {
        let rows = sqlx::query(
            "SELECT id, name, email, avatar, skills, interests, goals, bio, created, updated
             FROM users ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_user).collect())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub async fn insert_event(&self, event: &Event) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO events (id, title, description, date, location, created_by, created, updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.date.timestamp_millis())
        .bind(&event.location)
        .bind(&event.created_by)
        .bind(event.created_at.timestamp_millis())
        .bind(event.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.publish(StoreChange::Events {
            id: event.id.clone(),
        });
        Ok(())
    }

    /// Full-row update; `created_by` and `created` are never touched.
    pub async fn update_event(&self, event: &Event) -> AppResult<()> {
        let result = sqlx::query(
            "UPDATE events SET title = ?, description = ?, date = ?, location = ?, updated = ?
             WHERE id = ?",
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.date.timestamp_millis())
        .bind(&event.location)
        .bind(event.updated_at.timestamp_millis())
        .bind(&event.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Event {} not found",
                event.id
            )));
        }

        self.publish(StoreChange::Events {
            id: event.id.clone(),
        });
        Ok(())
    }

    pub async fn get_event(&self, id: &str) -> AppResult<Option<Event>> {
        let row = sqlx::query(
            "SELECT id, title, description, date, location, created_by, created, updated
             FROM events WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_event))
    }

    /// Ordering invariant: listings are always ascending by date.
    pub async fn list_events(&self) -> AppResult<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT id, title, description, date, location, created_by, created, updated
             FROM events ORDER BY date ASC, created ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_event).collect())
    }

    // ------------------------------------------------------------------
    // RSVPs
    // ------------------------------------------------------------------

    /// Atomic upsert keyed by (user, event): a second RSVP for the same
    /// pair updates the existing row's status in place. Returns the
    /// resulting row, including its existing or freshly generated id.
    pub async fn upsert_rsvp(
        &self,
        user_id: &str,
        event_id: &str,
        status: RsvpStatus,
    ) -> AppResult<Rsvp> {
        let now = Utc::now().timestamp_millis();
        let candidate_id = Self::new_doc_id();

        sqlx::query(
            "INSERT INTO rsvps (id, user_id, event_id, status, created, updated)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, event_id) DO UPDATE SET
                status = excluded.status,
                updated = excluded.updated",
        )
        .bind(&candidate_id)
        .bind(user_id)
        .bind(event_id)
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, user_id, event_id, status, created, updated
             FROM rsvps WHERE user_id = ? AND event_id = ?",
        )
        .bind(user_id)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        let rsvp = row_to_rsvp(&row)?;

        self.publish(StoreChange::Rsvps {
            id: rsvp.id.clone(),
            user_id: user_id.to_string(),
            event_id: event_id.to_string(),
        });

        Ok(rsvp)
    }

    pub async fn list_rsvps_for_event(&self, event_id: &str) -> AppResult<Vec<Rsvp>> {
        let rows = sqlx::query(
            "SELECT id, user_id, event_id, status, created, updated
             FROM rsvps WHERE event_id = ? ORDER BY created ASC",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rsvp).collect()
    }

    pub async fn list_rsvps_for_user(&self, user_id: &str) -> AppResult<Vec<Rsvp>> {
        let rows = sqlx::query(
            "SELECT id, user_id, event_id, status, created, updated
             FROM rsvps WHERE user_id = ? ORDER BY created ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_rsvp).collect()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Insert a pending edge. The partial unique index on
    /// `pair_key WHERE status = 'pending'` turns a concurrent duplicate
    /// into a Conflict instead of a second row.
    pub async fn insert_connection(&self, sender_id: &str, receiver_id: &str) -> AppResult<Connection> {
        let now = Utc::now();
        let connection = Connection {
            id: Self::new_doc_id(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            status: ConnectionStatus::Pending,
            created_at: now,
        };

        let result = sqlx::query(
            "INSERT INTO connections (id, sender_id, receiver_id, pair_key, status, created)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&connection.id)
        .bind(sender_id)
        .bind(receiver_id)
        .bind(pair_key(sender_id, receiver_id))
        .bind(connection.status.as_str())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(AppError::Conflict(
                    "A pending connection request already exists between these users".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }

        self.publish(StoreChange::Connections {
            id: connection.id.clone(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
        });

        Ok(connection)
    }

    pub async fn get_connection(&self, id: &str) -> AppResult<Option<Connection>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, status, created FROM connections WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_connection).transpose()
    }

    /// Any record for the exact ordered pair, regardless of status.
    pub async fn find_connection_ordered(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> AppResult<Option<Connection>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, status, created
             FROM connections WHERE sender_id = ? AND receiver_id = ? LIMIT 1",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_connection).transpose()
    }

    /// Guarded transition out of `pending`. Returns false when the row is
    /// no longer pending, so callers can distinguish an illegal transition
    /// from a successful one without a read-modify-write race.
    pub async fn update_connection_status(
        &self,
        connection: &Connection,
        status: ConnectionStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE connections SET status = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(&connection.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.publish(StoreChange::Connections {
            id: connection.id.clone(),
            sender_id: connection.sender_id.clone(),
            receiver_id: connection.receiver_id.clone(),
        });
        Ok(true)
    }

    pub async fn list_connections_by_sender(
        &self,
        sender_id: &str,
        status: ConnectionStatus,
    ) -> AppResult<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, status, created
             FROM connections WHERE sender_id = ? AND status = ? ORDER BY created ASC",
        )
        .bind(sender_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_connection).collect()
    }

    pub async fn list_connections_by_receiver(
        &self,
        receiver_id: &str,
        status: ConnectionStatus,
    ) -> AppResult<Vec<Connection>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, status, created
             FROM connections WHERE receiver_id = ? AND status = ? ORDER BY created ASC",
        )
        .bind(receiver_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_connection).collect()
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn insert_message(&self, message: &Message) -> AppResult<()> {
        let key = pair_key(&message.from, &message.to);
        sqlx::query(
            "INSERT INTO messages (id, pair_key, from_id, to_id, content, ts)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&key)
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.content)
        .bind(message.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.publish(StoreChange::Messages { pair_key: key });
        Ok(())
    }

    /// Conversation for an unordered pair, timestamp ascending.
    pub async fn list_messages_for_pair(&self, a: &str, b: &str) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, from_id, to_id, content, ts
             FROM messages WHERE pair_key = ? ORDER BY ts ASC",
        )
        .bind(pair_key(a, b))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    // ------------------------------------------------------------------
    // Meetings
    // ------------------------------------------------------------------

    pub async fn insert_meeting(&self, meeting: &Meeting) -> AppResult<()> {
        let participants =
            serde_json::to_string(&meeting.participants).unwrap_or_else(|_| "[]".into());
        sqlx::query(
            "INSERT INTO meetings (id, user_id, participants, summary, description, start_ts, end_ts, meeting_link, created)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&meeting.id)
        .bind(&meeting.user_id)
        .bind(&participants)
        .bind(&meeting.summary)
        .bind(&meeting.description)
        .bind(meeting.start.timestamp_millis())
        .bind(meeting.end.timestamp_millis())
        .bind(&meeting.meeting_link)
        .bind(meeting.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.publish(StoreChange::Meetings {
            user_id: meeting.user_id.clone(),
        });
        Ok(())
    }

    pub async fn list_meetings_for_user(&self, user_id: &str) -> AppResult<Vec<Meeting>> {
        let rows = sqlx::query(
            "SELECT id, user_id, participants, summary, description, start_ts, end_ts, meeting_link, created
             FROM meetings WHERE user_id = ? ORDER BY start_ts ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_meeting).collect())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> UserProfile {
    UserProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        avatar: row.get("avatar"),
        skills: json_list(row.get("skills")),
        interests: json_list(row.get("interests")),
        goals: json_list(row.get("goals")),
        bio: row.get("bio"),
        created_at: ms_to_datetime(row.get("created")),
        updated_at: ms_to_datetime(row.get("updated")),
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Event {
    Event {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        date: ms_to_datetime(row.get("date")),
        location: row.get("location"),
        created_by: row.get("created_by"),
        created_at: ms_to_datetime(row.get("created")),
        updated_at: ms_to_datetime(row.get("updated")),
    }
}

fn row_to_rsvp(row: &sqlx::sqlite::SqliteRow) -> AppResult<Rsvp> {
    Ok(Rsvp {
        id: row.get("id"),
        user_id: row.get("user_id"),
        event_id: row.get("event_id"),
        status: RsvpStatus::parse(row.get("status"))?,
        created_at: ms_to_datetime(row.get("created")),
        updated_at: ms_to_datetime(row.get("updated")),
    })
}

fn row_to_connection(row: &sqlx::sqlite::SqliteRow) -> AppResult<Connection> {
    Ok(Connection {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        receiver_id: row.get("receiver_id"),
        status: ConnectionStatus::parse(row.get("status"))?,
        created_at: ms_to_datetime(row.get("created")),
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let from: String = row.get("from_id");
    let to: String = row.get("to_id");
    Message {
        id: row.get("id"),
        participants: [from.clone(), to.clone()],
        from,
        to,
        content: row.get("content"),
        timestamp: ms_to_datetime(row.get("ts")),
    }
}

fn row_to_meeting(row: &sqlx::sqlite::SqliteRow) -> Meeting {
    Meeting {
        id: row.get("id"),
        user_id: row.get("user_id"),
        participants: json_list(row.get("participants")),
        summary: row.get("summary"),
        description: row.get("description"),
        start: ms_to_datetime(row.get("start_ts")),
        end: ms_to_datetime(row.get("end_ts")),
        meeting_link: row.get("meeting_link"),
        created_at: ms_to_datetime(row.get("created")),
    }
}
