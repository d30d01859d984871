// HTTP surface. Handlers validate payloads, attribute every mutation to
// the verified caller, and delegate to the service layer.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post, put},
    Extension, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    app_state::AppState,
    auth::{auth_middleware, CallerIdentity},
    error::{AppError, AppResult},
    models::{ConnectionStatus, Event, Meeting, Message, Rsvp, RsvpStatus, UserProfile},
    services::{EventInput, EventPatch, MeetingInput, ProfileInput},
};

fn parse_date(field: &str, raw: Option<&str>) -> AppResult<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| AppError::Validation(format!("Missing field: {}", field)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AppError::Validation(format!("Invalid {}: expected RFC 3339 timestamp", field)))
}

fn required<'a>(field: &str, value: &'a Option<String>) -> AppResult<&'a str> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Validation(format!("Missing field: {}", field))),
    }
}

// ---------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub location: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RsvpRequest {
    pub event_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequestPayload {
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRespondPayload {
    pub connection_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    pub bio: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub to: Option<String>,
    pub content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleMeetingRequest {
    #[serde(default)]
    pub participants: Vec<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub description: String,
    pub start: Option<String>,
    pub end: Option<String>,
    pub meeting_link: Option<String>,
}

#[derive(Deserialize)]
pub struct MatchesQuery {
    pub top: Option<usize>,
}

#[derive(Deserialize)]
pub struct ChatRequestPayload {
    pub prompt: Option<String>,
    pub context: Option<String>,
}

// ---------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "OK", "timestamp": Utc::now() }))
}

async fn create_event_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<Event>), AppError> {
    let input = EventInput {
        title: required("title", &req.title)?.to_string(),
        description: required("description", &req.description)?.to_string(),
        date: parse_date("date", req.date.as_deref())?,
        location: required("location", &req.location)?.to_string(),
    };
    let event = state.sync.create_event(&caller, input).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

async fn update_event_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(event_id): Path<String>,
    Json(req): Json<UpdateEventRequest>,
) -> Result<Json<Event>, AppError> {
    let patch = EventPatch {
        title: req.title,
        description: req.description,
        date: req
            .date
            .as_deref()
            .map(|raw| parse_date("date", Some(raw)))
            .transpose()?,
        location: req.location,
    };
    let event = state.events.update_event(&caller, &event_id, patch).await?;
    Ok(Json(event))
}

async fn list_events_handler(State(state): State<AppState>) -> Result<Json<Vec<Event>>, AppError> {
    Ok(Json(state.events.list_events().await?))
}

async fn get_event_handler(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Event>, AppError> {
    Ok(Json(state.events.get_event(&event_id).await?))
}

async fn rsvp_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<RsvpRequest>,
) -> Result<Json<Rsvp>, AppError> {
    let event_id = required("eventId", &req.event_id)?;
    let status = RsvpStatus::parse(required("status", &req.status)?)?;
    let rsvp = state.sync.upsert_rsvp(&caller, event_id, status).await?;
    Ok(Json(rsvp))
}

async fn event_rsvps_handler(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<Vec<Rsvp>>, AppError> {
    Ok(Json(state.events.rsvps_for_event(&event_id).await?))
}

async fn user_rsvps_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Rsvp>>, AppError> {
    Ok(Json(state.events.rsvps_for_user(&user_id).await?))
}

async fn connection_request_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<ConnectionRequestPayload>,
) -> Result<Json<Value>, AppError> {
    let sender_id = required("senderId", &req.sender_id)?;
    let receiver_id = required("receiverId", &req.receiver_id)?;
    if sender_id != caller.uid {
        return Err(AppError::Forbidden(
            "senderId must match the authenticated user".to_string(),
        ));
    }

    state.connections.send_request(sender_id, receiver_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn connection_respond_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<ConnectionRespondPayload>,
) -> Result<Json<Value>, AppError> {
    let connection_id = required("connectionId", &req.connection_id)?;
    let decision = ConnectionStatus::parse(required("status", &req.status)?)?;

    // Only the receiver of a pending request may resolve it.
    let connection = state.connections.get(connection_id).await?;
    if connection.receiver_id != caller.uid {
        return Err(AppError::Forbidden(
            "Only the request receiver can respond".to_string(),
        ));
    }

    state.connections.respond(connection_id, decision).await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_connections_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let peers = state.connections.accepted_peer_ids(&user_id).await?;
    Ok(Json(json!({ "connections": peers })))
}

async fn pending_connections_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let requests = state.connections.list_incoming_pending(&user_id).await?;
    Ok(Json(json!({ "requests": requests })))
}

async fn upsert_profile_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<UserProfile>, AppError> {
    let input = ProfileInput {
        name: required("name", &req.name)?.to_string(),
        email: required("email", &req.email)?.to_string(),
        avatar: req.avatar,
        skills: req.skills,
        interests: req.interests,
        goals: req.goals,
        bio: req.bio,
    };
    let profile = state.sync.save_profile(&caller, input).await?;
    Ok(Json(profile))
}

async fn get_user_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, AppError> {
    Ok(Json(state.users.get(&user_id).await?))
}

async fn matches_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Query(query): Query<MatchesQuery>,
) -> Result<Json<Vec<UserProfile>>, AppError> {
    let top_n = query.top.unwrap_or(3);
    Ok(Json(state.matching.find_top_matches(&caller.uid, top_n).await?))
}

async fn chat_handler(
    State(state): State<AppState>,
    Extension(_caller): Extension<CallerIdentity>,
    Json(req): Json<ChatRequestPayload>,
) -> Result<Json<Value>, AppError> {
    let prompt = required("prompt", &req.prompt)?;
    let reply = state.matching.chat(prompt, req.context.as_deref()).await?;
    Ok(Json(json!({ "reply": reply })))
}

async fn send_message_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let to = required("to", &req.to)?;
    let content = required("content", &req.content)?;
    let message = state.messaging.send_message(&caller, to, content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn conversation_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    Ok(Json(state.messaging.conversation(&caller, &user_id).await?))
}

async fn schedule_meeting_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<ScheduleMeetingRequest>,
) -> Result<(StatusCode, Json<Meeting>), AppError> {
    let input = MeetingInput {
        participants: req.participants,
        summary: required("summary", &req.summary)?.to_string(),
        description: req.description,
        start: parse_date("start", req.start.as_deref())?,
        end: parse_date("end", req.end.as_deref())?,
        meeting_link: req.meeting_link,
    };
    let meeting = state.messaging.schedule_meeting(&caller, input).await?;
    Ok((StatusCode::CREATED, Json(meeting)))
}

async fn list_meetings_handler(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Json<Vec<Meeting>>, AppError> {
    Ok(Json(state.messaging.meetings_for(&caller.uid).await?))
}

// ---------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------

pub fn create_api_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/events", post(create_event_handler))
        .route("/api/events/{id}", put(update_event_handler))
        .route("/api/rsvp", post(rsvp_handler))
        .route("/api/connections/request", post(connection_request_handler))
        .route("/api/connections/respond", post(connection_respond_handler))
        .route("/api/users/me", put(upsert_profile_handler))
        .route("/api/matches", get(matches_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/messages", post(send_message_handler))
        .route("/api/messages/{userId}", get(conversation_handler))
        .route("/api/meetings", post(schedule_meeting_handler))
        .route("/api/meetings", get(list_meetings_handler))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/health", get(health_handler))
        .route("/api/events", get(list_events_handler))
        .route("/api/events/{id}", get(get_event_handler))
        .route("/api/rsvp/event/{eventId}", get(event_rsvps_handler))
        .route("/api/rsvp/user/{userId}", get(user_rsvps_handler))
        .route("/api/connections/{userId}", get(list_connections_handler))
        .route(
            "/api/connections/pending/{userId}",
            get(pending_connections_handler),
        )
        .route("/api/users/{id}", get(get_user_handler));

    protected.merge(public).with_state(state)
}
