// Status mapping across the HTTP surface: bearer-token auth, validation,
// conflict, and throttling responses as seen by a client.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::{middleware, Router};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tower::ServiceExt;

use meetmate::api::create_api_router;
use meetmate::app_state::AppState;
use meetmate::auth::Claims;
use meetmate::config::{
    AiConfig, AuthConfig, CacheConfig, Config, DatabaseConfig, RateLimitConfig, ServerConfig,
};
use meetmate::error::AppResult;
use meetmate::rate_limit::{rate_limit_middleware, RateLimiter};
use meetmate::services::AiProvider;

const SECRET: &str = "test-secret";

struct NullProvider;

#[async_trait]
impl AiProvider for NullProvider {
    async fn embed(&self, _text: &str) -> AppResult<Vec<f32>> {
        Ok(vec![0.0])
    }

    async fn chat_complete(&self, _prompt: &str, _context: Option<&str>) -> AppResult<String> {
        Ok(String::new())
    }
}

fn test_config(database_url: String) -> Config {
    Config {
        database: DatabaseConfig { url: database_url },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        auth: AuthConfig {
            jwt_secret: SECRET.to_string(),
        },
        ai: AiConfig {
            endpoint: "http://localhost:0".to_string(),
            api_key: String::new(),
            embed_concurrency: 2,
        },
        cache: CacheConfig { capacity: 16 },
        rate_limit: RateLimitConfig {
            max_requests: 1000,
            window_secs: 60,
            purge_idle_secs: 600,
        },
    }
}

async fn test_app() -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("meetmate.db");
    let config = test_config(format!("sqlite://{}?mode=rwc", path.display()));
    let state = AppState::with_provider(config, Arc::new(NullProvider))
        .await
        .expect("app state");
    (dir, create_api_router(state))
}

fn token(uid: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = Claims {
        sub: uid.to_string(),
        email: format!("{}@example.com", uid),
        exp: now + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn post_json(uri: &str, bearer: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn protected_routes_require_valid_bearer_token() {
    let (_dir, app) = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/api/events", None, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(post_json("/api/events", Some("not-a-jwt"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The read-only listing stays public.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_codes_for_validation_forbidden_and_conflict() {
    let (_dir, app) = test_app().await;
    let auth = token("u1");

    // Missing title.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/events",
            Some(&auth),
            json!({
                "description": "x",
                "date": "2026-09-01T10:00:00Z",
                "location": "HQ"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/events",
            Some(&auth),
            json!({
                "title": "Meetup",
                "description": "x",
                "date": "2026-09-01T10:00:00Z",
                "location": "HQ"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // senderId must match the authenticated caller.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/connections/request",
            Some(&auth),
            json!({ "senderId": "someone-else", "receiverId": "u2" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // First request lands, the duplicate conflicts.
    let payload = json!({ "senderId": "u1", "receiverId": "u2" });
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/connections/request",
            Some(&auth),
            payload.clone(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post_json("/api/connections/request", Some(&auth), payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn throttled_client_gets_429_others_unaffected() {
    let (_dir, app) = test_app().await;
    let limiter = RateLimiter::new(&RateLimitConfig {
        max_requests: 2,
        window_secs: 60,
        purge_idle_secs: 600,
    });
    let app = app.layer(middleware::from_fn_with_state(
        limiter,
        rate_limit_middleware,
    ));

    let health = |ip: &str| {
        Request::builder()
            .uri("/health")
            .header("x-forwarded-for", ip.to_string())
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(health("203.0.113.9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(health("203.0.113.9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = app.oneshot(health("203.0.113.10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
