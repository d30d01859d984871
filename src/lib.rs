// MeetMate sync core - connection graph, real-time projections, and
// AI-assisted matching over a single document store.

pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod rate_limit;
pub mod realtime;
pub mod services;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use error::{AppError, AppResult};
