//! Parley API Library
//!
//! This crate contains the real-time gateway of the Parley chat service:
//! identity resolution, connection management, presence, message fan-out and
//! the periodic maintenance loop.

pub mod auth;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
