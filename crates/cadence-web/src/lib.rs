//! Read-only observation endpoints for Cadence.
//!
//! This crate exposes:
//! - The scheduler's event lines as a Server-Sent Events stream
//! - Task definitions and run records as JSON

mod error;
mod routes;
mod sse;

pub use error::WebError;
pub use routes::{AppState, create_router};
