//! API server for rollout.
//!
//! Accepts pipeline triggers over HTTP, serves run records and deployment
//! state, and streams pipeline events over a WebSocket.

pub mod error;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
