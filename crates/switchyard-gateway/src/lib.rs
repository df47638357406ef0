//! HTTP gateway for the agent loop.
//!
//! Turns are started over HTTP and their [`AgentEvent`]s are streamed back as
//! NDJSON, one event per line. Dropping the response body cancels the turn.
//!
//! [`AgentEvent`]: switchyard_agent::AgentEvent

pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{router, start_gateway};
pub use state::GatewayState;

/// Header carrying the caller identity, set by the authenticating proxy.
pub const USER_HEADER: &str = "x-switchyard-user";

/// Response header carrying the id of a streamed turn.
pub const TURN_ID_HEADER: &str = "x-switchyard-turn-id";
