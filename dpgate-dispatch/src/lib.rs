//! Client side of the engine protocol.
//!
//! The gateway never evaluates queries itself; it forwards them to one of
//! several engines, each known by name and a set of HTTP endpoints. Every
//! outbound call is bounded by the same timeout.

pub mod client;
pub mod config;

pub use crate::client::{DispatchClient, DispatchError, DEFAULT_TIMEOUT};
pub use crate::config::{EngineTarget, EnginesConfig};
