//! HTTP and WebSocket gateway for Vigil.
//!
//! Exposes the task queue, workflows, agent registry and message bus over a
//! JSON API, and relays every lifecycle event from `task_updates` to
//! connected WebSocket observers through the [`EventNotifier`].

pub mod error;
pub mod extract;
pub mod notifier;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use notifier::{EventNotifier, DEFAULT_BUFFER};
pub use server::{AppState, GatewayServer};
