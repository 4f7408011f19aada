//! # repowatch server
//!
//! HTTP surface over a shared [`repowatch_core::Coordinator`].
//!
//! This crate provides:
//! - The change stream (`GET /events`, server-sent events)
//! - REST access to transitions, state, metadata and operations
//! - The row refresh operation with a pluggable renderer
//!
//! # Endpoints
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/health` | liveness and counters |
//! | GET | `/events` | change stream, honours `Last-Event-ID` |
//! | GET | `/events/log?limit=` | newest event log records |
//! | GET | `/entities` | every tracked entity |
//! | GET | `/entities/:owner/:name` | one entity |
//! | POST | `/entities/:owner/:name/transition` | `{to, context}` |
//! | POST | `/entities/:owner/:name/{install,activate,deactivate,recheck}` | operations |
//! | GET | `/entities/:owner/:name/refresh` | state plus rendered row |
//! | PUT/DELETE | `/entities/:owner/:name/metadata/:key` | metadata |
//!
//! A busy entity answers `409 Conflict`; illegal transitions answer `200`
//! with a `rejected` status.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod render;
mod server;
mod stream;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{
    AppState, HealthStatus, MetadataResponse, RefreshResponse, TransitionBody,
};
pub use render::{HtmlRowRenderer, RowRenderer, PROTECTED_KEY};
pub use server::StateServer;
pub use stream::{change_event, StreamPayload, STATE_CHANGE_EVENT};
