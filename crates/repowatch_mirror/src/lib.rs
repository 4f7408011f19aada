//! # repowatch mirror
//!
//! Client-side cache of entity states kept in sync with a repowatch
//! coordinator without polling.
//!
//! The mirror is fed by:
//! - the change stream, either as [`StateChange`](repowatch_core::StateChange)
//!   values or as raw `text/event-stream` chunks through [`SseDecoder`]
//! - direct [`OperationReport`](repowatch_core::OperationReport)s
//!
//! Both paths merge by timestamp, so the same update arriving twice is
//! harmless. Entries expire after a TTL, the cache is size-capped, and
//! persistence to a [`MirrorStorage`] is debounced.
//!
//! ```rust,ignore
//! use repowatch_mirror::{ClientMirror, JsonFileStorage, MirrorConfig};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(JsonFileStorage::open("session/mirror.json")?);
//! let mirror = Arc::new(ClientMirror::new(MirrorConfig::default(), storage));
//! mirror.load()?;
//! let _persist = mirror.spawn_persistence();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod mirror;
mod sse;
mod storage;

pub use config::MirrorConfig;
pub use error::{MirrorError, MirrorResult};
pub use mirror::{ClientMirror, ListenerId, MirrorUpdate};
pub use sse::{SseDecoder, SseFrame};
pub use storage::{CacheEntry, JsonFileStorage, MemoryStorage, MirrorStorage};
