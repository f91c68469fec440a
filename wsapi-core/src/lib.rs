//! Live query cache and invalidation engine
//!
//! Clients subscribe to named `get` functions with JSON arguments and
//! receive the current value, then a fresh value every time something the
//! result depends on changes. Dependencies are plain string **tags**: a
//! `get` result lists the tags it depends on, a `set` result lists the tags
//! it invalidates.
//!
//! # Architecture
//!
//! ```text
//!  Client ──ClientMessage──▶ Session ──▶ CacheEngine ──▶ Definition
//!    ▲                                      │  (get / set functions)
//!    └──────────ServerMessage───────────────┘
//! ```
//!
//! - [`CacheEngine`] owns one entry per `(name, args)` key and coalesces
//!   every subscriber of that key onto a single computation.
//! - [`Session`] maps one connection's correlation ids to entries and
//!   releases them when the connection goes away.
//! - [`Client`] is the consuming side: it deduplicates handles, exposes
//!   them as [`LiveQuery`] guards, and multiplexes replies.
//! - [`relay`] lets in-process peers share a single client.
//!
//! Entries nobody watches become stale on invalidation instead of being
//! recomputed, and are dropped by the periodic sweep.
//!
//! # Example
//!
//! ```rust,ignore
//! use wsapi_core::prelude::*;
//! use serde_json::json;
//!
//! let definition = Definition::new()
//!     .get("greeting", |args| async move {
//!         let name: String = arg(&args, 0)?;
//!         Ok(GetReturn::new(json!(format!("hello {name}"))).tag("greeting"))
//!     })
//!     .set("refresh", |_args| async move {
//!         Ok(SetReturn::new(json!(null)).invalidate("greeting"))
//!     });
//!
//! let engine = CacheEngine::new(definition);
//! let client = Client::local(&engine);
//! let query = client.get("greeting", vec![json!("world")])?;
//! assert_eq!(query.loaded().await?, json!("hello world"));
//! ```

#![warn(missing_debug_implementations)]

pub mod client;
pub mod definition;
pub mod engine;
pub mod error;
pub mod key;
pub mod metrics;
pub mod relay;
pub mod session;
pub mod tags;

pub use client::{CallbackId, ChannelTransport, Client, LiveQuery, Snapshot, Transport, WeakClient};
pub use definition::{arg, Definition, GetReturn, Prepared, SetReturn};
pub use engine::{CacheEngine, EngineConfig, EntryInfo, EntryState, Subscriber, DEFAULT_SWEEP_INTERVAL};
pub use error::{ClientError, ClientResult, EngineError, FunctionKind, Result, TransportError};
pub use key::QueryKey;
pub use metrics::{EngineMetrics, EngineStats, MetricsSnapshot};
pub use relay::{RelayHub, RelayMaster};
pub use session::{Disposition, Outbox, Session};
pub use wsapi_types::{ClientMessage, CorrelationId, ReplyBody, ServerMessage, SessionId};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{Client, LiveQuery};
    pub use crate::definition::{arg, Definition, GetReturn, SetReturn};
    pub use crate::engine::{CacheEngine, EngineConfig};
    pub use crate::error::{ClientError, EngineError};
    pub use crate::key::QueryKey;
}
