//! # beamline-core
//!
//! Durable client-side event tracking: callers emit named events with
//! key/value parameters, and the library guarantees at-least-once, in-order
//! delivery to a remote collection endpoint, surviving process restarts and
//! network outages.
//!
//! ## Architecture
//!
//! Events flow through a four-stage pipeline, one record at a time:
//!
//! ```text
//! caller → intake buffer → logger task → durable queue → delivery worker → endpoint
//! ```
//!
//! - The **intake buffer** is unbounded and non-blocking, so tracking calls
//!   never stall on disk or network state.
//! - The **logger task** drains the buffer into the durable queue in arrival
//!   order.
//! - The **durable queue** is a SQLite-backed FIFO; a record accepted by the
//!   queue survives process death until delivery is confirmed.
//! - The **delivery worker** sends the head record over HTTP, retrying with
//!   capped exponential backoff while respecting network reachability.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beamline_core::{Identity, Tracker, TrackerConfig};
//!
//! # async fn run() -> beamline_core::Result<()> {
//! let tracker = Tracker::new(TrackerConfig::load()?)?;
//! tracker.init(Identity::single("api-key", "user-1")?, false)?;
//!
//! tracker.track_load(None)?;
//! tracker.track("level_up", None)?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::TrackerConfig;
pub use error::{Error, Result};
pub use event::EventRecord;
pub use tracker::{Identity, Tracker};

// Public modules
pub mod config;
pub mod error;
pub mod event;
pub mod intake;
pub mod logging;
pub mod net;
pub mod queue;
pub mod tracker;
pub mod worker;
