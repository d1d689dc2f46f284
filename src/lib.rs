//! # trackwire
//!
//! Client-side engine for the Trackwire analytics and engagement platform.
//!
//! This library provides:
//! - A durable, SQLite-backed event queue with at-least-once delivery
//! - Customer identity lifecycle, including the anonymize protocol
//! - Session tracking with a background grace window
//! - Flush coordination (manual, immediate, periodic, app-close modes)
//! - In-app message eligibility evaluation
//!
//! ## Architecture
//!
//! Every producer funnels into one track pipeline that snapshots the
//! active customer identity, resolves destination projects, and appends
//! one durable record per destination. The flush coordinator later drains
//! the queue over HTTP, record by record, honoring per-record retry state.
//! Records survive process restarts; nothing is lost to a crash after the
//! append returns.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trackwire::{PropertyMap, Trackwire, TrackwireConfig};
//!
//! let config = TrackwireConfig::new("my-project-token");
//! let trackwire = Trackwire::with_http(config).expect("failed to build service");
//! trackwire.init().expect("failed to initialize");
//!
//! let mut props = PropertyMap::new();
//! props.insert("screen".into(), "checkout".into());
//! trackwire.track_event("screen_view", props, None).expect("failed to track");
//! ```

// Re-export commonly used items at the crate root
pub use config::{LoggingConfig, TrackwireConfig};
pub use db::Database;
pub use error::{Error, Result};
pub use flush::{
    DeliveryOutcome, DropObserver, EventTransport, FlushCoordinator, FlushOutcome, FlushStats,
    HttpTransport, NoopScheduler, PlatformScheduler,
};
pub use inapp::{
    DisplayState, DisplayStateStore, InAppMessage, InAppMessageEligibilityEngine,
    InAppMessageFrequency, InAppMessageType,
};
pub use tracker::{EventObserver, Trackwire};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod flush;
pub mod identity;
pub mod inapp;
pub mod logging;
pub mod queue;
pub mod routing;
pub mod session;
pub mod tracker;
pub mod types;
