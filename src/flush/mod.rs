//! Flush layer: delivering queued event records to the backend
//!
//! The [`FlushCoordinator`] owns the flush mode state machine and the
//! single-flight drain; [`EventTransport`] is the wire boundary and
//! [`PlatformScheduler`] the OS periodic-job capability the coordinator
//! starts and stops but does not implement.

pub mod coordinator;
pub mod scheduler;
pub mod transport;

pub use coordinator::{DropObserver, FlushCoordinator, FlushOutcome, FlushStats};
pub use scheduler::{NoopScheduler, PlatformScheduler};
pub use transport::{DeliveryOutcome, EventTransport, HttpTransport};
