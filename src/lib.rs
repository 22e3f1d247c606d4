//! ripple - replicated change-polling worker
//!
//! Detects new entries in a shared append-only change log, delivers them in
//! batches to a downstream API with retry, fans them out to registered
//! webhooks and keeps operational metrics. Replicas coordinate through a
//! time-bounded lease so only one of them runs a polling cycle at a time.
//!
//! # Architecture
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`storage`] - Change log, checkpoint, metrics, lease and webhook stores (Redis, memory)
//! - [`delivery`] - Retrying HTTP delivery and webhook fan-out
//! - [`worker`] - The polling loop and its cycle state machine
//! - [`logging`] - Tracing subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use ripple::config::Config;
//! use ripple::storage;
//! use ripple::worker::PollingWorker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!
//!     let stores = storage::connect(&config.store).await?;
//!     let worker = PollingWorker::new(&config, stores)?;
//!     worker.start().await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     worker.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod models;
pub mod storage;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::delivery::{DeliveryClient, DeliveryOutcome, Dispatcher, RetryPolicy};
    pub use crate::error::{Error, ErrorCategory, Result, RippleErrorTrait};
    pub use crate::models::{Batch, ChangeId, ChangeRecord, Metrics, WorkerStatus};
    pub use crate::storage::{
        ChangeLog, CheckpointStore, LeaseCoordinator, MemoryStore, MetricsStore, RedisStore,
        StoreHandles, WebhookRegistry,
    };
    pub use crate::worker::{CycleOutcome, CycleState, PollingWorker};
}

// Direct re-exports for convenience
pub use models::{Batch, ChangeId, ChangeRecord, Metrics, WorkerStatus};
