//! # Keymeter Engine
//!
//! Bounded concurrent fetch-and-aggregate engine for metered API keys.
//!
//! ## Flow
//!
//! ```text
//! UsageService -> UsageAggregator -> BatchCoordinator -> WorkerPool -> UsageFetcher
//!       ^               |  (fresh cache hits skip the fetch)             |
//!       +---------------+<-------------- results -----------------------+
//! ```
//!
//! Every key handed to the aggregator yields exactly one record in the
//! report, in input order: a fetched value, a cached value, or a placeholder
//! whose error explains why no value is available.

pub mod aggregator;
pub mod config;
pub mod coordinator;
pub mod fetcher;
pub mod pool;
pub mod service;
pub mod store;

pub use aggregator::{AggregatorConfig, LocalUsageCache, ReportTicket, UsageAggregator};
pub use config::KeymeterConfig;
pub use coordinator::{
    batch_deadline, BatchCoordinator, CoordinatorConfig, ProgressEvent, ProgressObserver,
    TracingProgress,
};
pub use fetcher::{FetcherConfig, HttpUsageFetcher, UsageFetcher};
pub use pool::{PoolConfig, PoolState, PoolStats, Task, TaskResult, WorkerPool};
pub use service::UsageService;
pub use store::{KeyStore, MemoryStorage, RedisStorage, UsageCache};
