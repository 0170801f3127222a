//! RNE financial statements
//!
//! Local access to the annual-accounts bulk dataset of the French national
//! business registry:
//!
//! - [`index`]: SIREN range index over the dataset's shard files
//! - [`shards`]: shard download, cache and eviction
//! - [`extract`]: six-metric extraction from raw records
//! - [`store`]: durable SQLite store of extracted metrics
//! - [`enricher`]: bounded-concurrency batch lookups through the shards
//! - [`api`]: rate-limited identity-search client
//! - [`service`]: consumer-facing lookups joining the above

pub mod api;
pub mod config;
pub mod enricher;
pub mod error;
pub mod extract;
pub mod index;
pub mod record;
pub mod service;
pub mod shards;
pub mod siren;
pub mod store;

pub use config::{ApiConfig, EnricherConfig, FtpConfig, RneConfig, ShardStoreConfig};
pub use enricher::{BatchEnricher, BatchProgress, BatchReport, EnrichmentResult, LookupStatus};
pub use error::{ApiError, IndexError, Result, RneError, SchemaViolation, ShardError, StoreError};
pub use extract::{extract, to_compact, FinancialMetrics, MetricCode, MetricValue};
pub use index::{RangeIndex, RangeIndexEntry};
pub use record::{RawRecord, Shard};
pub use service::{EnrichedCompany, EnrichmentService, FinancesResponse};
pub use shards::ShardStore;
pub use siren::Siren;
pub use store::{BuildReport, FinancialStore, StoredBilan};
