//! Dimensional ETL and validation engine
//!
//! Maintains the L3 dimensional warehouse of the tax-administration data
//! platform from its L2 normalized store: slowly-changing-dimension
//! maintenance with collision-free surrogate keys, fact loading with
//! sentinel-backed foreign-key resolution, a four-category validation
//! framework, and a dependency orchestrator with a dimension -> fact phase
//! barrier. External collaborators (source extraction, the target
//! warehouse, the metadata store, the audit store) are injected traits;
//! in-memory implementations back tests and dry runs, Postgres
//! implementations live behind the `database` feature.

pub mod audit;
pub mod config;
pub mod dimension;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fact;
#[cfg(feature = "database")]
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod resolver;
pub mod sequence;
pub mod sink;
pub mod validation;

pub use engine::{EtlEngine, RunReport};
pub use error::{EtlError, EtlResult};
