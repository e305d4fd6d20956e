//! Error handling for the dimensional ETL engine
//!
//! This module provides idiomatic Rust error types using thiserror. The
//! taxonomy separates unrecoverable task failures (connection loss, schema
//! mismatch, key allocation, dependency cycles) from locally-recovered
//! conditions (lookup misses, row rejections, validation mismatches), which
//! are absorbed into structured results and never raised as errors.

use thiserror::Error;

/// Main error type for the ETL engine
#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Schema mismatch: {0}")]
    Schema(#[from] SchemaMismatchError),

    #[error("Key allocation error: {0}")]
    KeyAllocation(#[from] KeyAllocationError),

    #[error("Dependency cycle: {0}")]
    DependencyCycle(#[from] DependencyCycleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Source or target store unreachable, or a per-mapping timeout expired.
///
/// Fatal to the mapping task; never corrupts target data because table
/// loads are all-or-nothing.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Source '{source_table}' unreachable: {message}")]
    SourceUnavailable {
        source_table: String,
        message: String,
    },

    #[error("Target '{target_table}' unreachable: {message}")]
    TargetUnavailable {
        target_table: String,
        message: String,
    },

    #[error("Timeout after {duration_ms}ms during {operation}")]
    Timeout { operation: String, duration_ms: u64 },
}

/// A declared column is absent from an extracted row, or carries a type the
/// mapping cannot interpret. Fatal at config level, aborts the mapping
/// before any write.
#[derive(Error, Debug)]
pub enum SchemaMismatchError {
    #[error("Column '{column}' missing from source row for mapping '{mapping}'")]
    MissingColumn { column: String, mapping: String },

    #[error("Column '{column}' has type {found}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },
}

/// The surrogate-key sequence for a dimension could not be read or advanced.
/// Fatal to the dimension task only.
#[derive(Error, Debug)]
pub enum KeyAllocationError {
    #[error("Cannot read current maximum key for dimension '{dimension}': {message}")]
    MaxKeyUnavailable { dimension: String, message: String },

    #[error("Reservation of {count} keys for dimension '{dimension}' failed: {message}")]
    ReservationFailed {
        dimension: String,
        count: u32,
        message: String,
    },
}

/// The declared mapping dependency graph contains a cycle. Fatal at
/// orchestration start; terminates the run before any extraction.
#[derive(Error, Debug)]
#[error("Mapping dependency graph is cyclic through: {members:?}")]
pub struct DependencyCycleError {
    pub members: Vec<String>,
}

/// Invalid or unloadable run configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Mapping '{mapping}' references unknown dependency '{dependency}'")]
    UnknownDependency { mapping: String, dependency: String },

    #[error("Mapping '{mapping}' is declared more than once")]
    DuplicateMapping { mapping: String },

    #[error("Fact mapping '{mapping}' references dimension '{dimension}' with no dimension mapping")]
    UnknownDimension { mapping: String, dimension: String },

    #[error("Invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Manifest error: {message}")]
    Manifest { message: String },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(error: serde_yaml::Error) -> Self {
        ConfigError::Manifest {
            message: error.to_string(),
        }
    }
}

/// Result type aliases for convenience
pub type EtlResult<T> = Result<T, EtlError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let key_err = KeyAllocationError::MaxKeyUnavailable {
            dimension: "dim_party".to_string(),
            message: "store unavailable".to_string(),
        };

        let etl_err = EtlError::KeyAllocation(key_err);
        assert!(matches!(etl_err, EtlError::KeyAllocation(_)));
    }

    #[test]
    fn test_cycle_error_names_members() {
        let err = DependencyCycleError {
            members: vec!["map_a".to_string(), "map_b".to_string()],
        };
        let rendered = format!("{}", err);
        assert!(rendered.contains("map_a"));
        assert!(rendered.contains("map_b"));
    }

    #[test]
    fn test_timeout_display() {
        let err = ConnectionError::Timeout {
            operation: "extract".to_string(),
            duration_ms: 30_000,
        };
        assert_eq!(format!("{}", err), "Timeout after 30000ms during extract");
    }
}
