//! Error taxonomy for the tracking filter.
//!
//! Geometry that does not fit an edge is not an error: it is reported as `None` by the
//! path types and silently excluded from scoring. Construction invariants (for example a
//! backward path edge with a positive distance to start) are caller bugs and panic.
//! Everything else a caller can recover from or must decide on is a [`TrackingError`].

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the tracking library.
#[derive(Debug, Error)]
pub enum TrackingError {
    /// Every particle in the population scored `-inf`; resampling would only mask a
    /// search or modeling failure.
    #[error("degenerate particle population: all {0} particles have zero predictive likelihood")]
    DegeneratePopulation(usize),

    #[error("particle population is empty")]
    EmptyPopulation,

    /// A categorical was requested over an empty or all-`-inf` support.
    #[error("no candidate with a finite log-likelihood in {0}")]
    EmptyCandidateSet(&'static str),

    /// A raw coordinate could not be projected onto the local plane.
    #[error("cannot project ({latitude}, {longitude}): {reason}")]
    Projection {
        latitude: f64,
        longitude: f64,
        reason: String,
    },

    #[error("observation at {current} precedes the last accepted one at {previous}")]
    OutOfOrderObservation {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    #[error("unknown motion estimator '{0}'")]
    UnknownEstimator(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, TrackingError>;

impl From<toml::de::Error> for TrackingError {
    fn from(err: toml::de::Error) -> Self {
        TrackingError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TrackingError {
    fn from(err: serde_json::Error) -> Self {
        TrackingError::Serialization(err.to_string())
    }
}
