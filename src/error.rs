//! Crate-wide error type.
//!
//! Per-message and per-tick failures are handled where they happen (logged and
//! counted); only the variants below ever travel up a call stack.

use thiserror::Error;

use crate::protocol::PropertyMap;

#[derive(Error, Debug)]
pub enum EmulationError {
    #[error(
        "sensor on `{property}` samples at {sensor_freq} Hz, which does not divide the plant tick rate of {plant_freq} Hz"
    )]
    IncompatibleFrequency {
        property: String,
        sensor_freq: u32,
        plant_freq: u32,
    },

    #[error("missing expected update for property `{0}`")]
    MissingProperty(String),

    #[error("simulation reached an unrecoverable state, failed sanity checks: {0:?}")]
    UnrecoverableState(PropertyMap),

    #[error("property `{0}` declared with more than one role")]
    ConflictingRole(String),

    #[error("property `{0}` was never declared")]
    UnknownProperty(String),

    #[error("controller interface used before its transport was bound")]
    NotReady,

    #[error("controller failed to process samples: {0}")]
    Controller(String),

    #[error("no controller registered under class `{0}`")]
    UnknownController(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("worker failure: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, EmulationError>;
