use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApsError {
    /// Invalid clinical configuration; the cycle must not enact any dose.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("unknown dose {0}")]
    UnknownDose(Uuid),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing profile")]
    MissingProfile,
    #[error("missing glucose history")]
    MissingGlucose,
    #[error("missing clock")]
    MissingClock,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
