use thiserror::Error;

/// Top-level error type for the gauntlet-core library.
#[derive(Debug, Error)]
pub enum GauntletError {
    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Wraps `std::io::Error`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, GauntletError>;
