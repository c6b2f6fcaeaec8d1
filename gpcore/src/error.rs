//! Error types for the emulator core.

use thiserror::Error;

/// Core error type.
///
/// `Configuration` and `MalformedPatternFile` are fatal and surface before any
/// event is processed. `UnsupportedExtrapolation` is scoped to one reference
/// stub and `InvalidStub` to one event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Missing or invalid input, inconsistent flag combination
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Structural error in a pattern file
    #[error("malformed pattern file: {0}")]
    MalformedPatternFile(String),

    /// Extrapolation requested where it cannot be computed
    #[error("unsupported extrapolation from layer {ref_layer}: {reason}")]
    UnsupportedExtrapolation { ref_layer: u8, reason: String },

    /// Stub that cannot belong to the configured detector
    #[error("invalid stub: {0}")]
    InvalidStub(String),
}

impl Error {
    pub(crate) fn unsupported(ref_layer: u8, reason: impl Into<String>) -> Self {
        Error::UnsupportedExtrapolation { ref_layer, reason: reason.into() }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
