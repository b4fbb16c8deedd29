//! Error types for payload decoding.

use thiserror::Error;

/// Errors from parsing a size value such as `"8G"` or `20`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizeError {
    /// The value was an empty string.
    #[error("size cannot be empty")]
    Empty,

    /// The value was zero or negative.
    #[error("size must be positive, got '{0}'")]
    NotPositive(String),

    /// The numeric part could not be parsed.
    #[error("invalid size number '{0}'")]
    InvalidNumber(String),

    /// The unit suffix is not one of the accepted units.
    #[error("unknown size unit '{0}' (expected K, M, G or T)")]
    UnknownUnit(String),

    /// The value rounds down to less than one MiB.
    #[error("size '{0}' is smaller than 1M")]
    TooSmall(String),

    /// The value does not fit the supported range.
    #[error("size '{0}' is too large")]
    TooLarge(String),

    /// The JSON value was neither a number nor a string.
    #[error("size must be a number or a string, got {0}")]
    InvalidType(&'static str),
}

/// Errors from decoding a command payload into a typed command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    /// The action needs a host identifier.
    #[error("{action} requires host_id")]
    MissingHostId { action: &'static str },

    /// The action needs a host identifier or an instance name.
    #[error("{action} requires host_id or name")]
    MissingTarget { action: &'static str },

    /// A size field failed to parse.
    #[error("invalid {field}: {source}")]
    InvalidSize {
        field: &'static str,
        #[source]
        source: SizeError,
    },

    /// A non-size field had the wrong shape.
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl PayloadError {
    /// Name of the payload field this error refers to, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            PayloadError::InvalidSize { field, .. } | PayloadError::InvalidField { field, .. } => {
                Some(*field)
            }
            PayloadError::MissingHostId { .. } => Some("host_id"),
            PayloadError::MissingTarget { .. } => None,
        }
    }
}
