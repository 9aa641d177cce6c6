//! Error handling for the tally system

/// Result type alias for the tally system
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tally system
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Roster, environment or candidate-id errors (programmer errors)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The local record disagrees with what is being recorded or with the store
    #[error("Inconsistent local state: recorded vote for {recorded}, attempted {attempted}")]
    InconsistentLocalState { recorded: String, attempted: String },

    /// The shared store could not be reached
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Optimistic transaction kept losing to concurrent writers
    #[error("Transaction on {key} abandoned after {attempts} attempts")]
    ConflictExhausted { key: String, attempts: u32 },

    /// The store answered with something outside the wire contract
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Local record could not be read or written
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new inconsistent-local-state error
    pub fn inconsistent(recorded: impl Into<String>, attempted: impl Into<String>) -> Self {
        Self::InconsistentLocalState {
            recorded: recorded.into(),
            attempted: attempted.into(),
        }
    }

    /// Create a new unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failure is worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::ConflictExhausted { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::protocol(err.to_string())
        } else {
            Self::unavailable(err.to_string())
        }
    }
}

/// Convenience macros for creating specific error types
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::Error::configuration($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! store_error {
    ($msg:expr) => {
        $crate::Error::unavailable($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::unavailable(format!($fmt, $($arg)*))
    };
}
