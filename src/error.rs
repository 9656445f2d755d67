//! Centralized error types for the poller
//!
//! All poller errors are represented by the `PollError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, PollError>`.
//!
//! The first four variants form the session taxonomy: a polling session
//! catches them, records them against the station and reports `Failed`.
//! Everything else is an infrastructure error (config file, status store,
//! runtime) that surfaces to the caller of the controller.

use std::fmt;
use std::path::PathBuf;

/// Session-level classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Dial,
    Login,
    Protocol,
    Other,
}

/// All poller errors
#[derive(Debug)]
pub enum PollError {
    // === Session taxonomy ===
    /// Misconfiguration (pool settings, unknown logger type, ...)
    Config { message: String },
    /// Transport could not be established
    Dial {
        target: String,
        reason: String,
        source: Option<std::io::Error>,
    },
    /// Authentication, handshake or script parse failure
    Login { message: String },
    /// Script execution failure
    Protocol { message: String },

    // === IO ===
    /// File system operation failed
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to read a config file
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Config file is not valid TOML for the expected schema
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    // === Network ===
    /// Failed to bind the listening socket
    ListenBind { port: u16, source: std::io::Error },

    // === Status store ===
    /// Status store read/write failed
    Status { message: String },

    // === Runtime ===
    /// Tokio runtime creation failed
    Runtime { source: std::io::Error },
}

impl PollError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn dial(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dial {
            target: target.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn login(message: impl Into<String>) -> Self {
        Self::Login {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Session-level classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } | Self::ConfigRead { .. } | Self::ConfigParse { .. } => {
                ErrorKind::Config
            }
            Self::Dial { .. } => ErrorKind::Dial,
            Self::Login { .. } => ErrorKind::Login,
            Self::Protocol { .. } => ErrorKind::Protocol,
            _ => ErrorKind::Other,
        }
    }
}

impl std::error::Error for PollError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dial {
                source: Some(source),
                ..
            } => Some(source),
            Self::Io { source, .. }
            | Self::ConfigRead { source, .. }
            | Self::ListenBind { source, .. }
            | Self::Runtime { source } => Some(source),
            Self::ConfigParse { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message } => write!(f, "Configuration error: {}", message),
            Self::Dial {
                target,
                reason,
                source,
            } => match source {
                Some(e) => write!(f, "Cannot connect to {}: {}: {}", target, reason, e),
                None => write!(f, "Cannot connect to {}: {}", target, reason),
            },
            Self::Login { message } => write!(f, "Login failed: {}", message),
            Self::Protocol { message } => write!(f, "Protocol error: {}", message),
            Self::Io { path, source } => write!(f, "IO error: {}: {}", path.display(), source),
            Self::ConfigRead { path, .. } => write!(f, "Cannot read config: {}", path.display()),
            Self::ConfigParse { path, source } => {
                write!(f, "Invalid config {}: {}", path.display(), source)
            }
            Self::ListenBind { port, .. } => write!(f, "Cannot bind listening port {}", port),
            Self::Status { message } => write!(f, "Status store error: {}", message),
            Self::Runtime { .. } => write!(f, "Failed to create runtime"),
        }
    }
}

/// Alias for Result with PollError
pub type Result<T> = std::result::Result<T, PollError>;
