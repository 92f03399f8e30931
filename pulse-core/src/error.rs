//! Error types for signals and the message bus.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error returned by a bus handler.
///
/// Boxed so handlers can use `?` on any error type.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for bus handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Main error type for bus operations.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    /// A subscriber's handler returned an error.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// A subscriber's handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// A handler ran longer than its allotted time.
    #[error("Handler for {message_type} timed out after {after:?}")]
    Timeout {
        message_type: &'static str,
        after: Duration,
    },

    /// Async work needs a tokio runtime and none is available.
    #[error("No tokio runtime available to run handler for {0}")]
    NoRuntime(&'static str),

    /// A required collaborator is missing or misconfigured.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A middleware failed.
    #[error("Middleware error: {0}")]
    Middleware(String),

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(Arc<serde_json::Error>),
}

impl BusError {
    /// Wrap a handler error.
    pub fn handler(err: HandlerError) -> Self {
        BusError::Handler(err.to_string())
    }

    /// Build a middleware error from anything displayable.
    pub fn middleware(msg: impl fmt::Display) -> Self {
        BusError::Middleware(msg.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::Config(Arc::new(e))
    }
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// A failure captured by an async signal load.
///
/// Clones share the underlying error. Two `LoadError`s are equal only if they
/// are clones of the same failure, so every new failure counts as a change.
#[derive(Clone)]
pub struct LoadError(Arc<dyn std::error::Error + Send + Sync>);

impl LoadError {
    /// Wrap an error.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self(Arc::from(err.into()))
    }

    /// Borrow the underlying error.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl PartialEq for LoadError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoadError").field(&self.0.to_string()).finish()
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_equality_is_identity() {
        let a = LoadError::new("boom");
        let b = a.clone();
        let c = LoadError::new("boom");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "boom");
    }

    #[test]
    fn bus_error_messages() {
        let err = BusError::Timeout {
            message_type: "Ping",
            after: Duration::from_millis(5),
        };
        assert_eq!(err.to_string(), "Handler for Ping timed out after 5ms");

        let err = BusError::handler("nope".into());
        assert_eq!(err.to_string(), "Handler failed: nope");
    }

    #[test]
    fn config_parse_error_converts() {
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: BusError = parse.into();
        assert!(matches!(err, BusError::Config(_)));
    }
}
