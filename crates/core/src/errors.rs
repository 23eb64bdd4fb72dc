use thiserror::Error;

/// Error taxonomy for the task queue subsystem.
#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("publish to subject {subject} failed: {message}")]
    Publish { subject: String, message: String },

    #[error("publish buffer full for subject {subject}")]
    Backpressure { subject: String },

    #[error("stream provisioning failed: {0}")]
    StreamProvision(String),

    #[error("invalid cron expression: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("schedule store error: {0}")]
    ScheduleStore(String),

    #[error("handler {handler} failed: {message}")]
    Handler { handler: String, message: String },

    #[error("no handler registered under name: {handler}")]
    HandlerNotFound { handler: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskQueueError {
    pub fn publish(subject: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.to_string(),
        }
    }

    pub fn handler(handler: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.to_string(),
        }
    }

    /// Errors that terminate process start rather than being retried.
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Connection(_))
    }
}

impl From<serde_json::Error> for TaskQueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TaskQueueError>;
