use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Bad descriptor or alert rule, rejected at initialize
    #[error("Configuration Error: {0}")]
    ConfigurationError(String),

    /// Connect/disconnect failure - drives health state, retried by the supervisor
    #[error("Connection Error: {0}")]
    ConnectionError(String),

    /// Authentication handshake failed after a successful connect
    #[error("Authentication Error: {0}")]
    AuthenticationError(String),

    /// Operation addressed to a gateway that is not in the active set
    #[error("Gateway Unavailable: {0}")]
    GatewayUnavailable(String),

    /// Cancel whose owning gateway cannot be resolved
    #[error("Order Not Found: {0}")]
    OrderNotFound(String),

    /// A handle call exceeded its timeout - counted as a failure for accounting
    #[error("Operation Timeout: {0}")]
    OperationTimeout(String),

    /// A subscriber or alert callback panicked - logged and isolated
    #[error("Handler Error: {0}")]
    HandlerError(String),

    /// Market data subscription failure
    #[error("Subscription Error: {0}")]
    SubscriptionError(String),

    /// Order submission/cancellation failure reported by the backend
    #[error("Execution Error: {0}")]
    ExecutionError(String),

    #[error("Event bus is stopped, publish rejected")]
    BusStopped,

    /// Unknown/unclassified errors
    #[error("Unknown Error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Unknown(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Unknown(format!("Anyhow error: {}", err))
    }
}

impl GatewayError {
    /// Determines if an error is recoverable through retry
    pub fn is_recoverable(&self) -> bool {
        match self {
            GatewayError::ConfigurationError(_) => false, // Config needs fixing
            GatewayError::ConnectionError(_) => true,     // Supervisor retries up to the cap
            GatewayError::AuthenticationError(_) => true, // Credentials may refresh
            GatewayError::GatewayUnavailable(_) => false, // Caller must pick another gateway
            GatewayError::OrderNotFound(_) => false,
            GatewayError::OperationTimeout(_) => true, // Timeouts are usually recoverable
            GatewayError::HandlerError(_) => false,    // Handler code needs fixing
            GatewayError::SubscriptionError(_) => true,
            GatewayError::ExecutionError(msg) => {
                // Some execution errors are recoverable (throttling, transient rejects)
                msg.contains("throttle") || msg.contains("temporary") || msg.contains("retry")
            }
            GatewayError::BusStopped => false,
            GatewayError::Unknown(_) => true,
        }
    }

    /// Categorizes error for metrics and monitoring
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            GatewayError::ConfigurationError(_) => ErrorCategory::Configuration,
            GatewayError::ConnectionError(_) => ErrorCategory::Connection,
            GatewayError::AuthenticationError(_) => ErrorCategory::Connection,
            GatewayError::GatewayUnavailable(_) => ErrorCategory::Routing,
            GatewayError::OrderNotFound(_) => ErrorCategory::Routing,
            GatewayError::OperationTimeout(_) => ErrorCategory::Timeout,
            GatewayError::HandlerError(_) => ErrorCategory::Handler,
            GatewayError::SubscriptionError(_) => ErrorCategory::Execution,
            GatewayError::ExecutionError(_) => ErrorCategory::Execution,
            GatewayError::BusStopped => ErrorCategory::Infrastructure,
            GatewayError::Unknown(_) => ErrorCategory::Critical,
        }
    }

    /// Short tag used when recording the error into the metrics window.
    pub fn metric_kind(&self) -> &'static str {
        match self.categorize() {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Routing => "routing",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Handler => "handler",
            ErrorCategory::Infrastructure => "infrastructure",
            ErrorCategory::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Routing,
    Execution,
    Timeout,
    Handler,
    Infrastructure,
    Critical,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
