use thiserror::Error;

/// Main error type for the Tunegrid system
#[derive(Error, Debug)]
pub enum TgError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Invalid setup, rejected before any worker starts. Never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("number of trials must be greater than zero")]
    ZeroTrials,

    #[error("search space is empty")]
    EmptySearchSpace,

    #[error("ablation study has no ablatable groups")]
    EmptyAblationSpec,

    #[error("executor count must be greater than zero")]
    ZeroExecutors,

    #[error("a run is already active")]
    RunAlreadyActive,

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// The user training function produced an unusable result. Fails the
/// individual trial; the run continues.
#[derive(Error, Debug)]
pub enum MetricError {
    #[error("training function returned no value for optimization key '{key}'")]
    ReturnType { key: String },

    #[error("metric '{key}' is not a finite number: {value}")]
    MetricType { key: String, value: f64 },
}

/// Wire-protocol failures. Terminates the worker's connection; the worker's
/// current trial becomes an error, with no reassignment attempted.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("authentication failed for worker {worker_id}")]
    AuthFailed { worker_id: String },

    #[error("malformed message: {message}")]
    Malformed { message: String },

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("worker {worker_id} missed {missed} consecutive heartbeats")]
    HeartbeatTimeout { worker_id: String, missed: u32 },

    #[error("request rejected by coordinator: {reason}")]
    Rejected { reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode/decode error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Run-fatal failures: the whole experiment aborts and the error is
/// propagated to the caller after best-effort cleanup.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("trial generator failed: {message}")]
    GeneratorFailed { message: String },

    #[error("coordination server failed to bind {addr}: {source}")]
    ServerBind {
        addr: String,
        source: std::io::Error,
    },

    #[error("worker launch failed: {message}")]
    LaunchFailed { message: String },

    #[error("run aborted: {message}")]
    Aborted { message: String },
}

/// Result type alias for Tunegrid operations
pub type TgResult<T> = Result<T, TgError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::errors::TgError::Config($crate::errors::ConfigError::Invalid {
            message: format!($($arg)*),
        })
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::TgError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MetricError::ReturnType {
            key: "accuracy".to_string(),
        };
        assert!(error.to_string().contains("accuracy"));

        let error = ProtocolError::HeartbeatTimeout {
            worker_id: "2_0".to_string(),
            missed: 3,
        };
        assert!(error.to_string().contains("2_0"));
        assert!(error.to_string().contains('3'));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::RunAlreadyActive;
        let tg_error: TgError = config_error.into();

        match tg_error {
            TgError::Config(ConfigError::RunAlreadyActive) => (),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_macros() {
        let err = config_error!("bad direction: {}", "sideways");
        assert!(err.to_string().contains("sideways"));
        let _internal = internal_error!("unexpected state");
    }
}
