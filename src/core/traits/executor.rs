use tokio_util::sync::CancellationToken;

use crate::core::domain::{ExecutionLimits, ExecutionResult};

#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    /// Runs `code` in isolation. Learner mistakes (crashes, timeouts, huge
    /// output) come back as `Ok` with the matching termination; `Err` is
    /// reserved for the sandbox itself failing or the run being cancelled.
    async fn execute(
        &self,
        code: &str,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    #[error("sandbox unavailable: {msg}")]
    Unavailable { msg: String },
    #[error("execution cancelled")]
    Cancelled,
}

impl From<std::io::Error> for ExecuteError {
    fn from(err: std::io::Error) -> Self {
        ExecuteError::Unavailable {
            msg: err.to_string(),
        }
    }
}
