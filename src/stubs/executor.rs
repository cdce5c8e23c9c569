use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{ExecutionLimits, ExecutionResult},
    traits::executor::{ExecuteError, Executor},
};

/// Answers every execution with the same canned result after a delay.
#[derive(Debug)]
pub struct ExecutorStub {
    result: Result<ExecutionResult, ExecuteError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ExecutorStub {
    pub fn new(result: Result<ExecutionResult, ExecuteError>, delay: Duration) -> Self {
        Self {
            result,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Executor for ExecutorStub {
    #[tracing::instrument(skip(self, cancel))]
    async fn execute(
        &self,
        code: &str,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ExecuteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Start execution: limits={:?}", limits);

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Execution cancelled");
                Err(ExecuteError::Cancelled)
            }
            _ = tokio::time::sleep(self.delay) => {
                tracing::debug!("Execution result: {:?}", self.result);
                self.result.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::Termination;

    #[tokio::test]
    async fn test_returns_canned_result() {
        let result = ExecutionResult::new(Termination::Completed, Some(0), "hi\n".to_string(), String::new(), false, 1);
        let stub = ExecutorStub::new(Ok(result.clone()), Duration::from_millis(10));

        let got = stub
            .execute("print('hi')", &ExecutionLimits::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(got, result);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_honours_cancellation() {
        let stub = ExecutorStub::new(
            Err(ExecuteError::Unavailable { msg: "never".to_string() }),
            Duration::from_secs(60),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let got = stub.execute("", &ExecutionLimits::default(), cancel).await;
        assert!(matches!(got, Err(ExecuteError::Cancelled)));
    }
}
