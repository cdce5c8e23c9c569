//! Per-request stages connected by channels: accepting -> executing -> validating.
//!
//! Every state change is published on the result channel before the
//! submission is forwarded, so observers see states in order.

use tokio::sync::mpsc::Sender;

use crate::core::domain::Submission;

pub mod accepting;
pub mod executing;
pub mod validating;

/// Reports a state change. When nobody listens anymore the submission is
/// cancelled and `false` is returned.
pub async fn publish(res_tx: &Sender<Submission>, submission: &Submission) -> bool {
    if res_tx.send(submission.clone()).await.is_err() {
        tracing::debug!("Observer of submission {} is gone, cancelling", submission.id);
        submission.cancel.cancel();
        return false;
    }
    true
}

/// Hands the submission to the next stage.
pub async fn forward(next_tx: &Sender<Submission>, submission: Submission) {
    let cancel = submission.cancel.clone();
    let id = submission.id;
    if next_tx.send(submission).await.is_err() {
        tracing::error!("Next stage is gone, dropping submission {}", id);
        cancel.cancel();
    }
}


#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::test_support::hello_submission;
    use super::*;

    #[tokio::test]
    async fn test_publish_cancels_when_observer_is_gone() {
        let (res_tx, res_rx) = mpsc::channel(1);
        drop(res_rx);

        let submission = hello_submission();
        assert!(!publish(&res_tx, &submission).await);
        assert!(submission.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_forward_cancels_when_stage_is_gone() {
        let (next_tx, next_rx) = mpsc::channel(1);
        drop(next_rx);

        let submission = hello_submission();
        let cancel = submission.cancel.clone();
        forward(&next_tx, submission).await;
        assert!(cancel.is_cancelled());
    }
}
