use std::sync::Arc;

use tokio::sync::{
    Semaphore,
    mpsc::{Receiver, Sender},
};

use crate::core::{
    domain::{Submission, SubmissionState},
    pipeline::{forward, publish},
    traits::executor::{ExecuteError, Executor},
};

/// Runs accepted submissions, at most as many at once as `admission` has permits.
#[tracing::instrument(skip_all)]
pub fn handle_executing(
    res_tx: Sender<Submission>,
    validate_tx: Sender<Submission>,
    mut execute_rx: Receiver<Submission>,
    executor: Arc<dyn Executor>,
    admission: Arc<Semaphore>,
) {
    tokio::spawn(async move {
        while let Some(submission) = execute_rx.recv().await {
            let res_tx = res_tx.clone();
            let validate_tx = validate_tx.clone();
            let executor = executor.clone();
            let admission = admission.clone();

            tokio::spawn(async move {
                handle_submission(submission, res_tx, validate_tx, executor, admission).await;
            });
        }
    });
}

async fn handle_submission(
    submission: Submission,
    res_tx: Sender<Submission>,
    validate_tx: Sender<Submission>,
    executor: Arc<dyn Executor>,
    admission: Arc<Semaphore>,
) {
    let SubmissionState::Accepted = submission.state else {
        tracing::error!(
            "Submission {} reached executing in state {:?}",
            submission.id,
            submission.state
        );
        return;
    };

    let cancel = submission.cancel.clone();
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            publish(&res_tx, &submission.change_state(SubmissionState::Cancelled)).await;
            return;
        }
        permit = admission.acquire_owned() => permit,
    };
    let Ok(permit) = permit else {
        tracing::error!("Admission semaphore is closed");
        let submission = submission.change_state(SubmissionState::InfrastructureError {
            detail: "admission semaphore closed".to_string(),
        });
        publish(&res_tx, &submission).await;
        return;
    };

    let submission = submission.change_state(SubmissionState::Executing);
    if !publish(&res_tx, &submission).await {
        return;
    }

    tracing::debug!("Start executing submission {}", submission.id);
    let execution = executor
        .execute(&submission.code, &submission.limits, cancel)
        .await;
    drop(permit);
    tracing::debug!("Execution result: {:?}", execution);

    match execution {
        Ok(result) => {
            let submission = submission.change_state(SubmissionState::Executed(result));
            if publish(&res_tx, &submission).await {
                forward(&validate_tx, submission).await;
            }
        }
        Err(ExecuteError::Cancelled) => {
            tracing::info!("Submission {} was cancelled", submission.id);
            publish(&res_tx, &submission.change_state(SubmissionState::Cancelled)).await;
        }
        Err(ExecuteError::Unavailable { msg }) => {
            tracing::error!("Sandbox failed for submission {}: {}", submission.id, msg);
            let submission =
                submission.change_state(SubmissionState::InfrastructureError { detail: msg });
            publish(&res_tx, &submission).await;
        }
    }
}
