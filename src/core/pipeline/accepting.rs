use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};

use crate::core::{
    domain::{Submission, SubmissionState},
    pipeline::{forward, publish},
    validation::rules::Rules,
};

#[tracing::instrument(skip_all)]
pub fn handle_accepting(
    res_tx: Sender<Submission>,
    execute_tx: Sender<Submission>,
    mut accept_rx: Receiver<Submission>,
) {
    tokio::spawn(async move {
        while let Some(submission) = accept_rx.recv().await {
            let res_tx = res_tx.clone();
            let execute_tx = execute_tx.clone();

            tokio::spawn(async move {
                handle_submission(submission, res_tx, execute_tx).await;
            });
        }
    });
}

async fn handle_submission(
    submission: Submission,
    res_tx: Sender<Submission>,
    execute_tx: Sender<Submission>,
) {
    let SubmissionState::Received = submission.state else {
        tracing::error!(
            "Submission {} reached accepting in state {:?}",
            submission.id,
            submission.state
        );
        return;
    };

    let challenge = submission.challenge.clone();
    match Rules::parse(challenge.strategy, &challenge.validation_rules) {
        Ok(rules) => {
            let submission = submission
                .with_rules(Arc::new(rules))
                .change_state(SubmissionState::Accepted);
            if publish(&res_tx, &submission).await {
                forward(&execute_tx, submission).await;
            }
        }
        Err(e) => {
            tracing::error!(
                challenge_id = %challenge.id,
                "Challenge has malformed validation rules: {}",
                e
            );
            let submission = submission.change_state(SubmissionState::InfrastructureError {
                detail: e.to_string(),
            });
            publish(&res_tx, &submission).await;
        }
    }
}
