use tokio::sync::mpsc::{Receiver, Sender};

use crate::core::{
    domain::{Submission, SubmissionState},
    pipeline::publish,
    validation::validate,
};

#[tracing::instrument(skip_all)]
pub fn handle_validating(res_tx: Sender<Submission>, mut validate_rx: Receiver<Submission>) {
    tokio::spawn(async move {
        while let Some(submission) = validate_rx.recv().await {
            let res_tx = res_tx.clone();

            tokio::spawn(async move {
                handle_submission(submission, res_tx).await;
            });
        }
    });
}

async fn handle_submission(submission: Submission, res_tx: Sender<Submission>) {
    let SubmissionState::Executed(result) = &submission.state else {
        tracing::error!(
            "Submission {} reached validating in state {:?}",
            submission.id,
            submission.state
        );
        return;
    };
    let result = result.clone();

    let Some(rules) = submission.rules.clone() else {
        tracing::error!("Submission {} has no compiled rules", submission.id);
        let submission = submission.change_state(SubmissionState::InfrastructureError {
            detail: "validation rules missing".to_string(),
        });
        publish(&res_tx, &submission).await;
        return;
    };

    let submission = submission.change_state(SubmissionState::Validating);
    if !publish(&res_tx, &submission).await {
        return;
    }

    let verdict = validate(
        &submission.code,
        &result,
        &submission.challenge,
        &rules,
        submission.attempt,
    );
    tracing::info!(
        submission_id = %submission.id,
        challenge_id = %submission.challenge.id,
        passed = verdict.passed,
        "Submission validated"
    );

    let submission = submission.change_state(SubmissionState::Reported {
        verdict,
        execution: Some(result),
    });
    publish(&res_tx, &submission).await;
}
