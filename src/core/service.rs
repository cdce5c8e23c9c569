use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{
    Semaphore,
    mpsc::{Receiver, channel},
};

use crate::{
    constants::PIPELINE_CHANNEL_CAPACITY,
    core::{
        domain::{Challenge, ExecutionLimits, Report, Submission, Verdict},
        pipeline::{
            accepting::handle_accepting, executing::handle_executing, forward, publish,
            validating::handle_validating,
        },
        traits::executor::Executor,
    },
};

/// Entry point for running and judging learner code.
///
/// Submissions are independent of each other. The only shared resource is
/// the admission semaphore bounding how many sandboxes run at once.
#[derive(Clone, Debug)]
pub struct SolutionChecker {
    executor: Arc<dyn Executor>,
    admission: Arc<Semaphore>,
    default_limits: ExecutionLimits,
}

impl SolutionChecker {
    pub fn new(executor: Arc<dyn Executor>, max_concurrent: usize, default_limits: ExecutionLimits) -> Self {
        Self {
            executor,
            admission: Arc::new(Semaphore::new(max_concurrent)),
            default_limits,
        }
    }

    /// Default limits with per-request overrides applied.
    pub fn limits_with(&self, time_ms: Option<u64>, output_limit_bytes: Option<usize>) -> ExecutionLimits {
        ExecutionLimits {
            time_ms: time_ms.unwrap_or(self.default_limits.time_ms),
            output_limit_bytes: output_limit_bytes.unwrap_or(self.default_limits.output_limit_bytes),
            ..self.default_limits.clone()
        }
    }

    pub fn new_submission(&self, code: &str, challenge: Arc<Challenge>, attempt: u32) -> Submission {
        Submission::new(code, challenge, self.default_limits.clone(), attempt)
    }

    /// Starts the pipeline for one submission and returns every state it goes
    /// through, ending with a terminal one. Dropping the receiver cancels the run.
    #[tracing::instrument(skip_all, fields(submission_id = %submission.id))]
    pub async fn submit(&self, submission: Submission) -> Receiver<Submission> {
        let (res_tx, res_rx) = channel::<Submission>(PIPELINE_CHANNEL_CAPACITY);
        let (accept_tx, accept_rx) = channel::<Submission>(PIPELINE_CHANNEL_CAPACITY);
        let (execute_tx, execute_rx) = channel::<Submission>(PIPELINE_CHANNEL_CAPACITY);
        let (validate_tx, validate_rx) = channel::<Submission>(PIPELINE_CHANNEL_CAPACITY);

        handle_accepting(res_tx.clone(), execute_tx, accept_rx);
        handle_executing(
            res_tx.clone(),
            validate_tx,
            execute_rx,
            self.executor.clone(),
            self.admission.clone(),
        );
        handle_validating(res_tx.clone(), validate_rx);

        tracing::debug!("Submission received for challenge {}", submission.challenge.id);
        if publish(&res_tx, &submission).await {
            forward(&accept_tx, submission).await;
        }

        res_rx
    }

    /// Runs a submission to completion. Dropping the returned future cancels
    /// the run and kills its sandbox.
    pub async fn run(&self, submission: Submission) -> Report {
        let _cancel_on_drop = submission.cancel.clone().drop_guard();
        let fallback = submission.clone();

        let mut states = self.submit(submission).await;
        while let Some(submission) = states.recv().await {
            if let Some(report) = Report::from_terminal(&submission) {
                return report;
            }
        }

        tracing::error!("Pipeline for submission {} ended without a verdict", fallback.id);
        Report {
            submission_id: fallback.id,
            challenge_id: fallback.challenge.id.clone(),
            verdict: Verdict::infrastructure_error(fallback.challenge.strategy),
            execution: None,
        }
    }

    /// Checks a first attempt at `challenge`.
    pub async fn execute_and_validate(&self, code: &str, challenge: Arc<Challenge>) -> Report {
        self.run(self.new_submission(code, challenge, 1)).await
    }

    /// Runs every challenge's reference solution and returns the reports of
    /// those that do not pass, ordered by challenge id.
    pub async fn verify<'a>(&self, challenges: impl IntoIterator<Item = &'a Arc<Challenge>>) -> Vec<Report> {
        let mut runs: FuturesUnordered<_> = challenges
            .into_iter()
            .map(|challenge| {
                let submission = self.new_submission(&challenge.solution, challenge.clone(), 1);
                self.run(submission)
            })
            .collect();

        let mut failures = Vec::new();
        while let Some(report) = runs.next().await {
            if !report.verdict.passed {
                tracing::warn!(
                    "Reference solution of {} does not pass: {}",
                    report.challenge_id,
                    report.verdict.feedback
                );
                failures.push(report);
            }
        }
        failures.sort_by(|a, b| a.challenge_id.cmp(&b.challenge_id));
        failures
    }
}
