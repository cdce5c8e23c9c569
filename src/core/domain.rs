use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::constants::{
    CANCELLED_FEEDBACK, DEFAULT_FAILURE_MESSAGE, DEFAULT_MEMORY_BYTES, DEFAULT_OUTPUT_LIMIT_BYTES,
    DEFAULT_SUCCESS_MESSAGE, DEFAULT_TIME_BUDGET_MS, INFRASTRUCTURE_ERROR_FEEDBACK,
};
use crate::core::validation::rules::Rules;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    ExactMatch,
    OutputMatch,
    PatternMatch,
    #[serde(alias = "code_structure")]
    AstCheck,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ExactMatch => "exact_match",
            Strategy::OutputMatch => "output_match",
            Strategy::PatternMatch => "pattern_match",
            Strategy::AstCheck => "ast_check",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(default)]
    pub id: String,
    pub prompt: String,
    pub solution: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default, alias = "validation_type")]
    pub strategy: Strategy,
    #[serde(default, alias = "requirements")]
    pub validation_rules: serde_json::Value,
    #[serde(default)]
    pub success_message: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

fn default_difficulty() -> u32 {
    1
}

impl Challenge {
    /// Hints are revealed progressively: one more per failed attempt, up to three.
    pub fn hint(&self, attempt: u32) -> String {
        let idx = attempt.clamp(1, 3) as usize - 1;
        if let Some(hint) = self.hints.get(idx) {
            return format!("Hint: {}", hint);
        }

        match idx {
            0 => "Hint: Break the problem down into smaller steps.".to_string(),
            1 => "Hint: Look back at the example code from the lesson.".to_string(),
            _ => match self.hints.last() {
                Some(hint) => format!("Hint: {}", hint),
                None => "Hint: Compare your program with the prompt line by line.".to_string(),
            },
        }
    }

    pub fn success_message(&self) -> &str {
        self.success_message
            .as_deref()
            .unwrap_or(DEFAULT_SUCCESS_MESSAGE)
    }

    pub fn failure_message(&self) -> &str {
        self.failure_message
            .as_deref()
            .unwrap_or(DEFAULT_FAILURE_MESSAGE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    /// Combined cap for captured stdout and stderr.
    pub output_limit_bytes: usize,
    pub memory_bytes: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            time_ms: DEFAULT_TIME_BUDGET_MS,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Completed,
    TimedOut,
    RuntimeError,
    OutputTooLarge,
    /// Refused by the source policy before any process was started.
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

impl ExecutionResult {
    /// `success` is derived from the termination so that a timed out or
    /// oversized run can never be reported as successful.
    pub fn new(
        termination: Termination,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        truncated: bool,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: termination == Termination::Completed,
            stdout,
            stderr,
            duration_ms,
            termination,
            exit_code,
            truncated,
        }
    }

    pub fn rejected(reason: String) -> Self {
        Self::new(Termination::Rejected, None, String::new(), reason, false, 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictCategory {
    Pass,
    LearnerError,
    Timeout,
    InfrastructureError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub passed: bool,
    pub category: VerdictCategory,
    pub feedback: String,
    pub strategy: Strategy,
    pub hint: Option<String>,
}

impl Verdict {
    pub fn pass(strategy: Strategy, feedback: String) -> Self {
        Self {
            passed: true,
            category: VerdictCategory::Pass,
            feedback,
            strategy,
            hint: None,
        }
    }

    pub fn fail(
        strategy: Strategy,
        category: VerdictCategory,
        feedback: String,
        hint: Option<String>,
    ) -> Self {
        Self {
            passed: false,
            category,
            feedback,
            strategy,
            hint,
        }
    }

    /// Learner-facing verdict for a system fault. Never carries internal detail.
    pub fn infrastructure_error(strategy: Strategy) -> Self {
        Self::fail(
            strategy,
            VerdictCategory::InfrastructureError,
            INFRASTRUCTURE_ERROR_FEEDBACK.to_string(),
            None,
        )
    }
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub code: String,
    pub challenge: Arc<Challenge>,
    pub limits: ExecutionLimits,
    pub attempt: u32,
    pub rules: Option<Arc<Rules>>,
    pub cancel: CancellationToken,
    pub state: SubmissionState,
}

impl Submission {
    pub fn new(code: &str, challenge: Arc<Challenge>, limits: ExecutionLimits, attempt: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            code: code.to_string(),
            challenge,
            limits,
            attempt: attempt.max(1),
            rules: None,
            cancel: CancellationToken::new(),
            state: SubmissionState::default(),
        }
    }

    pub fn change_state(&self, new_state: SubmissionState) -> Self {
        Self {
            state: new_state,
            updated_at: chrono::Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_rules(self, rules: Arc<Rules>) -> Self {
        Self {
            rules: Some(rules),
            ..self
        }
    }
}

#[derive(Clone, Debug, Default)]
pub enum SubmissionState {
    #[default]
    Received,
    Accepted,
    Executing,
    Executed(ExecutionResult),
    Validating,
    Reported {
        verdict: Verdict,
        execution: Option<ExecutionResult>,
    },
    InfrastructureError {
        detail: String,
    },
    Cancelled,
}

impl SubmissionState {
    pub fn name(&self) -> &'static str {
        match self {
            SubmissionState::Received => "received",
            SubmissionState::Accepted => "accepted",
            SubmissionState::Executing => "executing",
            SubmissionState::Executed(_) => "executed",
            SubmissionState::Validating => "validating",
            SubmissionState::Reported { .. } => "reported",
            SubmissionState::InfrastructureError { .. } => "infrastructure_error",
            SubmissionState::Cancelled => "cancelled",
        }
    }
}

/// Final outcome handed back to callers once a submission reaches a terminal state.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub submission_id: Uuid,
    pub challenge_id: String,
    pub verdict: Verdict,
    pub execution: Option<ExecutionResult>,
}

impl Report {
    pub fn from_terminal(submission: &Submission) -> Option<Self> {
        let strategy = submission.challenge.strategy;
        let (verdict, execution) = match &submission.state {
            SubmissionState::Reported { verdict, execution } => {
                (verdict.clone(), execution.clone())
            }
            SubmissionState::InfrastructureError { detail } => {
                // Learners only see the generic verdict.
                tracing::error!("Submission {} failed to run: {}", submission.id, detail);
                (Verdict::infrastructure_error(strategy), None)
            }
            SubmissionState::Cancelled => (
                Verdict::fail(
                    strategy,
                    VerdictCategory::InfrastructureError,
                    CANCELLED_FEEDBACK.to_string(),
                    None,
                ),
                None,
            ),
            _ => return None,
        };

        Some(Self {
            submission_id: submission.id,
            challenge_id: submission.challenge.id.clone(),
            verdict,
            execution,
        })
    }
}
