use tonic::Status;

use crate::core::domain;
use crate::grpc::models::{self, Empty, submission};

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },
    #[error("Invalid value for {field}: {msg}")]
    InvalidValue { field: String, msg: String },
}

impl From<ConversionError> for Status {
    fn from(err: ConversionError) -> Self {
        Status::invalid_argument(err.to_string())
    }
}

impl TryFrom<models::Strategy> for domain::Strategy {
    type Error = ConversionError;

    fn try_from(strategy: models::Strategy) -> Result<Self, ConversionError> {
        match strategy {
            models::Strategy::ExactMatch => Ok(domain::Strategy::ExactMatch),
            models::Strategy::OutputMatch => Ok(domain::Strategy::OutputMatch),
            models::Strategy::PatternMatch => Ok(domain::Strategy::PatternMatch),
            models::Strategy::AstCheck => Ok(domain::Strategy::AstCheck),
            models::Strategy::Unspecified => Err(ConversionError::MissingField {
                field: "challenge.strategy".to_string(),
            }),
        }
    }
}

impl TryFrom<models::Challenge> for domain::Challenge {
    type Error = ConversionError;

    fn try_from(challenge: models::Challenge) -> Result<Self, ConversionError> {
        let strategy = models::Strategy::try_from(challenge.strategy)
            .map_err(|e| ConversionError::InvalidValue {
                field: "challenge.strategy".to_string(),
                msg: e.to_string(),
            })?
            .try_into()?;

        let validation_rules = if challenge.validation_rules_json.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&challenge.validation_rules_json).map_err(|e| {
                ConversionError::InvalidValue {
                    field: "challenge.validation_rules_json".to_string(),
                    msg: e.to_string(),
                }
            })?
        };

        Ok(Self {
            id: challenge.id,
            prompt: challenge.prompt,
            solution: challenge.solution,
            hints: challenge.hints,
            difficulty: challenge.difficulty.max(1),
            strategy,
            validation_rules,
            success_message: challenge.success_message,
            failure_message: challenge.failure_message,
        })
    }
}

impl From<domain::Strategy> for models::Strategy {
    fn from(strategy: domain::Strategy) -> Self {
        match strategy {
            domain::Strategy::ExactMatch => models::Strategy::ExactMatch,
            domain::Strategy::OutputMatch => models::Strategy::OutputMatch,
            domain::Strategy::PatternMatch => models::Strategy::PatternMatch,
            domain::Strategy::AstCheck => models::Strategy::AstCheck,
        }
    }
}

impl From<domain::Termination> for models::Termination {
    fn from(termination: domain::Termination) -> Self {
        match termination {
            domain::Termination::Completed => models::Termination::Completed,
            domain::Termination::TimedOut => models::Termination::TimedOut,
            domain::Termination::RuntimeError => models::Termination::RuntimeError,
            domain::Termination::OutputTooLarge => models::Termination::OutputTooLarge,
            domain::Termination::Rejected => models::Termination::Rejected,
        }
    }
}

impl From<domain::VerdictCategory> for models::VerdictCategory {
    fn from(category: domain::VerdictCategory) -> Self {
        match category {
            domain::VerdictCategory::Pass => models::VerdictCategory::Pass,
            domain::VerdictCategory::LearnerError => models::VerdictCategory::LearnerError,
            domain::VerdictCategory::Timeout => models::VerdictCategory::Timeout,
            domain::VerdictCategory::InfrastructureError => {
                models::VerdictCategory::InfrastructureError
            }
        }
    }
}

impl From<domain::ExecutionResult> for models::ExecutionResult {
    fn from(result: domain::ExecutionResult) -> Self {
        Self {
            success: result.success,
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: result.duration_ms,
            termination: models::Termination::from(result.termination) as i32,
            exit_code: result.exit_code,
            truncated: result.truncated,
        }
    }
}

impl From<domain::Verdict> for models::Verdict {
    fn from(verdict: domain::Verdict) -> Self {
        Self {
            passed: verdict.passed,
            category: models::VerdictCategory::from(verdict.category) as i32,
            feedback: verdict.feedback,
            strategy: models::Strategy::from(verdict.strategy) as i32,
            hint: verdict.hint,
        }
    }
}

impl From<domain::Submission> for models::Submission {
    fn from(submission: domain::Submission) -> Self {
        let strategy = submission.challenge.strategy;
        let state = match submission.state {
            domain::SubmissionState::Received => submission::State::Received(Empty {}),
            domain::SubmissionState::Accepted => submission::State::Accepted(Empty {}),
            domain::SubmissionState::Executing => submission::State::Executing(Empty {}),
            domain::SubmissionState::Executed(result) => {
                submission::State::Executed(result.into())
            }
            domain::SubmissionState::Validating => submission::State::Validating(Empty {}),
            domain::SubmissionState::Reported { verdict, execution } => {
                submission::State::Reported(models::Reported {
                    verdict: Some(verdict.into()),
                    execution: execution.map(Into::into),
                })
            }
            // Operators find the detail in the logs; clients only get the generic verdict.
            domain::SubmissionState::InfrastructureError { .. } => {
                submission::State::InfrastructureError(models::InfrastructureError {
                    verdict: Some(domain::Verdict::infrastructure_error(strategy).into()),
                })
            }
            domain::SubmissionState::Cancelled => submission::State::Cancelled(Empty {}),
        };

        Self {
            id: submission.id.to_string(),
            created_at: Some(models::chrono_to_prost(submission.created_at)),
            updated_at: Some(models::chrono_to_prost(submission.updated_at)),
            challenge_id: submission.challenge.id.clone(),
            state: Some(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::constants::INFRASTRUCTURE_ERROR_FEEDBACK;

    fn grpc_challenge() -> models::Challenge {
        models::Challenge {
            id: "hello".to_string(),
            prompt: "Say hello".to_string(),
            solution: "print('hello')".to_string(),
            hints: vec!["print it".to_string()],
            difficulty: 0,
            strategy: models::Strategy::OutputMatch as i32,
            validation_rules_json: r#"{ "required": ["hello"] }"#.to_string(),
            success_message: Some("Great".to_string()),
            failure_message: None,
        }
    }

    #[test]
    fn test_challenge_conversion() {
        let challenge: domain::Challenge = grpc_challenge().try_into().unwrap();
        assert_eq!(challenge.strategy, domain::Strategy::OutputMatch);
        assert_eq!(challenge.difficulty, 1);
        assert_eq!(challenge.validation_rules["required"][0], "hello");
        assert_eq!(challenge.success_message(), "Great");
    }

    #[test]
    fn test_unspecified_strategy_is_rejected() {
        let mut challenge = grpc_challenge();
        challenge.strategy = models::Strategy::Unspecified as i32;
        let err = domain::Challenge::try_from(challenge).unwrap_err();
        assert!(matches!(err, ConversionError::MissingField { .. }));

        let mut challenge = grpc_challenge();
        challenge.strategy = 42;
        let err = domain::Challenge::try_from(challenge).unwrap_err();
        assert!(matches!(err, ConversionError::InvalidValue { .. }));
    }

    #[test]
    fn test_rules_must_be_json() {
        let mut challenge = grpc_challenge();
        challenge.validation_rules_json = "{ required: hello".to_string();
        let err = domain::Challenge::try_from(challenge).unwrap_err();
        assert!(matches!(err, ConversionError::InvalidValue { ref field, .. } if field == "challenge.validation_rules_json"));
        assert_eq!(Status::from(err).code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn test_infrastructure_detail_never_leaves_the_service() {
        let challenge: domain::Challenge = grpc_challenge().try_into().unwrap();
        let submission = domain::Submission::new(
            "print('hello')",
            Arc::new(challenge),
            domain::ExecutionLimits::default(),
            1,
        )
        .change_state(domain::SubmissionState::InfrastructureError {
            detail: "spawn /usr/bin/python3: permission denied".to_string(),
        });
        let id = submission.id;

        let grpc: models::Submission = submission.into();
        assert_eq!(grpc.id, id.to_string());
        assert_eq!(grpc.challenge_id, "hello");
        let Some(submission::State::InfrastructureError(error)) = grpc.state else {
            panic!("expected an infrastructure error");
        };
        let verdict = error.verdict.unwrap();
        assert_eq!(verdict.feedback, INFRASTRUCTURE_ERROR_FEEDBACK);
        assert_eq!(verdict.category(), models::VerdictCategory::InfrastructureError);
        assert_eq!(verdict.strategy(), models::Strategy::OutputMatch);
    }

    #[test]
    fn test_reported_state_carries_execution() {
        let result = domain::ExecutionResult::new(
            domain::Termination::RuntimeError,
            Some(1),
            String::new(),
            "ZeroDivisionError: division by zero".to_string(),
            false,
            9,
        );
        let verdict = domain::Verdict::fail(
            domain::Strategy::OutputMatch,
            domain::VerdictCategory::LearnerError,
            "Runtime error".to_string(),
            Some("Hint: print it".to_string()),
        );
        let challenge: domain::Challenge = grpc_challenge().try_into().unwrap();
        let submission = domain::Submission::new("x = 1/0", Arc::new(challenge), Default::default(), 1)
            .change_state(domain::SubmissionState::Reported {
                verdict,
                execution: Some(result),
            });

        let grpc: models::Submission = submission.into();
        let Some(submission::State::Reported(reported)) = grpc.state else {
            panic!("expected a reported submission");
        };
        let execution = reported.execution.unwrap();
        assert_eq!(execution.termination(), models::Termination::RuntimeError);
        assert_eq!(execution.exit_code, Some(1));
        assert!(!execution.success);
        assert_eq!(reported.verdict.unwrap().hint.as_deref(), Some("Hint: print it"));
    }
}
