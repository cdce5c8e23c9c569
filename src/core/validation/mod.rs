pub mod feedback;
pub mod rules;

use itertools::Itertools;

use crate::core::analysis::constructs;
use crate::core::domain::{
    Challenge, ExecutionResult, Strategy, Termination, Verdict, VerdictCategory,
};
use crate::core::validation::feedback::{compose, describe_mismatch, execution_failure};
use crate::core::validation::rules::Rules;

/// Judges an executed submission.
///
/// Output strategies require a successful run. Source strategies accept any
/// run that did not crash or time out, so the learner is never told their
/// code is correct when it does not run.
#[tracing::instrument(skip_all, fields(strategy = %rules.strategy()))]
pub fn validate(
    source: &str,
    result: &ExecutionResult,
    challenge: &Challenge,
    rules: &Rules,
    attempt: u32,
) -> Verdict {
    let strategy = rules.strategy();
    let ran = match strategy {
        Strategy::ExactMatch | Strategy::OutputMatch => result.success,
        Strategy::PatternMatch | Strategy::AstCheck => matches!(
            result.termination,
            Termination::Completed | Termination::OutputTooLarge
        ),
    };

    if !ran {
        if let Some((category, detail)) = execution_failure(result) {
            tracing::debug!("Execution failed: {:?}", result.termination);
            return fail(challenge, strategy, category, &detail, attempt);
        }
    }

    let mismatch = match rules {
        Rules::ExactMatch { expected } => check_exact(expected, &result.stdout),
        Rules::OutputMatch { required, ordered } => {
            check_output(required, *ordered, &normalize_newlines(&result.stdout))
        }
        Rules::PatternMatch {
            required,
            forbidden,
        } => {
            let missing = required
                .iter()
                .filter(|p| !p.regex.is_match(source))
                .map(|p| p.describe());
            let present = forbidden
                .iter()
                .filter(|p| p.regex.is_match(source))
                .map(|p| p.describe());
            structure_mismatch(missing.collect(), present.collect())
        }
        Rules::AstCheck { require, forbid } => match constructs::scan(source) {
            Ok(structure) => {
                let missing = require.iter().filter(|c| !structure.contains(c));
                let present = forbid.iter().filter(|c| structure.contains(c));
                structure_mismatch(
                    missing.map(ToString::to_string).collect(),
                    present.map(ToString::to_string).collect(),
                )
            }
            // The program already ran, so the interpreter accepted it and
            // the scanner is at fault.
            Err(e) => {
                tracing::error!("Structure scan failed on code that ran: {}", e);
                return Verdict::infrastructure_error(strategy);
            }
        },
    };

    match mismatch {
        None => Verdict::pass(strategy, compose(challenge.success_message(), "")),
        Some(detail) => {
            tracing::debug!("Validation failed: {}", detail);
            fail(challenge, strategy, VerdictCategory::LearnerError, &detail, attempt)
        }
    }
}

fn fail(
    challenge: &Challenge,
    strategy: Strategy,
    category: VerdictCategory,
    detail: &str,
    attempt: u32,
) -> Verdict {
    Verdict::fail(
        strategy,
        category,
        compose(challenge.failure_message(), detail),
        Some(challenge.hint(attempt)),
    )
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Normal form for exact comparison: `\r\n` becomes `\n` and at most one
/// trailing newline is dropped. Other whitespace is significant.
pub fn normalize_exact(text: &str) -> String {
    let mut text = normalize_newlines(text);
    if text.ends_with('\n') {
        text.pop();
    }
    text
}

fn check_exact(expected: &str, stdout: &str) -> Option<String> {
    let expected = normalize_exact(expected);
    let actual = normalize_exact(stdout);
    if expected == actual {
        return None;
    }
    Some(describe_mismatch(&expected, &actual))
}

fn check_output(required: &[String], ordered: bool, stdout: &str) -> Option<String> {
    if !ordered {
        let missing = required
            .iter()
            .filter(|r| !stdout.contains(r.as_str()))
            .map(|r| format!("{:?}", r))
            .join(", ");
        if missing.is_empty() {
            return None;
        }
        return Some(format!("Your output is missing: {}.", missing));
    }

    let mut cursor = 0;
    for (idx, part) in required.iter().enumerate() {
        match stdout[cursor..].find(part.as_str()) {
            Some(pos) => cursor += pos + part.len(),
            None if idx == 0 || !stdout.contains(part.as_str()) => {
                return Some(format!("Your output is missing: {:?}.", part));
            }
            None => {
                return Some(format!(
                    "Your output should show {:?} after {:?}.",
                    part,
                    required[idx - 1]
                ));
            }
        }
    }
    None
}

fn structure_mismatch(missing: Vec<String>, present: Vec<String>) -> Option<String> {
    let mut lines = Vec::new();
    if !missing.is_empty() {
        lines.push(format!("Your code should use {}.", missing.join(", ")));
    }
    if !present.is_empty() {
        lines.push(format!("Your code should not use {}.", present.join(", ")));
    }
    if lines.is_empty() {
        return None;
    }
    Some(lines.join("\n"))
}
