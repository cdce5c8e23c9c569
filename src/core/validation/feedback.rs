use std::sync::OnceLock;

use regex::Regex;

use crate::constants::SOLUTION_FILE_NAME;
use crate::core::domain::{ExecutionResult, Termination, VerdictCategory};

const MAX_QUOTED_CHARS: usize = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PythonErrorKind {
    Syntax,
    Indentation,
    ZeroDivision,
    Name,
    Type,
    Index,
    Key,
    Value,
    Attribute,
    Recursion,
    Memory,
    Eof,
    Other,
}

impl PythonErrorKind {
    fn from_exception(name: &str) -> Self {
        match name {
            "SyntaxError" => Self::Syntax,
            "IndentationError" | "TabError" => Self::Indentation,
            "ZeroDivisionError" => Self::ZeroDivision,
            "NameError" | "UnboundLocalError" => Self::Name,
            "TypeError" => Self::Type,
            "IndexError" => Self::Index,
            "KeyError" => Self::Key,
            "ValueError" => Self::Value,
            "AttributeError" => Self::Attribute,
            "RecursionError" => Self::Recursion,
            "MemoryError" => Self::Memory,
            "EOFError" => Self::Eof,
            _ => Self::Other,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Syntax => "Syntax error",
            Self::Indentation => "Indentation error",
            _ => "Runtime error",
        }
    }

    fn explanation(&self) -> Option<&'static str> {
        let text = match self {
            Self::Syntax => "Check for missing quotes, parentheses or colons.",
            Self::Indentation => "Make sure the lines of each block are indented consistently.",
            Self::ZeroDivision => "You can't divide by zero. Check the value you divide by.",
            Self::Name => {
                "A name is used before it was defined. Check the spelling and make sure you assigned it first."
            }
            Self::Type => "You might be mixing different kinds of values, like numbers and text.",
            Self::Index => "You are reaching for a list position that doesn't exist.",
            Self::Key => "The dictionary has no entry with that key.",
            Self::Value => "A function received a value it can't work with.",
            Self::Attribute => "That value has no attribute or method with this name.",
            Self::Recursion => "A function keeps calling itself without stopping. Check your base case.",
            Self::Memory => "Your program tried to use too much memory.",
            Self::Eof => "Exercises don't provide keyboard input, so `input()` has nothing to read.",
            Self::Other => return None,
        };
        Some(text)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracebackSummary {
    pub kind: PythonErrorKind,
    /// The final `ExceptionName: message` line.
    pub message: String,
    pub line: Option<usize>,
}

fn frame_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"File "([^"]*)", line (\d+)"#).unwrap())
}

pub fn summarize_traceback(stderr: &str) -> Option<TracebackSummary> {
    let message = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty() && !line.starts_with(char::is_whitespace))?
        .trim()
        .to_string();
    if message.starts_with("Traceback") {
        return None;
    }

    let exception = message.split(':').next().unwrap_or_default();
    let exception = exception.rsplit('.').next().unwrap_or(exception);

    let frames: Vec<(String, usize)> = frame_regex()
        .captures_iter(stderr)
        .filter_map(|caps| Some((caps[1].to_string(), caps[2].parse().ok()?)))
        .collect();
    let line = frames
        .iter()
        .rev()
        .find(|(file, _)| file.ends_with(SOLUTION_FILE_NAME))
        .or(frames.last())
        .map(|(_, line)| *line);

    Some(TracebackSummary {
        kind: PythonErrorKind::from_exception(exception),
        message,
        line,
    })
}

/// Learner-facing explanation of a run that did not complete, or `None` if it did.
pub fn execution_failure(result: &ExecutionResult) -> Option<(VerdictCategory, String)> {
    let detail = match result.termination {
        Termination::Completed => return None,
        Termination::TimedOut => {
            return Some((
                VerdictCategory::Timeout,
                "Your solution took too long to run. Check for loops that never end!".to_string(),
            ));
        }
        Termination::OutputTooLarge => {
            "Your program printed far more output than expected, so it was stopped. Check for loops that never end!"
                .to_string()
        }
        Termination::Rejected => result.stderr.trim().to_string(),
        Termination::RuntimeError => runtime_error(result),
    };

    Some((VerdictCategory::LearnerError, detail))
}

fn runtime_error(result: &ExecutionResult) -> String {
    let Some(summary) = summarize_traceback(&result.stderr) else {
        return match result.exit_code {
            Some(code) => format!("Runtime error: your program stopped with exit code {}.", code),
            None => "Runtime error: your program was stopped by the system.".to_string(),
        };
    };

    let mut text = match summary.line {
        Some(line) => format!(
            "{} on line {}: {}",
            summary.kind.title(),
            line,
            clip(&summary.message)
        ),
        None => format!("{}: {}", summary.kind.title(), clip(&summary.message)),
    };
    if let Some(explanation) = summary.kind.explanation() {
        text.push('\n');
        text.push_str(explanation);
    }
    text
}

/// Fills a message template with mismatch detail.
///
/// `{detail}` in the template marks where the detail goes; without it the
/// detail is appended as its own paragraph.
pub fn compose(template: &str, detail: &str) -> String {
    if template.contains("{detail}") {
        return template.replace("{detail}", detail);
    }
    if detail.is_empty() {
        return template.to_string();
    }
    format!("{}\n\n{}", template, detail)
}

pub fn describe_mismatch(expected: &str, actual: &str) -> String {
    let mut text = format!(
        "Expected output:\n{}\nYour output:\n{}",
        quote_block(expected),
        quote_block(actual)
    );

    let expected_lines: Vec<&str> = expected.split('\n').collect();
    let actual_lines: Vec<&str> = actual.split('\n').collect();
    let first_difference = (0..expected_lines.len().max(actual_lines.len()))
        .find(|&i| expected_lines.get(i) != actual_lines.get(i));

    if let Some(i) = first_difference {
        let describe = |line: Option<&&str>| match line {
            Some(line) => format!("{:?}", clip(line)),
            None => "nothing".to_string(),
        };
        text.push_str(&format!(
            "\nFirst difference on line {}: expected {}, got {}.",
            i + 1,
            describe(expected_lines.get(i)),
            describe(actual_lines.get(i)),
        ));
    }
    text
}

fn quote_block(text: &str) -> String {
    if text.is_empty() {
        return "    (nothing)".to_string();
    }
    clip(text)
        .lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn clip(text: &str) -> String {
    match text.char_indices().nth(MAX_QUOTED_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_result(stderr: &str) -> ExecutionResult {
        ExecutionResult::new(
            Termination::RuntimeError,
            Some(1),
            String::new(),
            stderr.to_string(),
            false,
            12,
        )
    }

    #[test]
    fn test_summarize_zero_division() {
        let stderr = "Traceback (most recent call last):\n  File \"solution.py\", line 3, in <module>\n    x = 1/0\n        ~^~\nZeroDivisionError: division by zero\n";
        let summary = summarize_traceback(stderr).unwrap();
        assert_eq!(summary.kind, PythonErrorKind::ZeroDivision);
        assert_eq!(summary.message, "ZeroDivisionError: division by zero");
        assert_eq!(summary.line, Some(3));
    }

    #[test]
    fn test_summarize_prefers_learner_frames() {
        let stderr = "Traceback (most recent call last):\n  File \"solution.py\", line 2, in <module>\n    int('x')\n  File \"/usr/lib/python3.12/something.py\", line 88, in helper\nValueError: invalid literal for int() with base 10: 'x'\n";
        let summary = summarize_traceback(stderr).unwrap();
        assert_eq!(summary.kind, PythonErrorKind::Value);
        assert_eq!(summary.line, Some(2));
    }

    #[test]
    fn test_summarize_syntax_error() {
        let stderr = "  File \"solution.py\", line 1\n    print(\"hi\"\n         ^\nSyntaxError: '(' was never closed\n";
        let summary = summarize_traceback(stderr).unwrap();
        assert_eq!(summary.kind, PythonErrorKind::Syntax);
        assert_eq!(summary.line, Some(1));

        let (category, text) = execution_failure(&runtime_result(stderr)).unwrap();
        assert_eq!(category, VerdictCategory::LearnerError);
        assert!(text.starts_with("Syntax error on line 1: SyntaxError"));
        assert!(text.contains("parentheses"));
    }

    #[test]
    fn test_qualified_exception_names() {
        let summary = summarize_traceback("json.decoder.JSONDecodeError: Expecting value\n").unwrap();
        assert_eq!(summary.kind, PythonErrorKind::Other);
        assert_eq!(summary.line, None);
    }

    #[test]
    fn test_runtime_error_feedback() {
        let stderr = "Traceback (most recent call last):\n  File \"solution.py\", line 1, in <module>\n    x = 1/0\nZeroDivisionError: division by zero\n";
        let (category, text) = execution_failure(&runtime_result(stderr)).unwrap();
        assert_eq!(category, VerdictCategory::LearnerError);
        assert!(text.starts_with("Runtime error on line 1"));
        assert!(text.contains("divide by zero"));
        assert!(!text.contains("Traceback"));
    }

    #[test]
    fn test_runtime_error_without_traceback() {
        let (_, text) = execution_failure(&runtime_result("")).unwrap();
        assert!(text.contains("exit code 1"));
    }

    #[test]
    fn test_timeout_is_its_own_category() {
        let result = ExecutionResult::new(Termination::TimedOut, None, String::new(), String::new(), false, 2000);
        let (category, text) = execution_failure(&result).unwrap();
        assert_eq!(category, VerdictCategory::Timeout);
        assert!(text.contains("took too long"));
    }

    #[test]
    fn test_completed_run_is_not_a_failure() {
        let result = ExecutionResult::new(Termination::Completed, Some(0), "ok\n".to_string(), String::new(), false, 5);
        assert!(execution_failure(&result).is_none());
    }

    #[test]
    fn test_compose() {
        assert_eq!(compose("Nice!", ""), "Nice!");
        assert_eq!(compose("Almost.", "Missing x"), "Almost.\n\nMissing x");
        assert_eq!(compose("Problem: {detail}", "Missing x"), "Problem: Missing x");
    }

    #[test]
    fn test_describe_mismatch_points_at_first_difference() {
        let text = describe_mismatch("1\n2\n3", "1\n2\n4");
        assert!(text.contains("First difference on line 3: expected \"3\", got \"4\""));

        let text = describe_mismatch("a\nb", "a");
        assert!(text.contains("line 2: expected \"b\", got nothing"));

        let text = describe_mismatch("a", "");
        assert!(text.contains("(nothing)"));
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        let long = "é".repeat(MAX_QUOTED_CHARS + 10);
        let clipped = clip(&long);
        assert!(clipped.ends_with("..."));
        assert_eq!(clipped.chars().count(), MAX_QUOTED_CHARS + 3);
    }
}
