use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::core::analysis::constructs::Construct;
use crate::core::domain::Strategy;

/// Errors in challenge content. They are authoring bugs, never the learner's fault.
#[derive(Debug, thiserror::Error)]
pub enum RulesError {
    #[error("malformed {strategy} rules: {source}")]
    Shape {
        strategy: Strategy,
        #[source]
        source: serde_json::Error,
    },
    #[error("{strategy} rules must list at least one {what}")]
    Empty {
        strategy: Strategy,
        what: &'static str,
    },
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SourcePattern {
    pub regex: Regex,
    pub description: Option<String>,
}

impl SourcePattern {
    /// How the pattern is named in learner feedback.
    pub fn describe(&self) -> String {
        match &self.description {
            Some(description) => description.clone(),
            None => format!("code matching `{}`", self.regex.as_str()),
        }
    }
}

/// Validation rules, typed per strategy.
#[derive(Debug, Clone)]
pub enum Rules {
    ExactMatch {
        expected: String,
    },
    OutputMatch {
        required: Vec<String>,
        ordered: bool,
    },
    PatternMatch {
        required: Vec<SourcePattern>,
        forbidden: Vec<SourcePattern>,
    },
    AstCheck {
        require: Vec<Construct>,
        forbid: Vec<Construct>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExactMatchRaw {
    expected: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputMatchRaw {
    required: Vec<String>,
    #[serde(default)]
    ordered: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PatternRaw {
    Bare(String),
    Described {
        pattern: String,
        description: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PatternMatchRaw {
    patterns: Vec<PatternRaw>,
    #[serde(default)]
    forbidden: Vec<PatternRaw>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AstCheckRaw {
    #[serde(default)]
    require: Vec<Construct>,
    #[serde(default)]
    forbid: Vec<Construct>,
}

impl Rules {
    pub fn parse(strategy: Strategy, raw: &serde_json::Value) -> Result<Self, RulesError> {
        match strategy {
            Strategy::ExactMatch => {
                let ExactMatchRaw { expected } = shape(strategy, raw)?;
                Ok(Rules::ExactMatch { expected })
            }
            Strategy::OutputMatch => {
                let OutputMatchRaw { required, ordered } = shape(strategy, raw)?;
                if required.is_empty() {
                    return Err(RulesError::Empty {
                        strategy,
                        what: "required output",
                    });
                }
                Ok(Rules::OutputMatch { required, ordered })
            }
            Strategy::PatternMatch => {
                let PatternMatchRaw {
                    patterns,
                    forbidden,
                } = shape(strategy, raw)?;
                if patterns.is_empty() {
                    return Err(RulesError::Empty {
                        strategy,
                        what: "pattern",
                    });
                }
                Ok(Rules::PatternMatch {
                    required: compile_all(patterns)?,
                    forbidden: compile_all(forbidden)?,
                })
            }
            Strategy::AstCheck => {
                let AstCheckRaw { require, forbid } = shape(strategy, raw)?;
                if require.is_empty() && forbid.is_empty() {
                    return Err(RulesError::Empty {
                        strategy,
                        what: "construct",
                    });
                }
                Ok(Rules::AstCheck { require, forbid })
            }
        }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Rules::ExactMatch { .. } => Strategy::ExactMatch,
            Rules::OutputMatch { .. } => Strategy::OutputMatch,
            Rules::PatternMatch { .. } => Strategy::PatternMatch,
            Rules::AstCheck { .. } => Strategy::AstCheck,
        }
    }
}

fn shape<T: DeserializeOwned>(strategy: Strategy, raw: &serde_json::Value) -> Result<T, RulesError> {
    T::deserialize(raw).map_err(|source| RulesError::Shape { strategy, source })
}

fn compile_all(patterns: Vec<PatternRaw>) -> Result<Vec<SourcePattern>, RulesError> {
    patterns
        .into_iter()
        .map(|raw| {
            let (pattern, description) = match raw {
                PatternRaw::Bare(pattern) => (pattern, None),
                PatternRaw::Described {
                    pattern,
                    description,
                } => (pattern, description),
            };
            let regex = RegexBuilder::new(&pattern)
                .multi_line(true)
                .build()
                .map_err(|source| RulesError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            Ok(SourcePattern { regex, description })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_exact_match_rules() {
        let rules = Rules::parse(Strategy::ExactMatch, &json!({ "expected": "Hello\n" })).unwrap();
        assert!(matches!(rules, Rules::ExactMatch { expected } if expected == "Hello\n"));

        let err = Rules::parse(Strategy::ExactMatch, &json!({ "expect": "Hello" })).unwrap_err();
        assert!(matches!(err, RulesError::Shape { .. }));
    }

    #[test]
    fn test_output_match_rules() {
        let rules = Rules::parse(
            Strategy::OutputMatch,
            &json!({ "required": ["a", "b"], "ordered": true }),
        )
        .unwrap();
        assert!(matches!(rules, Rules::OutputMatch { ref required, ordered: true } if required.len() == 2));
        assert_eq!(rules.strategy(), Strategy::OutputMatch);

        let err = Rules::parse(Strategy::OutputMatch, &json!({ "required": [] })).unwrap_err();
        assert!(matches!(err, RulesError::Empty { .. }));

        let err = Rules::parse(Strategy::OutputMatch, &json!({ "required": "a" })).unwrap_err();
        assert!(matches!(err, RulesError::Shape { .. }));
    }

    #[test]
    fn test_pattern_match_rules() {
        let rules = Rules::parse(
            Strategy::PatternMatch,
            &json!({
                "patterns": [r"^for\s", { "pattern": r"print\(", "description": "a call to print" }],
                "forbidden": [r"\bwhile\b"]
            }),
        )
        .unwrap();

        let Rules::PatternMatch {
            required,
            forbidden,
        } = rules
        else {
            panic!("expected pattern rules");
        };
        assert_eq!(required.len(), 2);
        assert!(required[0].regex.is_match("x = 1\nfor i in y:\n"));
        assert_eq!(required[1].describe(), "a call to print");
        assert_eq!(forbidden[0].describe(), r"code matching `\bwhile\b`");
    }

    #[test]
    fn test_invalid_pattern_is_an_authoring_error() {
        let err = Rules::parse(Strategy::PatternMatch, &json!({ "patterns": ["(unclosed"] })).unwrap_err();
        assert!(matches!(err, RulesError::Pattern { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn test_ast_check_rules() {
        let rules = Rules::parse(
            Strategy::AstCheck,
            &json!({ "require": ["conditional"], "forbid": ["loop"] }),
        )
        .unwrap();
        assert!(matches!(
            rules,
            Rules::AstCheck { ref require, ref forbid }
                if require == &vec![Construct::Conditional] && forbid == &vec![Construct::Loop]
        ));

        for malformed in [
            json!({}),
            json!({ "require": ["teleport"] }),
            json!({ "require": "loop" }),
            json!(null),
            json!({ "require": ["loop"], "extra": 1 }),
        ] {
            assert!(
                Rules::parse(Strategy::AstCheck, &malformed).is_err(),
                "{} should be rejected",
                malformed
            );
        }
    }
}
