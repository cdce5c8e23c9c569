use std::sync::OnceLock;

use regex::Regex;

use crate::core::analysis::lexer::{Token, TokenKind, tokenize};

pub const RESTRICTED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "urllib",
    "requests",
    "http",
    "ftplib",
    "smtplib",
    "sqlite3",
    "pickle",
    "shelve",
    "marshal",
    "importlib",
    "ctypes",
    "multiprocessing",
    "threading",
    "asyncio",
    "concurrent",
    "queue",
    "atexit",
    "signal",
    "gc",
];

pub const RESTRICTED_CALLS: &[&str] = &[
    "open",
    "exec",
    "eval",
    "compile",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "__import__",
    "breakpoint",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("Your program is empty. Write some code before submitting.")]
    Empty,
    #[error("Importing `{module}` (line {line}) is not allowed in exercises.")]
    RestrictedImport { module: String, line: usize },
    #[error("Calling `{name}()` (line {line}) is not allowed in exercises.")]
    RestrictedCall { name: String, line: usize },
    #[error("Using `{name}` (line {line}) is not allowed in exercises.")]
    RestrictedName { name: String, line: usize },
}

/// Pre-execution screening of learner code.
///
/// This keeps honest mistakes (reading files, spawning processes) out of the
/// sandbox. It is not a security boundary: the sandbox limits still apply.
#[derive(Clone, Debug)]
pub struct SourcePolicy {
    modules: Vec<String>,
    calls: Vec<String>,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            modules: RESTRICTED_MODULES.iter().map(|m| m.to_string()).collect(),
            calls: RESTRICTED_CALLS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl SourcePolicy {
    /// A policy that only rejects empty programs.
    pub fn permissive() -> Self {
        Self {
            modules: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub fn check(&self, source: &str) -> Result<(), PolicyViolation> {
        if source.trim().is_empty() {
            return Err(PolicyViolation::Empty);
        }

        let Ok(tokens) = tokenize(source) else {
            return self.check_raw(source);
        };
        if tokens.is_empty() {
            return Err(PolicyViolation::Empty);
        }

        for (idx, token) in tokens.iter().enumerate() {
            let TokenKind::Name(name) = &token.kind else {
                continue;
            };
            let prev = idx.checked_sub(1).map(|i| &tokens[i]);

            match name.as_str() {
                // The `import` of `from a import b` is covered by the `from` arm.
                "import" if starts_statement(prev) => self.check_import(&tokens[idx + 1..])?,
                "from" if starts_statement(prev) => {
                    self.check_module(tokens.get(idx + 1))?;
                }
                "__builtins__" => {
                    return Err(PolicyViolation::RestrictedName {
                        name: name.clone(),
                        line: token.line,
                    });
                }
                name if self.calls.iter().any(|c| c == name) => {
                    let called = tokens.get(idx + 1).is_some_and(|t| t.is_op("("));
                    let is_attribute = prev.is_some_and(|t| t.is_op("."));
                    let is_definition = prev.is_some_and(|t| t.is_name("def"));
                    if called && !is_attribute && !is_definition {
                        return Err(PolicyViolation::RestrictedCall {
                            name: name.to_string(),
                            line: token.line,
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Word level screening for source the lexer can't follow. Anything
    /// that looks restricted is refused, even inside strings; clean source
    /// is left to the interpreter, which reports the syntax error.
    fn check_raw(&self, source: &str) -> Result<(), PolicyViolation> {
        let source = source.replace("\r\n", "\n").replace('\r', "\n");
        for (idx, line) in source.lines().enumerate() {
            let line_no = idx + 1;
            for statement in line.split(';') {
                let words = word_regex().find_iter(statement).collect::<Vec<_>>();
                let imports = words
                    .iter()
                    .any(|w| matches!(w.as_str(), "import" | "from"));

                for (pos, word) in words.iter().enumerate() {
                    let name = word.as_str();
                    if name == "__builtins__" {
                        return Err(PolicyViolation::RestrictedName {
                            name: name.to_string(),
                            line: line_no,
                        });
                    }
                    if imports && self.modules.iter().any(|m| m == name) {
                        return Err(PolicyViolation::RestrictedImport {
                            module: name.to_string(),
                            line: line_no,
                        });
                    }

                    let called = statement[word.end()..].trim_start().starts_with('(');
                    let is_attribute = statement[..word.start()].trim_end().ends_with('.');
                    let is_definition = pos > 0 && words[pos - 1].as_str() == "def";
                    if called
                        && !is_attribute
                        && !is_definition
                        && self.calls.iter().any(|c| c == name)
                    {
                        return Err(PolicyViolation::RestrictedCall {
                            name: name.to_string(),
                            line: line_no,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks `import a.b as c, d` up to the end of the statement.
    fn check_import(&self, rest: &[Token]) -> Result<(), PolicyViolation> {
        let mut expect_module = true;
        for token in rest {
            match &token.kind {
                TokenKind::Newline | TokenKind::Op(";") => break,
                TokenKind::Op(",") => expect_module = true,
                TokenKind::Name(_) if expect_module => {
                    self.check_module(Some(token))?;
                    expect_module = false;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_module(&self, token: Option<&Token>) -> Result<(), PolicyViolation> {
        let Some(Token {
            kind: TokenKind::Name(module),
            line,
        }) = token
        else {
            return Ok(());
        };

        if self.modules.iter().any(|m| m == module) {
            return Err(PolicyViolation::RestrictedImport {
                module: module.clone(),
                line: *line,
            });
        }
        Ok(())
    }
}

fn word_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap())
}

// `from` also appears in `raise ... from ...` and `yield from`.
fn starts_statement(prev: Option<&Token>) -> bool {
    match prev {
        None => true,
        Some(token) => {
            token.kind == TokenKind::Newline || token.is_op(";") || token.is_op(":")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(source: &str) -> Result<(), PolicyViolation> {
        SourcePolicy::default().check(source)
    }

    #[test]
    fn test_plain_programs_are_allowed() {
        assert!(check("print('Hello, World!')\n").is_ok());
        assert!(check("import math\nfrom collections import Counter\nprint(math.pi)\n").is_ok());
        assert!(check("import random as r, string\n").is_ok());
    }

    #[test]
    fn test_empty_programs_are_rejected() {
        assert_eq!(check(""), Err(PolicyViolation::Empty));
        assert_eq!(check("   \n\t\n"), Err(PolicyViolation::Empty));
        assert_eq!(check("# just a comment\n"), Err(PolicyViolation::Empty));
    }

    #[test]
    fn test_restricted_imports() {
        assert_eq!(
            check("x = 1\nimport os\n"),
            Err(PolicyViolation::RestrictedImport {
                module: "os".to_string(),
                line: 2
            })
        );
        assert!(matches!(
            check("import math, subprocess\n"),
            Err(PolicyViolation::RestrictedImport { module, .. }) if module == "subprocess"
        ));
        assert!(matches!(
            check("import os.path as p\n"),
            Err(PolicyViolation::RestrictedImport { module, .. }) if module == "os"
        ));
        assert!(matches!(
            check("from urllib.request import urlopen\n"),
            Err(PolicyViolation::RestrictedImport { module, .. }) if module == "urllib"
        ));
        assert!(matches!(
            check("if True: from socket import socket\n"),
            Err(PolicyViolation::RestrictedImport { module, .. }) if module == "socket"
        ));
    }

    #[test]
    fn test_restricted_module_names_elsewhere_are_fine() {
        assert!(check("os = 'linux'\nprint(os)\n").is_ok());
        assert!(check("import mathsys\n").is_ok());
        assert!(check("try:\n    pass\nexcept ValueError as e:\n    raise KeyError() from e\n").is_ok());
    }

    #[test]
    fn test_restricted_calls() {
        assert_eq!(
            check("data = open('secret.txt').read()\n"),
            Err(PolicyViolation::RestrictedCall {
                name: "open".to_string(),
                line: 1
            })
        );
        assert!(matches!(
            check("eval ('1 + 1')\n"),
            Err(PolicyViolation::RestrictedCall { name, .. }) if name == "eval"
        ));
    }

    #[test]
    fn test_methods_sharing_restricted_names_are_allowed() {
        assert!(check("import re\npattern = re.compile('a+')\n").is_ok());
        assert!(check("class Door:\n    def open(self):\n        return True\n").is_ok());
        assert!(check("print('open(file)')  # eval(x)\n").is_ok());
    }

    #[test]
    fn test_builtins_reference_is_rejected() {
        assert!(matches!(
            check("b = __builtins__\n"),
            Err(PolicyViolation::RestrictedName { name, line: 1 }) if name == "__builtins__"
        ));
    }

    #[test]
    fn test_untokenizable_source_is_left_to_the_interpreter() {
        assert!(check("print('unterminated)\n").is_ok());
        assert!(check("name = 'Ada\nprint(name)\n").is_ok());
    }

    #[test]
    fn test_untokenizable_source_still_refuses_restricted_names() {
        assert!(matches!(
            check("x = 'oops\nimport math, subprocess\n"),
            Err(PolicyViolation::RestrictedImport { module, line: 2 }) if module == "subprocess"
        ));
        assert!(matches!(
            check("x = 'oops\ndata = open('f').read()\n"),
            Err(PolicyViolation::RestrictedCall { name, line: 2 }) if name == "open"
        ));
        assert!(matches!(
            check("x = 'oops\r\nb = __builtins__\r\n"),
            Err(PolicyViolation::RestrictedName { line: 2, .. })
        ));
        assert!(check("x = 'oops\nfile.open()\n").is_ok());
    }

    #[test]
    fn test_windows_line_continuation_in_string() {
        assert!(matches!(
            check("x = 'a\\\r\nb'\r\nimport subprocess\r\nprint(x)\r\n"),
            Err(PolicyViolation::RestrictedImport { module, line: 3 }) if module == "subprocess"
        ));
    }

    #[test]
    fn test_permissive_policy() {
        let policy = SourcePolicy::permissive();
        assert!(policy.check("import os\nopen('x')\n").is_ok());
        assert_eq!(policy.check(""), Err(PolicyViolation::Empty));
    }
}
