use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::analysis::lexer::{LexError, Token, TokenKind, is_keyword, tokenize};

/// A language construct an `ast_check` rule can require or forbid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Construct {
    /// Either kind of loop.
    Loop,
    ForLoop,
    WhileLoop,
    /// `if`/`elif` statements and conditional expressions.
    Conditional,
    FunctionDef,
    ClassDef,
    Lambda,
    Return,
    Import,
    Comprehension,
    Assignment,
    FString,
    TryExcept,
    With,
    /// A call to a function or method with the given name.
    Call(String),
}

impl fmt::Display for Construct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Construct::Loop => f.write_str("a loop (`for` or `while`)"),
            Construct::ForLoop => f.write_str("a `for` loop"),
            Construct::WhileLoop => f.write_str("a `while` loop"),
            Construct::Conditional => f.write_str("a conditional (`if`)"),
            Construct::FunctionDef => f.write_str("a function definition (`def`)"),
            Construct::ClassDef => f.write_str("a class definition (`class`)"),
            Construct::Lambda => f.write_str("a `lambda` expression"),
            Construct::Return => f.write_str("a `return` statement"),
            Construct::Import => f.write_str("an `import`"),
            Construct::Comprehension => f.write_str("a comprehension"),
            Construct::Assignment => f.write_str("a variable assignment"),
            Construct::FString => f.write_str("an f-string"),
            Construct::TryExcept => f.write_str("a `try`/`except` block"),
            Construct::With => f.write_str("a `with` block"),
            Construct::Call(name) => write!(f, "a call to `{}()`", name),
        }
    }
}

/// The set of constructs found in a piece of source code.
#[derive(Clone, Debug, Default)]
pub struct SourceStructure {
    found: HashSet<Construct>,
}

impl SourceStructure {
    pub fn contains(&self, construct: &Construct) -> bool {
        match construct {
            Construct::Loop => {
                self.found.contains(&Construct::ForLoop) || self.found.contains(&Construct::WhileLoop)
            }
            other => self.found.contains(other),
        }
    }
}

pub fn scan(source: &str) -> Result<SourceStructure, LexError> {
    let tokens = tokenize(source)?;
    Ok(scan_tokens(&tokens))
}

fn scan_tokens(tokens: &[Token]) -> SourceStructure {
    let mut found = HashSet::new();
    // One entry per open bracket: whether a `for` clause was seen inside it.
    let mut frames: Vec<bool> = Vec::new();

    for (idx, token) in tokens.iter().enumerate() {
        match &token.kind {
            TokenKind::Op("(" | "[" | "{") => frames.push(false),
            TokenKind::Op(")" | "]" | "}") => {
                frames.pop();
            }
            TokenKind::Op(
                "=" | "+=" | "-=" | "*=" | "/=" | "//=" | "%=" | "**=" | "&=" | "|=" | "^="
                | ">>=" | "<<=" | "@=",
            ) if frames.is_empty() => {
                found.insert(Construct::Assignment);
            }
            TokenKind::Str { formatted: true } => {
                found.insert(Construct::FString);
            }
            TokenKind::Name(name) => match name.as_str() {
                "for" => match frames.last_mut() {
                    Some(saw_for) => {
                        *saw_for = true;
                        found.insert(Construct::Comprehension);
                    }
                    None => {
                        found.insert(Construct::ForLoop);
                    }
                },
                "while" => {
                    found.insert(Construct::WhileLoop);
                }
                // An `if` after a `for` clause in the same brackets filters a comprehension.
                "if" | "elif" if frames.last() != Some(&true) => {
                    found.insert(Construct::Conditional);
                }
                "def" => {
                    found.insert(Construct::FunctionDef);
                }
                "class" => {
                    found.insert(Construct::ClassDef);
                }
                "lambda" => {
                    found.insert(Construct::Lambda);
                }
                "return" => {
                    found.insert(Construct::Return);
                }
                "import" => {
                    found.insert(Construct::Import);
                }
                "try" | "except" => {
                    found.insert(Construct::TryExcept);
                }
                "with" => {
                    found.insert(Construct::With);
                }
                name if !is_keyword(name) && is_call(tokens, idx) => {
                    found.insert(Construct::Call(name.to_string()));
                }
                _ => {}
            },
            _ => {}
        }
    }

    SourceStructure { found }
}

/// A name followed by `(` is a call unless it is being defined.
fn is_call(tokens: &[Token], idx: usize) -> bool {
    let opens_call = tokens.get(idx + 1).is_some_and(|next| next.is_op("("));
    let defined = idx > 0 && (tokens[idx - 1].is_name("def") || tokens[idx - 1].is_name("class"));
    opens_call && !defined
}
