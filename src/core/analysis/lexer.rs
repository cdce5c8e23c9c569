//! A small Python tokenizer.
//!
//! It understands just enough of the lexical grammar to tell code apart from
//! strings and comments, track bracket nesting and logical lines. It does not
//! validate the program; syntax errors are left to the interpreter.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Name(String),
    Number,
    Str { formatted: bool },
    Op(&'static str),
    /// End of a logical line (only emitted outside of brackets).
    Newline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl Token {
    pub fn is_name(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Name(n) if n == name)
    }

    pub fn is_op(&self, op: &str) -> bool {
        matches!(self.kind, TokenKind::Op(o) if o == op)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LexError {
    #[error("unterminated string starting on line {line}")]
    UnterminatedString { line: usize },
}

pub const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

// Longest operators first so that prefix matching picks the right one.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", ">>", "<<", "<=", ">=", "==",
    "!=", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=", "!",
];

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        // The interpreter reads source with universal newlines.
        let source = source.replace("\r\n", "\n").replace('\r', "\n");
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind, line: usize) {
        self.tokens.push(Token { kind, line });
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        while let Some(c) = self.peek(0) {
            match c {
                '\\' if matches!(self.peek(1), Some('\n')) => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\n' => {
                    self.end_line();
                    self.pos += 1;
                    self.line += 1;
                }
                '#' => {
                    while !matches!(self.peek(0), None | Some('\n')) {
                        self.pos += 1;
                    }
                }
                c if c.is_whitespace() => self.pos += 1,
                '\'' | '"' => self.string(false)?,
                c if c.is_ascii_digit() => self.number(),
                '.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number(),
                c if c == '_' || c.is_alphabetic() => self.name()?,
                _ => self.operator(),
            }
        }
        self.end_line();

        Ok(self.tokens)
    }

    fn end_line(&mut self) {
        let at_line_start = matches!(
            self.tokens.last(),
            None | Some(Token {
                kind: TokenKind::Newline,
                ..
            })
        );
        if self.depth == 0 && !at_line_start {
            self.push(TokenKind::Newline, self.line);
        }
    }

    fn name(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c == '_' || c.is_alphanumeric())
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        let quoted = matches!(self.peek(0), Some('\'' | '"'));
        if quoted && STRING_PREFIXES.contains(&name.to_ascii_lowercase().as_str()) {
            return self.string(name.to_ascii_lowercase().contains('f'));
        }

        self.push(TokenKind::Name(name), self.line);
        Ok(())
    }

    fn number(&mut self) {
        while self
            .peek(0)
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            self.pos += 1;
        }
        self.push(TokenKind::Number, self.line);
    }

    fn string(&mut self, formatted: bool) -> Result<(), LexError> {
        let start_line = self.line;
        let Some(quote) = self.peek(0) else {
            return Err(LexError::UnterminatedString { line: start_line });
        };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        loop {
            match self.peek(0) {
                None => return Err(LexError::UnterminatedString { line: start_line }),
                Some('\\') => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                Some('\n') if !triple => {
                    return Err(LexError::UnterminatedString { line: start_line });
                }
                Some('\n') => {
                    self.line += 1;
                    self.pos += 1;
                }
                Some(c) if c == quote => {
                    if !triple {
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                    self.pos += 1;
                }
                Some(_) => self.pos += 1,
            }
        }

        self.push(TokenKind::Str { formatted }, start_line);
        Ok(())
    }

    fn operator(&mut self) {
        let rest: String = self.chars[self.pos..].iter().take(3).collect();
        let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
            // Characters Python itself would reject; the interpreter reports them.
            self.pos += 1;
            return;
        };

        match *op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.pos += op.chars().count();
        self.push(TokenKind::Op(op), self.line);
    }
}
