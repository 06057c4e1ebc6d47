//! Gate condition parsing and evaluation.
//!
//! Conditions are small boolean expressions over run metadata and upstream
//! job outcomes:
//!
//! ```text
//! branch == "main"
//! event != "pull_request" && success()
//! failure() || always()
//! ```
//!
//! Grammar (precedence low to high): `||`, `&&`, `!`, atoms. Atoms are
//! parenthesized expressions, the builtins `success()` / `failure()` /
//! `always()`, and `ident ==|!= "literal"` comparisons where `ident` is
//! `branch` or `event`. A job without an `if:` gate uses `success()`.

use thiserror::Error;

use crate::domain::TriggerContext;

/// Errors from parsing or evaluating a condition
#[derive(Debug, Clone, Error)]
pub enum ConditionError {
    #[error("Unexpected character '{0}' in condition")]
    UnexpectedChar(char),

    #[error("Unexpected token '{0}' in condition")]
    UnexpectedToken(String),

    #[error("Unterminated string literal in condition")]
    UnterminatedString,

    #[error("Unknown identifier '{0}' (expected 'branch' or 'event')")]
    UnknownIdent(String),

    #[error("Unknown function '{0}' (expected success, failure, or always)")]
    UnknownFunction(String),

    #[error("Trailing input after condition: '{0}'")]
    TrailingInput(String),
}

/// Upstream outcome summary the evaluator sees for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamOutcome {
    /// Every dependency is admissible (succeeded, or failed with continue-on-error)
    pub all_succeeded: bool,

    /// At least one dependency failed
    pub any_failed: bool,
}

impl UpstreamOutcome {
    /// Outcome for a job with no dependencies
    pub fn empty() -> Self {
        Self {
            all_succeeded: true,
            any_failed: false,
        }
    }
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `success()` — all dependencies admissible (the default gate)
    Success,

    /// `failure()` — at least one dependency failed
    Failure,

    /// `always()` — true regardless of upstream outcome
    Always,

    /// `branch == "..."` / `event == "..."` (negated for `!=`)
    Compare {
        field: Field,
        value: String,
        negated: bool,
    },

    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

/// Run metadata fields addressable from a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Branch,
    Event,
}

impl Condition {
    /// Parse a condition expression
    pub fn parse(input: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(ConditionError::TrailingInput(
                parser.tokens[parser.pos..]
                    .iter()
                    .map(Token::render)
                    .collect::<Vec<_>>()
                    .join(" "),
            ));
        }
        Ok(expr)
    }

    /// The implicit gate used when a job declares no `if:`
    pub fn default_gate() -> Self {
        Self::Success
    }

    /// Evaluate against run metadata and upstream outcomes
    pub fn evaluate(&self, ctx: &TriggerContext, upstream: UpstreamOutcome) -> bool {
        match self {
            Self::Success => upstream.all_succeeded,
            Self::Failure => upstream.any_failed,
            Self::Always => true,
            Self::Compare {
                field,
                value,
                negated,
            } => {
                let actual = match field {
                    Field::Branch => &ctx.branch,
                    Field::Event => &ctx.event,
                };
                (actual == value) != *negated
            }
            Self::Not(inner) => !inner.evaluate(ctx, upstream),
            Self::And(a, b) => a.evaluate(ctx, upstream) && b.evaluate(ctx, upstream),
            Self::Or(a, b) => a.evaluate(ctx, upstream) || b.evaluate(ctx, upstream),
        }
    }

    /// Whether the expression mentions a status function anywhere.
    fn has_status_check(&self) -> bool {
        match self {
            Self::Success | Self::Failure | Self::Always => true,
            Self::Compare { .. } => false,
            Self::Not(inner) => inner.has_status_check(),
            Self::And(a, b) | Self::Or(a, b) => a.has_status_check() || b.has_status_check(),
        }
    }

    /// The gate the scheduler actually evaluates.
    ///
    /// A condition that never consults upstream outcome (e.g. a bare
    /// `branch == "main"`) gets an implicit `success() &&` prefix, so a
    /// failed dependency still skips the job. Conditions that mention
    /// `success()` / `failure()` / `always()` stand as written.
    pub fn into_gate(self) -> Self {
        if self.has_status_check() {
            self
        } else {
            Self::And(Box::new(Self::Success), Box::new(self))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn render(&self) -> String {
        match self {
            Self::Ident(s) => s.clone(),
            Self::Str(s) => format!("\"{}\"", s),
            Self::Eq => "==".to_string(),
            Self::Ne => "!=".to_string(),
            Self::And => "&&".to_string(),
            Self::Or => "||".to_string(),
            Self::Not => "!".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Eq),
                    _ => return Err(ConditionError::UnexpectedChar('=')),
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some('&') => tokens.push(Token::And),
                    _ => return Err(ConditionError::UnexpectedChar('&')),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some('|') => tokens.push(Token::Or),
                    _ => return Err(ConditionError::UnexpectedChar('|')),
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => return Err(ConditionError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ConditionError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, ConditionError> {
        let mut left = self.parse_factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_factor()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Condition, ConditionError> {
        match self.next() {
            Some(Token::Not) => Ok(Condition::Not(Box::new(self.parse_factor()?))),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    other => Err(ConditionError::UnexpectedToken(
                        other.map(|t| t.render()).unwrap_or_else(|| "end".to_string()),
                    )),
                }
            }
            Some(Token::Ident(ident)) => self.parse_atom(ident),
            other => Err(ConditionError::UnexpectedToken(
                other.map(|t| t.render()).unwrap_or_else(|| "end".to_string()),
            )),
        }
    }

    fn parse_atom(&mut self, ident: String) -> Result<Condition, ConditionError> {
        // Builtin call: ident followed by ()
        if self.peek() == Some(&Token::LParen) {
            self.next();
            match self.next() {
                Some(Token::RParen) => {}
                other => {
                    return Err(ConditionError::UnexpectedToken(
                        other.map(|t| t.render()).unwrap_or_else(|| "end".to_string()),
                    ))
                }
            }
            return match ident.as_str() {
                "success" => Ok(Condition::Success),
                "failure" => Ok(Condition::Failure),
                "always" => Ok(Condition::Always),
                _ => Err(ConditionError::UnknownFunction(ident)),
            };
        }

        // Comparison: ident ==/!= "literal"
        let field = match ident.as_str() {
            "branch" => Field::Branch,
            "event" => Field::Event,
            _ => return Err(ConditionError::UnknownIdent(ident)),
        };

        let negated = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            other => {
                return Err(ConditionError::UnexpectedToken(
                    other.map(|t| t.render()).unwrap_or_else(|| "end".to_string()),
                ))
            }
        };

        match self.next() {
            Some(Token::Str(value)) => Ok(Condition::Compare {
                field,
                value,
                negated,
            }),
            other => Err(ConditionError::UnexpectedToken(
                other.map(|t| t.render()).unwrap_or_else(|| "end".to_string()),
            )),
        }
    }
}
