// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Predicate over the named fields of a field group.
//!
//! ```text
//! expr   := term (OR term)*
//! term   := factor (AND factor)*
//! factor := '(' expr ')' | NAME IN v1|v2|... | NAME = v | NAME != v
//! ```
//!
//! Keywords are case insensitive, values may be single quoted.

use crate::{AppError, AppResult};

/// Deepest parenthesis nesting a description may use.
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Or(Vec<FilterExpr>),
    And(Vec<FilterExpr>),
    In { name: String, values: Vec<String> },
    Eq { name: String, value: String },
    NotEq { name: String, value: String },
}

impl FilterExpr {
    pub fn parse(desc: &str) -> AppResult<FilterExpr> {
        let tokens = tokenize(desc)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if let Some(token) = parser.peek() {
            return Err(parse_error(desc, &format!("unexpected {:?}", token)));
        }
        Ok(expr)
    }

    /// `lookup` returns the value of a field, `None` when the payload lacks it.
    pub fn evaluate<'a>(&self, lookup: &impl Fn(&str) -> Option<&'a [u8]>) -> bool {
        match self {
            FilterExpr::Or(exprs) => exprs.iter().any(|expr| expr.evaluate(lookup)),
            FilterExpr::And(exprs) => exprs.iter().all(|expr| expr.evaluate(lookup)),
            FilterExpr::In { name, values } => lookup(name)
                .map(|found| values.iter().any(|value| value.as_bytes() == found))
                .unwrap_or(false),
            FilterExpr::Eq { name, value } => lookup(name) == Some(value.as_bytes()),
            FilterExpr::NotEq { name, value } => lookup(name) != Some(value.as_bytes()),
        }
    }
}

fn parse_error(desc: &str, reason: &str) -> AppError {
    AppError::InitFieldFilterFailed(format!("{}: {}", desc, reason))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Equal,
    NotEqual,
    Word(String),
    Quoted(String),
}

fn tokenize(desc: &str) -> AppResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = desc.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            '=' => tokens.push(Token::Equal),
            '!' => match chars.next() {
                Some('=') => tokens.push(Token::NotEqual),
                _ => return Err(parse_error(desc, "'!' must be followed by '='")),
            },
            '\'' => {
                let mut quoted = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => quoted.push(c),
                        None => return Err(parse_error(desc, "unterminated quote")),
                    }
                }
                tokens.push(Token::Quoted(quoted));
            }
            c => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '(' | ')' | '=' | '!' | '\'') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: &str) -> AppError {
        AppError::InitFieldFilterFailed(format!("{} at token {}", reason, self.pos))
    }

    fn keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn expr(&mut self) -> AppResult<FilterExpr> {
        let mut terms = vec![self.term()?];
        while self.keyword("OR") {
            self.pos += 1;
            terms.push(self.term()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            FilterExpr::Or(terms)
        })
    }

    fn term(&mut self) -> AppResult<FilterExpr> {
        let mut factors = vec![self.factor()?];
        while self.keyword("AND") {
            self.pos += 1;
            factors.push(self.factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.remove(0)
        } else {
            FilterExpr::And(factors)
        })
    }

    fn factor(&mut self) -> AppResult<FilterExpr> {
        match self.bump() {
            Some(Token::Open) => {
                if self.depth >= MAX_NESTING {
                    return Err(self.error("nesting too deep"));
                }
                self.depth += 1;
                let expr = self.expr()?;
                self.depth -= 1;
                match self.bump() {
                    Some(Token::Close) => Ok(expr),
                    _ => Err(self.error("missing ')'")),
                }
            }
            Some(Token::Word(name)) => {
                if self.keyword("IN") {
                    self.pos += 1;
                    let values = self.value()?;
                    let values: Vec<String> = values.split('|').map(str::to_string).collect();
                    return Ok(FilterExpr::In { name, values });
                }
                match self.bump() {
                    Some(Token::Equal) => Ok(FilterExpr::Eq {
                        name,
                        value: self.value()?,
                    }),
                    Some(Token::NotEqual) => Ok(FilterExpr::NotEq {
                        name,
                        value: self.value()?,
                    }),
                    _ => Err(self.error("expected IN, '=' or '!='")),
                }
            }
            _ => Err(self.error("expected a field name or '('")),
        }
    }

    fn value(&mut self) -> AppResult<String> {
        match self.bump() {
            Some(Token::Word(value)) | Some(Token::Quoted(value)) => Ok(value),
            _ => Err(self.error("expected a value")),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn nested(depth: usize) -> String {
        format!("{}a = b{}", "(".repeat(depth), ")".repeat(depth))
    }

    #[test]
    fn test_nesting_limit() {
        assert!(FilterExpr::parse(&nested(MAX_NESTING)).is_ok());
        assert!(matches!(
            FilterExpr::parse(&nested(MAX_NESTING + 1)),
            Err(AppError::InitFieldFilterFailed(_))
        ));
    }

    fn lookup<'a>(name: &str) -> Option<&'a [u8]> {
        match name {
            "city" => Some(&b"berlin"[..]),
            "tier" => Some(&b"gold"[..]),
            "note" => Some(&b"two words"[..]),
            _ => None,
        }
    }

    #[rstest]
    #[case("city = berlin", true)]
    #[case("city != berlin", false)]
    #[case("missing != x", true)]
    #[case("missing = x", false)]
    #[case("city IN paris|berlin", true)]
    #[case("city in paris|rome", false)]
    #[case("city = paris OR tier = gold", true)]
    #[case("city = paris or tier = gold and note = 'two words'", true)]
    #[case("(city = paris OR tier = gold) AND note != 'two words'", false)]
    #[case("city=berlin AND tier!=silver", true)]
    fn test_evaluate(#[case] desc: &str, #[case] expected: bool) {
        let expr = FilterExpr::parse(desc).unwrap();
        assert_eq!(expr.evaluate(&lookup), expected, "{}", desc);
    }

    #[rstest]
    #[case("")]
    #[case("city")]
    #[case("city =")]
    #[case("(city = a")]
    #[case("city = a)")]
    #[case("city ! a")]
    #[case("city = 'open")]
    #[case("city = a OR")]
    fn test_parse_errors(#[case] desc: &str) {
        assert!(matches!(
            FilterExpr::parse(desc),
            Err(AppError::InitFieldFilterFailed(_))
        ));
    }
}
