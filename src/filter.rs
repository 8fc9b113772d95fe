//! Parameter classification.
//!
//! A [`Filter`] is a closed boolean expression over the tag record every slot
//! carries (role, frozen bit, user tags, path). Filters compose with `&`, `|`
//! and `!`:
//! ```text
//! node & !frozen            relaxable node state (X)
//! weight                    layer parameters (W)
//! role:node & tag:cache     cached predictions
//! ```
//! A filter matching nothing is valid and yields an empty selection.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::str::FromStr;

use crate::core::{PcError, PcResult, ParamKey, ParamStore, Role, Slot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    Nothing,
    Role(Role),
    Frozen(bool),
    Tag(String),
    /// Exact path, or any path below it (`nodes.0` matches `nodes.0.x`).
    Path(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn nothing() -> Self {
        Filter::Nothing
    }

    pub fn role(role: Role) -> Self {
        Filter::Role(role)
    }

    /// Shorthand for `role(NodeState)`.
    pub fn node() -> Self {
        Filter::Role(Role::NodeState)
    }

    /// Shorthand for `role(LayerWeight)`.
    pub fn weight() -> Self {
        Filter::Role(Role::LayerWeight)
    }

    pub fn frozen(frozen: bool) -> Self {
        Filter::Frozen(frozen)
    }

    pub fn tag(name: impl Into<String>) -> Self {
        Filter::Tag(name.into())
    }

    pub fn path(prefix: impl Into<String>) -> Self {
        Filter::Path(prefix.into())
    }

    /// Evaluate against one slot.
    ///
    /// # Errors
    /// `Classification` if a tag predicate is empty or contains whitespace.
    pub fn matches(&self, slot: &Slot) -> PcResult<bool> {
        Ok(match self {
            Filter::All => true,
            Filter::Nothing => false,
            Filter::Role(role) => slot.role() == *role,
            Filter::Frozen(frozen) => slot.frozen() == *frozen,
            Filter::Tag(name) => {
                validate_name("tag", name)?;
                slot.has_tag(name)
            }
            Filter::Path(prefix) => {
                validate_name("path", prefix)?;
                let path = slot.key().path();
                path == prefix
                    || (path.starts_with(prefix.as_str())
                        && path[prefix.len()..].starts_with('.'))
            }
            Filter::And(a, b) => a.matches(slot)? && b.matches(slot)?,
            Filter::Or(a, b) => a.matches(slot)? || b.matches(slot)?,
            Filter::Not(a) => !a.matches(slot)?,
        })
    }

    /// Keys of every slot the filter selects, in registration order.
    pub fn select(&self, store: &ParamStore) -> PcResult<Vec<ParamKey>> {
        let mut keys = Vec::new();
        for slot in store.slots() {
            if self.matches(slot)? {
                keys.push(slot.key().clone());
            }
        }
        Ok(keys)
    }

    /// Parse the textual syntax.
    ///
    /// Grammar (loosest binding first):
    /// ```text
    /// expr := term ('|' term)*
    /// term := factor ('&' factor)*
    /// factor := '!' factor | '(' expr ')' | atom
    /// atom := all | none | frozen | trainable | node | weight | static
    ///       | role:NAME | tag:NAME | path:PREFIX
    /// ```
    pub fn parse(text: &str) -> PcResult<Self> {
        let mut parser = Parser {
            tokens: tokenize(text)?,
            pos: 0,
        };
        let expr = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(PcError::Classification(format!(
                "unexpected `{tok}` in filter `{text}`"
            )));
        }
        Ok(expr)
    }
}

fn validate_name(kind: &str, name: &str) -> PcResult<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(PcError::Classification(format!(
            "malformed {kind} predicate `{name}`"
        )));
    }
    Ok(())
}

impl BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(rhs))
    }
}

impl BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(rhs))
    }
}

impl Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }
}

impl FromStr for Filter {
    type Err = PcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => f.write_str("all"),
            Filter::Nothing => f.write_str("none"),
            Filter::Role(role) => write!(f, "role:{}", role.name()),
            Filter::Frozen(true) => f.write_str("frozen"),
            Filter::Frozen(false) => f.write_str("trainable"),
            Filter::Tag(name) => write!(f, "tag:{name}"),
            Filter::Path(prefix) => write!(f, "path:{prefix}"),
            Filter::And(a, b) => write!(f, "({a} & {b})"),
            Filter::Or(a, b) => write!(f, "({a} | {b})"),
            Filter::Not(a) => write!(f, "!{a}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Open,
    Close,
    Word(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::And => f.write_str("&"),
            Token::Or => f.write_str("|"),
            Token::Not => f.write_str("!"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
            Token::Word(w) => f.write_str(w),
        }
    }
}

fn tokenize(text: &str) -> PcResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-') => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-') {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(word));
            }
            other => {
                return Err(PcError::Classification(format!(
                    "unexpected character `{other}` in filter `{text}`"
                )))
            }
        }
    }
    if tokens.is_empty() {
        return Err(PcError::Classification("empty filter expression".to_string()));
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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expr(&mut self) -> PcResult<Filter> {
        let mut lhs = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = lhs | self.term()?;
        }
        Ok(lhs)
    }

    fn term(&mut self) -> PcResult<Filter> {
        let mut lhs = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = lhs & self.factor()?;
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> PcResult<Filter> {
        match self.next() {
            Some(Token::Not) => Ok(!self.factor()?),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(PcError::Classification("unbalanced `(`".to_string())),
                }
            }
            Some(Token::Word(word)) => atom(&word),
            Some(tok) => Err(PcError::Classification(format!(
                "expected a predicate, found `{tok}`"
            ))),
            None => Err(PcError::Classification(
                "filter expression ends early".to_string(),
            )),
        }
    }
}

fn atom(word: &str) -> PcResult<Filter> {
    if let Some((kind, arg)) = word.split_once(':') {
        validate_name(kind, arg)?;
        return match kind {
            "role" => Role::from_name(arg)
                .map(Filter::Role)
                .ok_or_else(|| PcError::Classification(format!("unknown role `{arg}`"))),
            "tag" => Ok(Filter::Tag(arg.to_string())),
            "path" => Ok(Filter::Path(arg.to_string())),
            _ => Err(PcError::Classification(format!(
                "unknown predicate kind `{kind}`"
            ))),
        };
    }
    match word {
        "all" => Ok(Filter::All),
        "none" => Ok(Filter::Nothing),
        "frozen" => Ok(Filter::Frozen(true)),
        "trainable" => Ok(Filter::Frozen(false)),
        "node" => Ok(Filter::node()),
        "weight" => Ok(Filter::weight()),
        "static" => Ok(Filter::Role(Role::Static)),
        other => Err(PcError::Classification(format!(
            "unknown predicate `{other}`"
        ))),
    }
}
