//! Query tokenizer: whitespace separated `[+|-]name:value`, `[+|-]value` and `[+|-]name:` tokens.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operator {
    #[default]
    None,
    Require,
    Negate,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Token {
    pub operator: Operator,
    /// Set when the token carried a `name:` part.
    pub name: Option<String>,
    pub value: String,
}

impl Token {
    pub fn is_negated(&self) -> bool { self.operator == Operator::Negate }

    /// `name:` with nothing after it.
    pub fn is_name_only(&self) -> bool { self.name.is_some() && self.value.is_empty() }

    fn prefix(&self) -> &'static str {
        match self.operator {
            Operator::None => "",
            Operator::Require => "+",
            Operator::Negate => "-",
        }
    }
}

fn quote(value: &str) -> String {
    if value.chars().any(char::is_whitespace) || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(n) => write!(f, "{}{}:{}", self.prefix(), n, quote(&self.value)),
            None => write!(f, "{}{}", self.prefix(), quote(&self.value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    pub tokens: Vec<Token>,
    /// Input ended in whitespace, so the last token is complete.
    pub trailing_space: bool,
}

impl Query {
    pub fn parse(input: &str) -> Self {
        let mut tokens = Vec::new();
        let mut cur: Option<Token> = None;
        let mut in_quotes = false;
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if in_quotes {
                match c {
                    '\\' if chars.peek() == Some(&'"') => {
                        chars.next();
                        cur.get_or_insert_with(Token::default).value.push('"');
                    }
                    '"' => in_quotes = false,
                    _ => cur.get_or_insert_with(Token::default).value.push(c),
                }
                continue;
            }
            if c.is_whitespace() {
                if let Some(t) = cur.take() { tokens.push(t); }
                continue;
            }
            let tok = cur.get_or_insert_with(Token::default);
            match c {
                '"' => in_quotes = true,
                '+' | '-' if tok.operator == Operator::None && tok.name.is_none() && tok.value.is_empty() => {
                    tok.operator = if c == '+' { Operator::Require } else { Operator::Negate };
                }
                ':' if tok.name.is_none() => tok.name = Some(std::mem::take(&mut tok.value)),
                _ => tok.value.push(c),
            }
        }
        if let Some(t) = cur.take() { tokens.push(t); }

        let trailing_space = input.chars().last().map(char::is_whitespace).unwrap_or(false);
        Self { tokens, trailing_space }
    }

    pub fn is_empty(&self) -> bool { self.tokens.is_empty() }

    /// The token being typed, if the input does not end in whitespace.
    pub fn last_token(&self) -> Option<&Token> {
        if self.trailing_space { None } else { self.tokens.last() }
    }

    /// Render with the last token replaced by `token`.
    pub fn replace_last(&self, token: &Token) -> String {
        let mut parts: Vec<String> = self.tokens.iter().map(|t| t.to_string()).collect();
        if self.trailing_space || parts.is_empty() {
            parts.push(token.to_string());
        } else if let Some(last) = parts.last_mut() {
            *last = token.to_string();
        }
        parts.join(" ")
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.tokens.iter().map(|t| t.to_string()).collect();
        f.write_str(&parts.join(" "))
    }
}
