//! Content-Disposition tokenizer.
//!
//! The value is lexed into quoted strings, `;`, `=` and bare tokens, which a
//! two state parser (awaiting key, awaiting value) folds into parameters.
//! A parameter committed more than once becomes a list, which is how repeated
//! `category=` entries are carried.

use std::collections::BTreeMap;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token<'a> {
    Quoted(String),
    Semi,
    Equals,
    Bare(&'a str),
}

/// `inline` or `attachment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartType {
    Inline,
    Attachment,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Single(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn first(&self) -> &str {
        match self {
            ParamValue::Single(s) => s,
            ParamValue::List(l) => l.first().map(String::as_str).unwrap_or_default(),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice = match self {
            ParamValue::Single(s) => std::slice::from_ref(s),
            ParamValue::List(l) => l.as_slice(),
        };
        slice.iter().map(String::as_str)
    }

    fn push(&mut self, value: String) {
        match self {
            ParamValue::Single(prev) => {
                let prev = std::mem::take(prev);
                *self = ParamValue::List(vec![prev, value]);
            }
            ParamValue::List(l) => l.push(value),
        }
    }
}

/// A parsed disposition. `filename` is already renamed to `uri`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Disposition {
    pub part_type: Option<PartType>,
    pub params: BTreeMap<String, ParamValue>,
}

impl Disposition {
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn uri(&self) -> Option<&str> {
        self.get("uri").map(ParamValue::first)
    }

    pub fn categories(&self) -> Vec<String> {
        self.get("category")
            .map(|v| v.values().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            ';' => tokens.push(Token::Semi),
            '=' => tokens.push(Token::Equals),
            '"' => {
                let mut s = String::new();
                let mut closed = false;

                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => s.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => s.push(c),
                    }
                }

                if !closed {
                    return Err(Error::malformed(format!(
                        "unterminated quoted string in disposition: {:?}",
                        input
                    )));
                }
                tokens.push(Token::Quoted(s));
            }
            c if c.is_whitespace() => {}
            _ => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, c)) = chars.peek() {
                    if c == ';' || c == '=' || c == '"' || c.is_whitespace() {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                tokens.push(Token::Bare(&input[start..end]));
            }
        }
    }

    Ok(tokens)
}

enum State {
    AwaitingKey,
    AwaitingValue(String),
}

pub fn parse(value: &str) -> Result<Disposition> {
    let mut tokens = tokenize(value)?;
    if tokens.last() != Some(&Token::Semi) {
        tokens.push(Token::Semi);
    }

    let mut disposition = Disposition::default();
    let mut state = State::AwaitingKey;
    let mut key: Option<String> = None;
    let mut val: Option<String> = None;

    for token in tokens {
        state = match (state, token) {
            (State::AwaitingKey, Token::Bare(k)) if key.is_none() => {
                key = Some(k.to_ascii_lowercase());
                State::AwaitingKey
            }
            (State::AwaitingKey, Token::Equals) => match key.take() {
                Some(k) => State::AwaitingValue(k),
                None => return Err(Error::malformed(format!("`=` without key in {:?}", value))),
            },
            (State::AwaitingValue(k), Token::Bare(v)) if val.is_none() => {
                val = Some(v.to_string());
                State::AwaitingValue(k)
            }
            (State::AwaitingValue(k), Token::Quoted(v)) if val.is_none() => {
                val = Some(v);
                State::AwaitingValue(k)
            }
            (State::AwaitingKey, Token::Semi) => {
                commit(&mut disposition, key.take(), None);
                State::AwaitingKey
            }
            (State::AwaitingValue(k), Token::Semi) => {
                commit(&mut disposition, Some(k), val.take());
                State::AwaitingKey
            }
            (_, token) => {
                return Err(Error::malformed(format!(
                    "unexpected {:?} in disposition {:?}",
                    token, value
                )))
            }
        };
    }

    Ok(disposition)
}

fn commit(disposition: &mut Disposition, key: Option<String>, value: Option<String>) {
    let key = match key {
        Some(k) => k,
        None => return,
    };

    let value = match value {
        Some(v) => v,
        None => {
            match key.as_str() {
                "inline" => disposition.part_type = Some(PartType::Inline),
                "attachment" => disposition.part_type = Some(PartType::Attachment),
                _ => log::trace!("Ignoring disposition flag without value: {}", key),
            }
            return;
        }
    };

    let key = if key == "filename" {
        "uri".to_string()
    } else {
        key
    };

    match disposition.params.get_mut(&key) {
        Some(existing) => existing.push(value),
        None => {
            disposition.params.insert(key, ParamValue::Single(value));
        }
    }
}
