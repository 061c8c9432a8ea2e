//! # Route Metadata
//!
//! Compiles a path pattern such as `/users/{id}` or `/posts/{slug:[a-z0-9-]+}`
//! into an anchored regex over the slash-trimmed path, remembering the
//! placeholder names in declaration order.

use crate::error::{Error, Result};
use crate::router::HandlerId;
use crate::types::{convert_param, ParamType, ParamValue};
use regex::Regex;
use std::collections::HashMap;

/// Compiled route pattern plus its metadata
#[derive(Debug, Clone)]
pub struct RouteInfo {
    /// Unique handler identifier
    pub handler_id: HandlerId,
    /// Pattern exactly as registered (e.g. "/users/{id:int}")
    pub path_pattern: String,
    /// Placeholder names, in the order they appear
    pub param_names: Vec<String>,
    /// Declared parameter types (only for type specifiers)
    pub param_types: HashMap<String, ParamType>,
    /// `None` for literal patterns
    regex: Option<Regex>,
    /// Pattern with leading/trailing slashes removed
    trimmed: String,
}

impl RouteInfo {
    /// Compile a path pattern
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` for unbalanced braces, empty or
    /// non-word placeholder names, or a constraint that is not a valid regex.
    pub fn new(handler_id: HandlerId, path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/').to_string();
        let tokens = tokenize(path, &trimmed)?;

        let mut param_names = Vec::new();
        let mut param_types = HashMap::new();
        let mut source = String::from("^");

        for token in &tokens {
            match token {
                Token::Literal(text) => source.push_str(&regex::escape(text)),
                Token::Param { name, constraint } => {
                    let fragment = match constraint {
                        None => ParamType::String.pattern().to_string(),
                        Some(specifier) => match ParamType::from_specifier(specifier) {
                            Some(param_type) => {
                                param_types.insert(name.clone(), param_type);
                                param_type.pattern().to_string()
                            }
                            None => specifier.clone(),
                        },
                    };
                    source.push_str(&format!("(?P<p{}>{fragment})", param_names.len()));
                    param_names.push(name.clone());
                }
            }
        }
        source.push('$');

        let regex = if param_names.is_empty() {
            None
        } else {
            Some(Regex::new(&source).map_err(|e| Error::InvalidRoutePattern {
                pattern: path.to_string(),
                reason: e.to_string(),
            })?)
        };

        Ok(Self {
            handler_id,
            path_pattern: path.to_string(),
            param_names,
            param_types,
            regex,
            trimmed,
        })
    }

    /// Whether the pattern has no placeholders
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        self.regex.is_none()
    }

    /// Whether the pattern is the root (empty after trimming slashes)
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.trimmed.is_empty()
    }

    /// Match an already slash-trimmed request path
    ///
    /// Returns the captured values zipped with placeholder names, or `None`
    /// when the pattern does not match the whole path.
    #[must_use]
    pub fn captures(&self, trimmed_path: &str) -> Option<Vec<(String, String)>> {
        let Some(regex) = &self.regex else {
            return (self.trimmed == trimmed_path).then(Vec::new);
        };

        let caps = regex.captures(trimmed_path)?;
        Some(
            self.param_names
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let value = caps
                        .name(&format!("p{i}"))
                        .map_or_else(String::new, |m| m.as_str().to_string());
                    (name.clone(), value)
                })
                .collect(),
        )
    }

    /// Get the type for a parameter by name
    ///
    /// Returns `ParamType::String` for placeholders without a type specifier.
    #[must_use]
    pub fn get_param_type(&self, name: &str) -> ParamType {
        self.param_types.get(name).copied().unwrap_or_default()
    }

    /// Convert a captured value using the declared parameter type
    #[must_use]
    pub fn typed_value(&self, name: &str, raw: &str) -> ParamValue {
        convert_param(raw, self.get_param_type(name))
            .unwrap_or_else(|_| ParamValue::String(raw.to_string()))
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Literal(String),
    Param {
        name: String,
        constraint: Option<String>,
    },
}

fn tokenize(original: &str, trimmed: &str) -> Result<Vec<Token>> {
    let invalid = |reason: &str| Error::InvalidRoutePattern {
        pattern: original.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = trimmed.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' {
            if c == '}' {
                return Err(invalid("unexpected '}'"));
            }
            literal.push(c);
            continue;
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }

        let mut name = String::new();
        let mut constraint = None;
        let mut closed = false;
        while let Some(c) = chars.next() {
            match c {
                '}' => {
                    closed = true;
                    break;
                }
                ':' => {
                    // Constraint runs to the brace that balances the opening one
                    let mut depth = 0usize;
                    let mut text = String::new();
                    for c in chars.by_ref() {
                        match c {
                            '{' => depth += 1,
                            '}' if depth == 0 => {
                                closed = true;
                                break;
                            }
                            '}' => depth -= 1,
                            _ => {}
                        }
                        text.push(c);
                    }
                    if text.is_empty() {
                        return Err(invalid("empty placeholder constraint"));
                    }
                    constraint = Some(text);
                    break;
                }
                c if c.is_alphanumeric() || c == '_' => name.push(c),
                _ => return Err(invalid("placeholder names may only contain word characters")),
            }
        }

        if !closed {
            return Err(invalid("unclosed '{'"));
        }
        if name.is_empty() {
            return Err(invalid("empty placeholder name"));
        }
        tokens.push(Token::Param { name, constraint });
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}
