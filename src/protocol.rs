//! Line-oriented text protocol: command parsing and dispatch.
//!
//! One request message carries one command:
//! - `SET <key> <value...>` stores the value, replying `OK`
//! - `GET <key>` replies with the stored value, or an empty string
//! - `G<anything> <key>` is treated as `GET`
//!
//! Dispatch never fails: every input maps to exactly one [`Response`].

use crate::cache::Cache;
use std::fmt;

/// Parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Blank request
    Empty,

    /// Store a value. Value tokens are rejoined with single spaces.
    Set { key: &'a str, value: String },

    /// Read a value
    Get { key: &'a str },

    /// Anything the grammar does not recognize
    Unknown,
}

impl<'a> Command<'a> {
    /// Parse a trimmed request line.
    pub fn parse(line: &'a str) -> Self {
        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            [] => Command::Empty,
            [verb, key, value @ ..] if verb.eq_ignore_ascii_case("SET") && !value.is_empty() => {
                Command::Set {
                    key: *key,
                    value: value.join(" "),
                }
            }
            [verb, key] if verb.eq_ignore_ascii_case("GET") => Command::Get { key: *key },
            // Any two-token command whose verb starts with G reads the key.
            // Kept for compatibility with existing clients that send `G key`.
            [verb, key] if verb.starts_with(['G', 'g']) => Command::Get { key: *key },
            _ => Command::Unknown,
        }
    }
}

/// Response to a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `SET` succeeded
    Ok,
    /// Value for a `GET`, empty when the key is absent
    Value(String),
    /// Blank request
    EmptyCommand,
    /// Unrecognized verb or wrong arity
    UnknownCommand,
    /// Internal fault while processing the command
    ServerError(String),
}

impl Response {
    #[cfg(test)]
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Response::EmptyCommand | Response::UnknownCommand | Response::ServerError(_)
        )
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::Value(value) => f.write_str(value),
            Response::EmptyCommand => f.write_str("ERROR: Empty command"),
            Response::UnknownCommand => f.write_str("ERROR: Unknown command"),
            Response::ServerError(msg) => write!(f, "SERVER ERROR: {msg}"),
        }
    }
}

/// Execute one request line against the cache.
pub fn dispatch(line: &str, cache: &Cache) -> Response {
    match Command::parse(line.trim()) {
        Command::Empty => Response::EmptyCommand,
        Command::Set { key, value } => {
            cache.set(key, value);
            Response::Ok
        }
        Command::Get { key } => Response::Value(cache.get(key)),
        Command::Unknown => Response::UnknownCommand,
    }
}
