//! Post-normalization transforms
//!
//! Filters run after a server's result has been normalized, in the order they
//! were added to the engine. They see the definition that produced the result
//! so they can key off its family.

use crate::definition::Protocol;
use crate::result::{QueryResult, Value};

pub trait Filter: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, result: QueryResult, protocol: &Protocol) -> QueryResult;
}

/// Removes in-game colour codes from every text value
///
/// Quake-derived games use `^` followed by one character; Unreal-engine
/// games served over GameSpy use an escape byte followed by three colour
/// bytes. Other families pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripColors;

impl Filter for StripColors {
    fn name(&self) -> &str {
        "strip_colors"
    }

    fn apply(&self, mut result: QueryResult, protocol: &Protocol) -> QueryResult {
        let strip: fn(&str) -> String = match protocol.family() {
            "quake2" | "quake3" => strip_caret_codes,
            "gamespy2" | "gamespy3" | "unreal2" => strip_escape_codes,
            _ => return result,
        };

        result.for_each_value_mut(|value| {
            if let Value::Text(text) = value {
                *text = strip(text);
            }
        });
        result
    }
}

fn strip_caret_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '^' {
            chars.next();
        } else {
            out.push(c);
        }
    }
    out
}

fn strip_escape_codes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for _ in 0..3 {
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}
