//! Turns raw fuzz buffers into typed arguments for a target routine.
//!
//! Text parameters are laid out as a length byte `L` followed by `L + 1`
//! bytes of Latin-1 text, so a text argument is never empty and holds at most
//! 256 characters. Parameters are consumed left to right; trailing bytes are
//! ignored.

use crate::input::{latin1_decode, latin1_encode};
use std::fmt;
use thiserror::Error;

/// Longest text argument a single length byte can describe.
pub const MAX_TEXT_ARG_LEN: usize = u8::MAX as usize + 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ran out before parameter `param_index` was fully read.
    #[error("Insufficient data for parameter {param_index}: needed {needed} bytes, {available} left")]
    InsufficientData {
        param_index: usize,
        needed: usize,
        available: usize,
    },

    /// A parameter type the decoder has no layout for.
    #[error("Unsupported parameter type '{0}'")]
    UnsupportedType(String),
}

impl DecodeError {
    /// `InsufficientData` only skips the current trial; `UnsupportedType`
    /// means the target can never be driven and ends the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DecodeError::InsufficientData { .. })
    }
}

/// Declared type of one target parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamType {
    Text,
    /// Any type name the decoder does not understand, kept verbatim.
    Unsupported(String),
}

impl ParamType {
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "String" | "str" | "&str" | "text" => ParamType::Text,
            other => ParamType::Unsupported(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ParamType::Text => "String",
            ParamType::Unsupported(name) => name,
        }
    }
}

/// A decoded argument value handed to the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgValue {
    Text(String),
}

impl ArgValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
        }
    }
}

impl fmt::Display for ArgValue {
    /// Renders the value the way it appears in crash reports (quoted and escaped).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// Decodes `buffer` into one argument per entry of `param_types`.
pub fn decode(buffer: &[u8], param_types: &[ParamType]) -> Result<Vec<ArgValue>, DecodeError> {
    let mut cursor = 0usize;
    let mut args = Vec::with_capacity(param_types.len());

    for (param_index, param_type) in param_types.iter().enumerate() {
        match param_type {
            ParamType::Text => {
                let remaining = &buffer[cursor..];
                let Some((&len_byte, body)) = remaining.split_first() else {
                    return Err(DecodeError::InsufficientData {
                        param_index,
                        needed: 1,
                        available: 0,
                    });
                };
                let text_len = usize::from(len_byte) + 1;
                if body.len() < text_len {
                    return Err(DecodeError::InsufficientData {
                        param_index,
                        needed: text_len + 1,
                        available: remaining.len(),
                    });
                }
                args.push(ArgValue::Text(latin1_decode(&body[..text_len])));
                cursor += 1 + text_len;
            }
            ParamType::Unsupported(name) => {
                return Err(DecodeError::UnsupportedType(name.clone()));
            }
        }
    }

    Ok(args)
}

/// Builds the buffer that `decode` turns back into the given text arguments.
///
/// Empty strings are encoded as a single NUL character and texts longer than
/// [`MAX_TEXT_ARG_LEN`] are truncated, since the layout can express neither.
pub fn encode_text_args(texts: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for text in texts {
        let mut bytes = latin1_encode(text);
        if bytes.is_empty() {
            bytes.push(0);
        }
        bytes.truncate(MAX_TEXT_ARG_LEN);
        // len is in 1..=256 here
        out.push((bytes.len() - 1) as u8);
        out.extend_from_slice(&bytes);
    }
    out
}
