//! Line-oriented record framing shared by every cache file.
//!
//! A record is one line. Fields are joined by [`TOKEN_SEP`] and each field is
//! escaped first:
//!
//! | raw       | escaped |
//! |-----------|---------|
//! | `\`       | `\\`    |
//! | `@`       | `\@`    |
//! | newline   | `\n`    |
//! | CR        | `\r`    |
//!
//! An escaped field never contains a raw `@`, so every raw `@@` is a field
//! boundary and the first field is always the entity ID. The same splitter
//! serves ID extraction and field parsing.

use crate::error::FramingError;

pub const TOKEN_SEP: &str = "@@";

const ESCAPE: char = '\\';
const LIST_SEP: char = ',';

/// Escape one field so it can be embedded in a record.
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '@' => out.push_str("\\@"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Join already-encoded field values into a single record line (no newline).
pub fn encode_record<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(TOKEN_SEP)
}

/// Split a record line into its unescaped fields.
pub fn split_record(line: &str) -> Result<Vec<String>, FramingError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some('\\') => current.push('\\'),
                Some('@') => current.push('@'),
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(other) => return Err(FramingError::UnknownEscape(other)),
                None => return Err(FramingError::DanglingEscape),
            },
            '@' if chars.peek() == Some(&'@') => {
                chars.next();
                fields.push(std::mem::take(&mut current));
            }
            '@' => return Err(FramingError::StrayToken),
            c => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

/// Encode a list as one field value: items joined by `,`, with `\` and `,`
/// escaped inside each item. Items must be non-empty; an empty list encodes
/// to the empty string.
pub fn encode_list<S: AsRef<str>>(items: &[S]) -> String {
    let mut out = String::new();
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(LIST_SEP);
        }
        for c in item.as_ref().chars() {
            if c == ESCAPE || c == LIST_SEP {
                out.push(ESCAPE);
            }
            out.push(c);
        }
    }
    out
}

/// Inverse of [`encode_list`].
pub fn decode_list(value: &str) -> Result<Vec<String>, FramingError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(c @ (ESCAPE | LIST_SEP)) => current.push(c),
                Some(other) => return Err(FramingError::UnknownEscape(other)),
                None => return Err(FramingError::DanglingEscape),
            },
            LIST_SEP => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    items.push(current);
    Ok(items)
}
