//! Delimited-text field codec
//!
//! Row, old and primary-key values travel as one line of comma separated
//! fields. Values are double-quoted with `"` and `\` escaped by a
//! backslash; a NULL is an empty, unquoted field. Line breaks inside a
//! value are escaped so that one record always occupies one line.

use crate::error::{Error, Result};

/// Encode a list of nullable fields as one delimited line
pub fn encode(fields: &[Option<String>]) -> String {
    let mut out = String::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if let Some(value) = field {
            out.push('"');
            escape_into(value, &mut out);
            out.push('"');
        }
    }
    out
}

/// Encode borrowed string fields, none of which are NULL
pub fn encode_names<S: AsRef<str>>(fields: &[S]) -> String {
    let owned: Vec<Option<String>> = fields
        .iter()
        .map(|f| Some(f.as_ref().to_string()))
        .collect();
    encode(&owned)
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

/// Parse one delimited line back into its fields.
///
/// An empty line is a single NULL field; rows always carry at least one column.
pub fn parse(line: &str) -> Result<Vec<Option<String>>> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        match chars.peek() {
            Some('"') => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('r') => value.push('\r'),
                            Some(other) => value.push(other),
                            None => {
                                return Err(Error::ProtocolViolation(format!(
                                    "Dangling escape at end of line: {}",
                                    line
                                )))
                            }
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => value.push(c),
                    }
                }
                if !closed {
                    return Err(Error::ProtocolViolation(format!(
                        "Unterminated quoted field: {}",
                        line
                    )));
                }
                fields.push(Some(value));
                match chars.next() {
                    Some(',') => continue,
                    None => break,
                    Some(c) => {
                        return Err(Error::ProtocolViolation(format!(
                            "Unexpected '{}' after quoted field: {}",
                            c, line
                        )))
                    }
                }
            }
            _ => {
                let mut raw = String::new();
                let mut at_end = true;
                for c in chars.by_ref() {
                    if c == ',' {
                        at_end = false;
                        break;
                    }
                    raw.push(c);
                }
                fields.push(if raw.is_empty() { None } else { Some(raw) });
                if at_end {
                    break;
                }
            }
        }
    }

    Ok(fields)
}
