//! `driftproto`: the delimiter-framed text protocol spoken by driftd.
//!
//! One frame carries one message. Top-level fields are joined with
//! [`DELIM`] and list-valued fields join their elements with
//! [`MDELIM`]; the first field is always the command name. Both
//! separators are reserved characters that never appear inside a
//! payload, so splitting is unambiguous and needs no escaping.
//!
//! Encoding is built from a closed set of [`Part`] variants rather
//! than an open "encode anything" surface: a value kind the protocol
//! does not know is a compile error, not a silently skipped field.

use std::collections::HashSet;

/// Primary field separator.
pub const DELIM: char = '\u{ffff}';
/// Secondary separator for elements of a list- or set-valued field.
pub const MDELIM: char = '\u{fffe}';

/// One encodable field (or field fragment) of an outbound message.
///
/// Ordered containers keep their element order on the wire; the set
/// variants make no ordering promise beyond set-equality.
#[derive(Debug, Clone)]
pub enum Part<'a> {
    Byte(u8),
    Bytes(&'a [u8]),
    Str(&'a str),
    StrList(&'a [String]),
    StrSet(&'a HashSet<String>),
    Int(i64),
    IntList(&'a [i64]),
    IntSet(&'a HashSet<i64>),
    Bool(bool),
}

/// Encode a message: parts joined by [`DELIM`], list/set elements by
/// [`MDELIM`]. Booleans render as a single ASCII digit.
pub fn build_msg(parts: &[Part<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    let mut delim_buf = [0u8; 4];
    let delim = DELIM.encode_utf8(&mut delim_buf).as_bytes().to_vec();
    let mut mdelim_buf = [0u8; 4];
    let mdelim = MDELIM.encode_utf8(&mut mdelim_buf).as_bytes().to_vec();

    for (idx, part) in parts.iter().enumerate() {
        if idx != 0 {
            out.extend_from_slice(&delim);
        }
        match part {
            Part::Byte(b) => out.push(*b),
            Part::Bytes(b) => out.extend_from_slice(b),
            Part::Str(s) => out.extend_from_slice(s.as_bytes()),
            Part::StrList(items) => {
                for (i, s) in items.iter().enumerate() {
                    if i != 0 {
                        out.extend_from_slice(&mdelim);
                    }
                    out.extend_from_slice(s.as_bytes());
                }
            }
            Part::StrSet(items) => {
                for (i, s) in items.iter().enumerate() {
                    if i != 0 {
                        out.extend_from_slice(&mdelim);
                    }
                    out.extend_from_slice(s.as_bytes());
                }
            }
            Part::Int(n) => out.extend_from_slice(n.to_string().as_bytes()),
            Part::IntList(items) => {
                for (i, n) in items.iter().enumerate() {
                    if i != 0 {
                        out.extend_from_slice(&mdelim);
                    }
                    out.extend_from_slice(n.to_string().as_bytes());
                }
            }
            Part::IntSet(items) => {
                for (i, n) in items.iter().enumerate() {
                    if i != 0 {
                        out.extend_from_slice(&mdelim);
                    }
                    out.extend_from_slice(n.to_string().as_bytes());
                }
            }
            Part::Bool(b) => out.push(if *b { b'1' } else { b'0' }),
        }
    }

    out
}

/// Split a decoded frame into its top-level fields.
pub fn split_msg(s: &str) -> Vec<&str> {
    s.split(DELIM).collect()
}

/// Split a list-valued field into its elements.
pub fn split_list(s: &str) -> Vec<&str> {
    s.split(MDELIM).collect()
}

/// A command rejected before any state change.
///
/// None of these tear down the connection; the offending frame is
/// dropped and the next one is read.
#[derive(Debug, Clone)]
pub enum CmdError {
    LengthMismatch { need: usize, got: usize },
    BadInt { field: &'static str },
    OutOfRange { field: &'static str },
    BadName { field: &'static str },
    Rejected(&'static str),
}

impl std::fmt::Display for CmdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CmdError::LengthMismatch { need, got } => {
                write!(f, "length mismatch: need {need}, got {got}")
            }
            CmdError::BadInt { field } => write!(f, "bad integer in field {field}"),
            CmdError::OutOfRange { field } => write!(f, "field {field} out of range"),
            CmdError::BadName { field } => write!(f, "field {field} not an allowed name"),
            CmdError::Rejected(why) => write!(f, "rejected: {why}"),
        }
    }
}

impl std::error::Error for CmdError {}

/// Arity check helper: `fields` must have exactly `need` entries,
/// command name included.
pub fn expect_len(fields: &[&str], need: usize) -> Result<(), CmdError> {
    if fields.len() != need {
        return Err(CmdError::LengthMismatch {
            need,
            got: fields.len(),
        });
    }
    Ok(())
}

pub fn parse_int(s: &str, field: &'static str) -> Result<i64, CmdError> {
    s.parse::<i64>().map_err(|_| CmdError::BadInt { field })
}

/// Parse an integer and require it to sit in `lo..=hi`.
pub fn parse_ranged(s: &str, lo: i64, hi: i64, field: &'static str) -> Result<i64, CmdError> {
    let n = parse_int(s, field)?;
    if n < lo || n > hi {
        return Err(CmdError::OutOfRange { field });
    }
    Ok(n)
}

/// Parse a `0`/`1` flag field.
pub fn parse_bool(s: &str, field: &'static str) -> Result<bool, CmdError> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(CmdError::OutOfRange { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(b: &[u8]) -> String {
        String::from_utf8(b.to_vec()).unwrap()
    }

    #[test]
    fn joins_parts_with_primary_delim() {
        let b = build_msg(&[Part::Str("m"), Part::Int(7), Part::Int(12), Part::Int(34)]);
        let s = decode(&b);
        assert_eq!(split_msg(&s), vec!["m", "7", "12", "34"]);
    }

    #[test]
    fn bool_renders_as_single_digit() {
        let b = build_msg(&[Part::Str("h"), Part::Bool(true), Part::Bool(false)]);
        assert_eq!(split_msg(&decode(&b)), vec!["h", "1", "0"]);
    }

    #[test]
    fn ordered_lists_keep_order() {
        let ints = [3i64, 1, 2];
        let strs = ["b".to_string(), "a".to_string()];
        let b = build_msg(&[Part::Str("x"), Part::IntList(&ints), Part::StrList(&strs)]);
        let s = decode(&b);
        let fields = split_msg(&s);
        assert_eq!(split_list(fields[1]), vec!["3", "1", "2"]);
        assert_eq!(split_list(fields[2]), vec!["b", "a"]);
    }

    #[test]
    fn sets_round_trip_as_sets() {
        let mut set = HashSet::new();
        set.insert(10i64);
        set.insert(20i64);
        let b = build_msg(&[Part::Str("x"), Part::IntSet(&set)]);
        let s = decode(&b);
        let got: HashSet<i64> = split_list(split_msg(&s)[1])
            .iter()
            .map(|e| e.parse().unwrap())
            .collect();
        assert_eq!(got, set);
    }

    #[test]
    fn round_trips_mixed_ascii_payload() {
        let b = build_msg(&[
            Part::Str("spr"),
            Part::Int(42),
            Part::Str("hero_red"),
            Part::Int(3),
        ]);
        let s = decode(&b);
        assert_eq!(split_msg(&s), vec!["spr", "42", "hero_red", "3"]);
    }

    #[test]
    fn byte_and_bytes_pass_through_raw() {
        let b = build_msg(&[Part::Byte(b'q'), Part::Bytes(b"raw")]);
        let s = decode(&b);
        assert_eq!(split_msg(&s), vec!["q", "raw"]);
    }

    #[test]
    fn expect_len_reports_mismatch() {
        let fields = vec!["m", "1"];
        match expect_len(&fields, 3) {
            Err(CmdError::LengthMismatch { need: 3, got: 2 }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ranged_parse_enforces_bounds() {
        assert!(parse_ranged("3", 0, 3, "facing").is_ok());
        assert!(matches!(
            parse_ranged("4", 0, 3, "facing"),
            Err(CmdError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse_ranged("x", 0, 3, "facing"),
            Err(CmdError::BadInt { .. })
        ));
    }
}
