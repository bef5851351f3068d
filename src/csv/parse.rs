//! One-pass CSV field splitting and typed field extraction.
//!
//! Assumptions, shared by the indexer and the duplicator:
//!
//! - a record is contained in exactly one line; fields never contain
//!   embedded new-lines
//! - the line terminator is LF, the escape character is `\`, and the
//!   quote character is `"`
//! - no line is longer than MAX_LINE_SIZE bytes
//! - the character set is ASCII or UTF-8, never multi-byte-unit encodings
//! - numeric fields are not quoted

use crate::core::error::{Error, Result};

/// Maximum CSV line size in bytes, terminator included.
pub const MAX_LINE_SIZE: usize = 16384;

/// Returns true when the delimiter is usable (not `\`, `"` or LF).
pub fn valid_delimiter(delim: u8) -> bool {
    delim != b'\\' && delim != b'"' && delim != b'\n'
}

/// Parse one line of `buf`, storing `num_fields + 1` field offsets.
///
/// Field i occupies `buf[offsets[i] .. offsets[i + 1] - 1]`; the byte at
/// `offsets[i + 1] - 1` is the delimiter or line terminator and is not
/// part of the field. Returns the offset of the first byte of the next
/// line. The escape character suppresses delimiter detection even outside
/// of quotes.
pub fn parse_line(
    buf: &[u8],
    delim: u8,
    num_fields: usize,
    offsets: &mut Vec<usize>,
) -> Result<usize> {
    if buf.is_empty() {
        return Err(Error::parse("line ends before it begins"));
    }
    if num_fields < 1 {
        return Err(Error::parse("field count < 1"));
    }
    offsets.clear();
    offsets.push(0);
    let mut saw_quote = false;
    let mut saw_escape = false;
    let mut pos = 0;
    while pos < buf.len() {
        let c = buf[pos];
        if c == b'\n' {
            pos += 1;
            break;
        }
        if saw_escape {
            saw_escape = false;
        } else if saw_quote {
            saw_escape = c == b'\\';
            saw_quote = c != b'"';
        } else {
            saw_escape = c == b'\\';
            saw_quote = c == b'"';
            if c == delim {
                if offsets.len() >= num_fields {
                    return Err(Error::parse("too many fields in line"));
                }
                offsets.push(pos + 1);
            }
        }
        pos += 1;
    }
    if saw_quote || saw_escape {
        return Err(Error::parse(
            "invalid line format: embedded new-line, trailing escape, or missing quote",
        ));
    }
    if offsets.len() != num_fields {
        return Err(Error::parse("line does not contain expected number of fields"));
    }
    offsets.push(pos);
    Ok(pos)
}

/// The bytes of field i, delimiter excluded.
pub fn field<'a>(buf: &'a [u8], offsets: &[usize], i: usize) -> &'a [u8] {
    &buf[offsets[i]..offsets[i + 1] - 1]
}

/// Index of a named field in a field name list.
pub fn field_index(fields: &[String], name: &str) -> Option<usize> {
    fields.iter().position(|f| f == name)
}

fn trim(mut f: &[u8]) -> &[u8] {
    while let [b, rest @ ..] = f {
        if b.is_ascii_whitespace() {
            f = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., b] = f {
        if b.is_ascii_whitespace() {
            f = rest;
        } else {
            break;
        }
    }
    f
}

/// True when the field encodes a NULL: empty, `\N`, or `NULL`, after
/// trimming whitespace.
pub fn is_null(f: &[u8]) -> bool {
    let f = trim(f);
    f.is_empty() || f == b"\\N" || f == b"NULL"
}

/// Extract a double from a field. With `allow_null`, NULL fields come
/// back as a quiet NaN. Quoted numeric fields are not handled.
pub fn extract_double(f: &[u8], allow_null: bool) -> Result<f64> {
    let t = trim(f);
    if allow_null && is_null(t) {
        return Ok(f64::NAN);
    }
    if t.is_empty() {
        return Err(Error::parse("cannot convert empty field to a double"));
    }
    let s = std::str::from_utf8(t).map_err(|_| Error::parse("field is not valid UTF-8"))?;
    s.parse::<f64>()
        .map_err(|_| Error::parse(format!("failed to convert field to a double: {:?}", s)))
}

/// Extract an i64 from a field. Quoted numeric fields are not handled.
pub fn extract_int(f: &[u8]) -> Result<i64> {
    let t = trim(f);
    if t.is_empty() {
        return Err(Error::parse("cannot convert empty field to an integer"));
    }
    let s = std::str::from_utf8(t).map_err(|_| Error::parse("field is not valid UTF-8"))?;
    s.parse::<i64>()
        .map_err(|_| Error::parse(format!("failed to convert field to an integer: {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(line: &str, delim: u8, n: usize) -> Vec<String> {
        let mut offsets = Vec::new();
        parse_line(line.as_bytes(), delim, n, &mut offsets).unwrap();
        (0..n)
            .map(|i| String::from_utf8(field(line.as_bytes(), &offsets, i).to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_basic_split() {
        assert_eq!(split("1,2.5,abc\n", b',', 3), vec!["1", "2.5", "abc"]);
        assert_eq!(split("a|b\n", b'|', 2), vec!["a", "b"]);
    }

    #[test]
    fn test_last_line_without_terminator() {
        assert_eq!(split("x,y", b',', 2), vec!["x", "y"]);
    }

    #[test]
    fn test_quoted_delimiter_is_not_a_separator() {
        assert_eq!(split("\"a,b\",c\n", b',', 2), vec!["\"a,b\"", "c"]);
    }

    #[test]
    fn test_escape_works_outside_quotes() {
        // A backslash suppresses delimiter detection even when no quote
        // is open.
        assert_eq!(split("a\\,b,c\n", b',', 2), vec!["a\\,b", "c"]);
    }

    #[test]
    fn test_field_count_mismatch() {
        let mut offsets = Vec::new();
        assert!(parse_line(b"a,b,c\n", b',', 2, &mut offsets).is_err());
        assert!(parse_line(b"a,b\n", b',', 3, &mut offsets).is_err());
    }

    #[test]
    fn test_unterminated_quote_and_trailing_escape() {
        let mut offsets = Vec::new();
        assert!(parse_line(b"\"abc\n", b',', 1, &mut offsets).is_err());
        assert!(parse_line(b"abc\\", b',', 1, &mut offsets).is_err());
    }

    #[test]
    fn test_parse_returns_next_line_offset() {
        let buf = b"a,b\nc,d\n";
        let mut offsets = Vec::new();
        let next = parse_line(buf, b',', 2, &mut offsets).unwrap();
        assert_eq!(next, 4);
        let next2 = parse_line(&buf[next..], b',', 2, &mut offsets).unwrap();
        assert_eq!(next2, 4);
    }

    #[test]
    fn test_null_encodings() {
        assert!(is_null(b""));
        assert!(is_null(b"  "));
        assert!(is_null(b"\\N"));
        assert!(is_null(b" NULL "));
        assert!(!is_null(b"0"));
        assert!(!is_null(b"null"));
    }

    #[test]
    fn test_extract_double() {
        assert_eq!(extract_double(b" 2.5 ", false).unwrap(), 2.5);
        assert_eq!(extract_double(b"-1e3", false).unwrap(), -1000.0);
        assert!(extract_double(b"2.5x", false).is_err());
        assert!(extract_double(b"", false).is_err());
        assert!(extract_double(b"\\N", true).unwrap().is_nan());
    }

    #[test]
    fn test_extract_int() {
        assert_eq!(extract_int(b" 42\t").unwrap(), 42);
        assert_eq!(extract_int(b"-7").unwrap(), -7);
        assert!(extract_int(b"4.2").is_err());
        assert!(extract_int(b"").is_err());
    }
}
