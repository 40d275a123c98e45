//! Decoder for the packed single-part sequence encoding.
//!
//! A packed body is a concatenation of entries `<primitive>:<payload>`. The
//! primitive is either `prefix:local` or a node kind such as `element()`.
//! String-like payloads are `<code points>:<text>\n`; every other payload
//! runs to the next `\n`. `binary()` payloads are base64.

use crate::error::ConversionError;
use crate::types::ValueType;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Content type of a packed sequence part.
pub const PACKED_CONTENT_TYPE: &str = "application/x-xcc-sequence";

/// One decoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedItem {
    pub value_type: ValueType,
    pub body: Vec<u8>,
}

/// Whether a part with this content type carries a packed sequence.
pub fn is_packed(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(PACKED_CONTENT_TYPE))
}

fn malformed(offset: usize, what: &str) -> ConversionError {
    ConversionError::InvalidFormat(format!("packed sequence at byte {}: {}", offset, what))
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn take_until(&mut self, delim: char) -> Result<&'a str, ConversionError> {
        let rest = self.rest();
        let end = rest
            .find(delim)
            .ok_or_else(|| malformed(self.pos, &format!("missing '{}'", delim.escape_default())))?;
        self.pos += end + delim.len_utf8();
        Ok(&rest[..end])
    }

    fn primitive(&mut self) -> Result<&'a str, ConversionError> {
        let start = self.pos;
        let rest = self.rest();
        let first = rest
            .find(|c: char| c == ':' || c == ')')
            .ok_or_else(|| malformed(start, "missing primitive name"))?;

        let end = if rest.as_bytes()[first] == b')' {
            // node kind: `kind()` followed by ':'
            if rest.as_bytes().get(first + 1) != Some(&b':') {
                return Err(malformed(start, "node kind not followed by ':'"));
            }
            first + 1
        } else {
            // `prefix:local` followed by ':'
            let local = &rest[first + 1..];
            let len = local
                .find(':')
                .ok_or_else(|| malformed(start, "missing ':' after primitive name"))?;
            first + 1 + len
        };

        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn counted_chars(&mut self, count: usize) -> Result<&'a str, ConversionError> {
        let rest = self.rest();
        let end = match rest.char_indices().nth(count) {
            Some((idx, _)) => idx,
            None if rest.chars().count() == count => rest.len(),
            None => return Err(malformed(self.pos, "string payload shorter than its count")),
        };
        self.pos += end;
        Ok(&rest[..end])
    }

    fn expect_newline(&mut self) -> Result<(), ConversionError> {
        if self.rest().starts_with('\n') {
            self.pos += 1;
            Ok(())
        } else {
            Err(malformed(self.pos, "expected newline after payload"))
        }
    }
}

/// Decode a packed body into its items.
///
/// # Errors
///
/// Returns `ConversionError::InvalidFormat` if the framing is broken and
/// `ConversionError::UnsupportedType` for unknown primitives.
pub fn decode(body: &[u8]) -> Result<Vec<PackedItem>, ConversionError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| malformed(e.valid_up_to(), "invalid UTF-8"))?;
    let mut cursor = Cursor { text, pos: 0 };
    let mut items = Vec::new();

    while !cursor.at_end() {
        let primitive = cursor.primitive()?;
        let value_type = ValueType::from_primitive(primitive)?;

        let body = if value_type.is_string_like() {
            let count_pos = cursor.pos;
            let count: usize = cursor
                .take_until(':')?
                .parse()
                .map_err(|_| malformed(count_pos, "invalid character count"))?;
            let chars = cursor.counted_chars(count)?;
            cursor.expect_newline()?;
            chars.as_bytes().to_vec()
        } else if value_type == ValueType::Binary {
            let line_pos = cursor.pos;
            let line = cursor.take_until('\n')?;
            BASE64
                .decode(line.trim())
                .map_err(|_| malformed(line_pos, "invalid base64 in binary() payload"))?
        } else {
            cursor.take_until('\n')?.as_bytes().to_vec()
        };

        items.push(PackedItem { value_type, body });
    }

    Ok(items)
}
