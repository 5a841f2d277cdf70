//! Array literal parsing.
//!
//! Grammar (as produced by the server's array output function):
//!
//! ```text
//! array   := [ bounds '=' ] '{' [ element { ',' element } ] '}'
//! element := array | quoted | bare
//! quoted  := '"' { '\' any | any-but-quote } '"'
//! bare    := any-but { ',' '}' }        -- exactly `NULL` means SQL null
//! ```
//!
//! Quoted elements are un-escaped once and then handed to the element decoder.

use super::{lossy, Scalar, Value};

/// Nesting limit. The server caps arrays at 6 dimensions; anything deeper
/// than this is treated as malformed.
pub const MAX_DEPTH: usize = 32;

/// True when `text` is delimited by braces and may be parsed as an array.
pub fn looks_like_array(text: &[u8]) -> bool {
    text.len() > 1 && text[0] == b'{' && text[text.len() - 1] == b'}'
}

/// Decode an array literal, falling back to the raw text when it is malformed.
pub fn decode(text: &[u8], element: Scalar) -> Value {
    match parse(text, element) {
        Some(items) => Value::Array(items),
        None => Value::Text(lossy(text)),
    }
}

/// Parse a complete array literal.
pub fn parse(text: &[u8], element: Scalar) -> Option<Vec<Value>> {
    let body = skip_bounds(text)?;
    let (items, consumed) = parse_prefix(body, element)?;
    (consumed == body.len()).then_some(items)
}

/// Parse one array starting at `text[0] == '{'`, returning the elements and
/// the number of bytes consumed up to and including the closing brace.
pub fn parse_prefix(text: &[u8], element: Scalar) -> Option<(Vec<Value>, usize)> {
    let mut cursor = Cursor {
        text,
        pos: 0,
        element,
    };
    let items = cursor.array(0)?;
    Some((items, cursor.pos))
}

/// Skip a `[1:2][1:3]=` dimension decoration.
fn skip_bounds(text: &[u8]) -> Option<&[u8]> {
    if text.first() != Some(&b'[') {
        return Some(text);
    }
    let eq = text.iter().position(|&c| c == b'=')?;
    Some(&text[eq + 1..])
}

struct Cursor<'a> {
    text: &'a [u8],
    pos: usize,
    element: Scalar,
}

impl<'a> Cursor<'a> {
    #[inline]
    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    #[inline]
    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn array(&mut self, depth: usize) -> Option<Vec<Value>> {
        if depth >= MAX_DEPTH || self.bump()? != b'{' {
            return None;
        }
        let mut items = Vec::new();
        if self.peek()? == b'}' {
            self.pos += 1;
            return Some(items);
        }
        loop {
            let item = match self.peek()? {
                b'{' => Value::Array(self.array(depth + 1)?),
                b'"' => {
                    let raw = self.quoted()?;
                    self.element.decode(&raw)
                }
                _ => {
                    let token = self.bare()?;
                    if token == b"NULL" {
                        Value::Null
                    } else {
                        self.element.decode(token)
                    }
                }
            };
            items.push(item);
            match self.bump()? {
                b',' => continue,
                b'}' => return Some(items),
                _ => return None,
            }
        }
    }

    /// Consume a quoted element and return its un-escaped content.
    fn quoted(&mut self) -> Option<Vec<u8>> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.bump()? {
                b'\\' => out.push(self.bump()?),
                b'"' => return Some(out),
                c => out.push(c),
            }
        }
    }

    /// Consume an unquoted element up to (not including) its delimiter.
    fn bare(&mut self) -> Option<&'a [u8]> {
        let start = self.pos;
        loop {
            match self.peek()? {
                b',' | b'}' => return Some(&self.text[start..self.pos]),
                b'{' | b'"' => return None,
                _ => self.pos += 1,
            }
        }
    }
}
