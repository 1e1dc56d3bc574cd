#![forbid(unsafe_code)]
//! Text field encoding and line tokenizing shared by the operation log codecs.

pub mod field {
    //! Fixed-width hex fields as they appear on the wire.
    //!
    //! Integers are written as upper-case hex padded to their natural width,
    //! object ids as 32 lower-case digits and strings as the hex of their
    //! UTF-8 bytes (`-` stands for the empty string).

    use std::fmt::Write as _;

    use crate::types::ObjectId;

    /// Token used for an empty string field.
    pub const EMPTY_STRING: &[u8] = b"-";

    fn put_fmt(dst: &mut Vec<u8>, args: std::fmt::Arguments<'_>) {
        let mut text = String::with_capacity(16);
        // Writing into a String cannot fail.
        let _ = text.write_fmt(args);
        dst.extend_from_slice(text.as_bytes());
    }

    /// Two upper-case hex digits.
    pub fn put_u8(dst: &mut Vec<u8>, v: u8) {
        put_fmt(dst, format_args!("{v:02X}"));
    }

    pub fn put_u16(dst: &mut Vec<u8>, v: u16) {
        put_fmt(dst, format_args!("{v:04X}"));
    }

    pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
        put_fmt(dst, format_args!("{v:08X}"));
    }

    pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
        put_fmt(dst, format_args!("{v:016X}"));
    }

    pub fn put_obid(dst: &mut Vec<u8>, id: ObjectId) {
        put_fmt(dst, format_args!("{id}"));
    }

    /// Hex of the UTF-8 bytes, or `-` when empty.
    pub fn put_string(dst: &mut Vec<u8>, s: &str) {
        if s.is_empty() {
            dst.extend_from_slice(EMPTY_STRING);
        } else {
            dst.extend_from_slice(hex::encode(s.as_bytes()).as_bytes());
        }
    }

    fn parse_radix(token: &[u8], max_digits: usize) -> Option<u64> {
        if token.is_empty() || token.len() > max_digits {
            return None;
        }
        let text = std::str::from_utf8(token).ok()?;
        u64::from_str_radix(text, 16).ok()
    }

    /// At most two hex digits; wider tokens are rejected.
    pub fn parse_u8(token: &[u8]) -> Option<u8> {
        parse_radix(token, 2).map(|v| v as u8)
    }

    pub fn parse_u16(token: &[u8]) -> Option<u16> {
        parse_radix(token, 4).map(|v| v as u16)
    }

    pub fn parse_u32(token: &[u8]) -> Option<u32> {
        parse_radix(token, 8).map(|v| v as u32)
    }

    pub fn parse_u64(token: &[u8]) -> Option<u64> {
        parse_radix(token, 16)
    }

    /// Exactly 32 hex digits.
    pub fn parse_obid(token: &[u8]) -> Option<ObjectId> {
        ObjectId::parse_hex(token)
    }

    /// Inverse of [`put_string`]; `None` for invalid hex or UTF-8.
    pub fn parse_string(token: &[u8]) -> Option<String> {
        if token == EMPTY_STRING {
            return Some(String::new());
        }
        let raw = hex::decode(token).ok()?;
        String::from_utf8(raw).ok()
    }
}

pub mod line {
    //! Whitespace tokenizer for protocol lines.

    /// Splits a line into space separated tokens, stopping at a `#` comment.
    pub struct Tokens<'a> {
        line: &'a [u8],
        pos: usize,
    }

    impl<'a> Tokens<'a> {
        pub fn new(line: &'a [u8]) -> Self {
            Self { line, pos: 0 }
        }

        /// Byte offset of the next unread token.
        pub fn position(&self) -> usize {
            self.pos
        }

        /// Remaining tokens, collected.
        pub fn rest(&mut self) -> Vec<&'a [u8]> {
            self.by_ref().collect()
        }
    }

    impl<'a> Iterator for Tokens<'a> {
        type Item = &'a [u8];

        fn next(&mut self) -> Option<&'a [u8]> {
            let line = self.line;
            while self.pos < line.len() && line[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos >= line.len() || line[self.pos] == b'#' {
                self.pos = line.len();
                return None;
            }
            let start = self.pos;
            while self.pos < line.len() && !line[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            Some(&line[start..self.pos])
        }
    }

    /// True for lines holding only whitespace and/or a comment.
    pub fn is_blank_or_comment(line: &[u8]) -> bool {
        Tokens::new(line).next().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::field::*;
    use super::line::*;
    use crate::types::ObjectId;

    #[test]
    fn integer_fields_are_fixed_width() {
        let mut out = Vec::new();
        put_u8(&mut out, 0x0a);
        out.push(b' ');
        put_u32(&mut out, 0x1000000C);
        out.push(b' ');
        put_u64(&mut out, 1);
        assert_eq!(out, b"0A 1000000C 0000000000000001");
    }

    #[test]
    fn parse_rejects_oversized_tokens() {
        assert_eq!(parse_u8(b"FF"), Some(0xff));
        assert_eq!(parse_u8(b"100"), None);
        assert_eq!(parse_u32(b"zz"), None);
        assert_eq!(parse_u64(b"00000000000000010"), None);
    }

    #[test]
    fn string_fields_hex_encode() {
        let mut out = Vec::new();
        put_string(&mut out, "a b");
        assert_eq!(out, b"612062");
        assert_eq!(parse_string(&out).as_deref(), Some("a b"));
        out.clear();
        put_string(&mut out, "");
        assert_eq!(parse_string(&out).as_deref(), Some(""));
    }

    #[test]
    fn obid_field_roundtrip() {
        let id = ObjectId::from_name("graph");
        let mut out = Vec::new();
        put_obid(&mut out, id);
        assert_eq!(parse_obid(&out), Some(id));
    }

    #[test]
    fn tokens_stop_at_comment() {
        let mut tokens = Tokens::new(b"    vxn 1000110C 41 # alice\n");
        assert_eq!(tokens.next(), Some(&b"vxn"[..]));
        assert_eq!(tokens.rest(), vec![&b"1000110C"[..], &b"41"[..]]);
        assert!(is_blank_or_comment(b"  # only a comment\n"));
        assert!(is_blank_or_comment(b"\n"));
    }
}
