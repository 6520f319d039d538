//! Literal pattern translation.
//!
//! Configuration files write binary signatures as text: backslash escapes
//! stand for arbitrary bytes and one configurable character acts as a
//! single-byte wildcard. [`translate`] turns such text into the raw bytes the
//! matchers work on.

pub const MAX_PATTERN_LENGTH: usize = 20;
pub const DEFAULT_WILDCARD: u8 = b'?';

/// Regex patterns are delimited by this character on both ends.
pub const REGEX_DELIMITER: u8 = b'/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralPattern {
    bytes: Vec<u8>,
    wildcards: Vec<bool>,
}

impl LiteralPattern {
    /// Builds a pattern without wildcard positions.
    pub fn exact(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            wildcards: vec![false; bytes.len()],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn is_wildcard(&self, i: usize) -> bool {
        self.wildcards[i]
    }

    pub fn wildcards(&self) -> &[bool] {
        &self.wildcards
    }

    pub fn has_wildcards(&self) -> bool {
        self.wildcards.iter().any(|&w| w)
    }

    fn push(&mut self, byte: u8, wildcard: bool) {
        self.bytes.push(byte);
        self.wildcards.push(wildcard);
    }
}

/// Returns true when `token` is written as `/regex/`.
pub fn is_regex_token(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() >= 3 && b[0] == REGEX_DELIMITER && b[b.len() - 1] == REGEX_DELIMITER
}

/// Expands escapes and the wildcard character of `text`.
///
/// Supported escapes: `\\`, `\a`, `\b`, `\f`, `\n`, `\r`, `\t`, `\v`, `\s`
/// (space), `\xHH` and `\ooo` (three octal digits). Any other escaped
/// character stands for itself, which is also how an escaped wildcard
/// character is written literally.
pub fn translate(text: &str, wildcard: u8) -> LiteralPattern {
    let src = text.as_bytes();
    let mut out = LiteralPattern {
        bytes: Vec::with_capacity(src.len()),
        wildcards: Vec::with_capacity(src.len()),
    };
    let mut i = 0;

    while i < src.len() {
        let c = src[i];
        if c != b'\\' {
            out.push(c, c == wildcard);
            i += 1;
            continue;
        }

        let Some(&next) = src.get(i + 1) else {
            out.push(b'\\', false);
            break;
        };

        let (byte, consumed) = match next {
            b'\\' => (b'\\', 2),
            b'a' => (0x07, 2),
            b'b' => (0x08, 2),
            b'f' => (0x0C, 2),
            b'n' => (b'\n', 2),
            b'r' => (b'\r', 2),
            b't' => (b'\t', 2),
            b'v' => (0x0B, 2),
            b's' => (b' ', 2),
            b'x' | b'X' => match hex_pair(src.get(i + 2..i + 4)) {
                Some(v) => (v, 4),
                None => (next, 2),
            },
            b'0'..=b'7' => match octal_triple(src.get(i + 1..i + 4)) {
                Some(v) => (v, 4),
                None => (next, 2),
            },
            other => (other, 2),
        };
        out.push(byte, false);
        i += consumed;
    }

    out
}

fn hex_pair(digits: Option<&[u8]>) -> Option<u8> {
    let digits = digits?;
    let s = std::str::from_utf8(digits).ok()?;
    u8::from_str_radix(s, 16).ok()
}

fn octal_triple(digits: Option<&[u8]>) -> Option<u8> {
    let digits = digits?;
    if !digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
        return None;
    }
    let s = std::str::from_utf8(digits).ok()?;
    u16::from_str_radix(s, 8).ok().and_then(|v| u8::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_copied() {
        let p = translate("PK", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), b"PK");
        assert!(!p.has_wildcards());
    }

    #[test]
    fn hex_escapes() {
        let p = translate(r"\xff\xd8\xFF\xe0", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(p.len(), 4);
    }

    #[test]
    fn octal_and_named_escapes() {
        let p = translate(r"\101\s\n\t\\", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), b"A \n\t\\");
    }

    #[test]
    fn octal_out_of_byte_range_is_literal_digit() {
        let p = translate(r"\777", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), b"777");
    }

    #[test]
    fn wildcard_positions_are_marked() {
        let p = translate("GIF8?a", DEFAULT_WILDCARD);
        assert_eq!(p.len(), 6);
        assert_eq!(p.wildcards(), &[false, false, false, false, true, false]);
    }

    #[test]
    fn escaped_wildcard_is_literal() {
        let p = translate(r"a\?b", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), b"a?b");
        assert!(!p.has_wildcards());
    }

    #[test]
    fn custom_wildcard() {
        let p = translate("ab*", b'*');
        assert!(p.is_wildcard(2));
        let q = translate("ab?", b'*');
        assert!(!q.has_wildcards());
    }

    #[test]
    fn malformed_hex_keeps_letter() {
        let p = translate(r"\xZZ", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), b"xZZ");
    }

    #[test]
    fn trailing_backslash() {
        let p = translate("ab\\", DEFAULT_WILDCARD);
        assert_eq!(p.bytes(), b"ab\\");
    }

    #[test]
    fn regex_tokens() {
        assert!(is_regex_token("/abc/"));
        assert!(!is_regex_token("//"));
        assert!(!is_regex_token("abc"));
        assert!(!is_regex_token("/abc"));
    }
}
