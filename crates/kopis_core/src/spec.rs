//! Compilation of carving rules.
//!
//! A rule line reads `suffix case length header [footer] [direction]`, for
//! example:
//!
//! ```text
//! jpg  y  200000000  \xff\xd8\xff\xe0\x00\x10  \xff\xd9
//! htm  n  50000      <html                      </html>
//! pdf  y  5000000    %PDF                       %EOF\x0d  REVERSE
//! ```
//!
//! [`SpecCompiler::compile_str`] handles the surrounding file syntax (comments,
//! blank lines and `wildcard` directives) and produces a [`SpecSet`].

use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::matcher::{LiteralMatcher, Matcher, RegexMatcher};
use crate::pattern::{self, MAX_PATTERN_LENGTH};

pub const MAX_FILE_TYPES: usize = 100;

/// Suffix value meaning "write carved files without an extension".
pub const NO_EXTENSION: &str = "NONE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub enum SearchDirection {
    /// First footer after the header, footer included.
    #[default]
    Forward,
    /// Farthest footer inside the header's window, footer included.
    Reverse,
    /// First footer after the header, footer excluded.
    Next,
}

impl SearchDirection {
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "FORWARD" => Some(Self::Forward),
            "REVERSE" => Some(Self::Reverse),
            "NEXT" => Some(Self::Next),
            _ => None,
        }
    }

    /// Whether the footer bytes belong to the carved file.
    #[inline]
    pub fn includes_footer(self) -> bool {
        !matches!(self, Self::Next)
    }
}

impl fmt::Display for SearchDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "FORWARD"),
            Self::Reverse => write!(f, "REVERSE"),
            Self::Next => write!(f, "NEXT"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatternSpec {
    pub suffix: String,
    pub case_sensitive: bool,
    pub min_len: u64,
    pub max_len: u64,
    pub direction: SearchDirection,
    pub header: Matcher,
    pub footer: Option<Matcher>,
}

impl PatternSpec {
    /// Name used in logs and reports.
    pub fn type_name(&self) -> &str {
        &self.suffix
    }

    /// Extension for carved files, `None` when the rule asks for none.
    pub fn extension(&self) -> Option<&str> {
        if self.suffix.eq_ignore_ascii_case(NO_EXTENSION) {
            None
        } else {
            Some(&self.suffix)
        }
    }

    pub fn has_footer(&self) -> bool {
        self.footer.is_some()
    }

    pub fn uses_regex(&self) -> bool {
        self.header.is_regex() || self.footer.as_ref().is_some_and(Matcher::is_regex)
    }

    /// Widest match either pattern can produce.
    pub fn window(&self) -> usize {
        let footer = self.footer.as_ref().map_or(0, Matcher::window);
        self.header.window().max(footer)
    }
}

/// The compiled rule set, read-only once built.
#[derive(Debug, Clone, Default)]
pub struct SpecSet {
    specs: Vec<PatternSpec>,
}

impl SpecSet {
    pub fn new(specs: Vec<PatternSpec>) -> Result<Self> {
        if specs.len() > MAX_FILE_TYPES {
            return Err(CoreError::TooManyFileTypes {
                max: MAX_FILE_TYPES,
            });
        }
        Ok(Self { specs })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&PatternSpec> {
        self.specs.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PatternSpec> {
        self.specs.iter()
    }

    pub fn has_regex(&self) -> bool {
        self.specs.iter().any(PatternSpec::uses_regex)
    }

    pub fn max_window(&self) -> usize {
        self.specs.iter().map(PatternSpec::window).max().unwrap_or(0)
    }

    /// Bytes each chunk repeats from the end of its predecessor.
    pub fn overlap(&self) -> usize {
        self.max_window().saturating_sub(1)
    }
}

impl std::ops::Index<usize> for SpecSet {
    type Output = PatternSpec;

    fn index(&self, index: usize) -> &PatternSpec {
        &self.specs[index]
    }
}

impl<'a> IntoIterator for &'a SpecSet {
    type Item = &'a PatternSpec;
    type IntoIter = std::slice::Iter<'a, PatternSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.specs.iter()
    }
}

#[derive(Debug, Clone)]
pub struct SpecCompiler {
    wildcard: u8,
}

impl Default for SpecCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecCompiler {
    pub fn new() -> Self {
        Self {
            wildcard: pattern::DEFAULT_WILDCARD,
        }
    }

    pub fn wildcard(&self) -> u8 {
        self.wildcard
    }

    pub fn set_wildcard(&mut self, wildcard: u8) {
        self.wildcard = wildcard;
    }

    /// Compiles one rule line. `line_no` is only used in error messages.
    pub fn compile(&self, line_no: usize, line: &str) -> Result<PatternSpec> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !(4..=6).contains(&tokens.len()) {
            return Err(CoreError::config(
                line_no,
                format!("expected 4 to 6 fields, found {}", tokens.len()),
            ));
        }

        let suffix = tokens[0].to_string();
        let case_sensitive = tokens[1].starts_with(['y', 'Y']);
        let (min_len, max_len) = parse_length(line_no, tokens[2])?;

        let header = self.compile_pattern(line_no, tokens[3], case_sensitive, "header")?;
        let footer = match tokens.get(4) {
            Some(tok) => Some(self.compile_pattern(line_no, tok, case_sensitive, "footer")?),
            None => None,
        };
        let direction = match tokens.get(5) {
            Some(tok) => SearchDirection::parse(tok).ok_or_else(|| {
                CoreError::config(line_no, format!("unknown search direction {tok:?}"))
            })?,
            None => SearchDirection::Forward,
        };

        Ok(PatternSpec {
            suffix,
            case_sensitive,
            min_len,
            max_len,
            direction,
            header,
            footer,
        })
    }

    fn compile_pattern(
        &self,
        line_no: usize,
        token: &str,
        case_sensitive: bool,
        role: &str,
    ) -> Result<Matcher> {
        if pattern::is_regex_token(token) {
            let source = &token[1..token.len() - 1];
            return RegexMatcher::new(source, case_sensitive)
                .map(Matcher::Regex)
                .map_err(|e| CoreError::config(line_no, format!("invalid {role} regex: {e}")));
        }

        let literal = pattern::translate(token, self.wildcard);
        if literal.is_empty() || literal.len() > MAX_PATTERN_LENGTH {
            return Err(CoreError::config(
                line_no,
                format!(
                    "{role} is {} bytes long, must be 1 to {MAX_PATTERN_LENGTH}",
                    literal.len()
                ),
            ));
        }
        Ok(Matcher::Literal(LiteralMatcher::new(
            literal,
            case_sensitive,
        )))
    }

    /// Compiles a whole configuration text.
    pub fn compile_str(&mut self, text: &str) -> Result<SpecSet> {
        let mut specs = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(value) = wildcard_directive(line) {
                if value.len() > 1 {
                    warn!(line = line_no, value, "wildcard longer than one character, using the first");
                }
                self.wildcard = value.as_bytes()[0];
                debug!(line = line_no, wildcard = %char::from(self.wildcard), "wildcard changed");
                continue;
            }

            if specs.len() == MAX_FILE_TYPES {
                return Err(CoreError::TooManyFileTypes {
                    max: MAX_FILE_TYPES,
                });
            }
            specs.push(self.compile(line_no, line)?);
        }

        debug!(types = specs.len(), "configuration compiled");
        SpecSet::new(specs)
    }

    pub fn compile_file(&mut self, path: impl AsRef<Path>) -> Result<SpecSet> {
        let text = fs::read_to_string(path.as_ref())?;
        self.compile_str(&text)
    }
}

/// Returns the value of a `wildcard <c>` line.
fn wildcard_directive(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some(key), Some(value), None) if key.eq_ignore_ascii_case("wildcard") => Some(value),
        _ => None,
    }
}

fn parse_length(line_no: usize, token: &str) -> Result<(u64, u64)> {
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| CoreError::config(line_no, format!("invalid length {token:?}")))
    };

    let (min, max) = match token.split_once(':') {
        Some((min, max)) => (parse(min)?, parse(max)?),
        None => (0, parse(token)?),
    };

    if max == 0 {
        return Err(CoreError::config(line_no, "maximum length must be positive"));
    }
    if min > max {
        return Err(CoreError::config(
            line_no,
            format!("minimum length {min} exceeds maximum {max}"),
        ));
    }
    Ok((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(line: &str) -> Result<PatternSpec> {
        SpecCompiler::new().compile(1, line)
    }

    #[test]
    fn full_line() {
        let spec = compile(r"pdf y 100:5000000 %PDF %EOF\x0d REVERSE").unwrap();
        assert_eq!(spec.suffix, "pdf");
        assert!(spec.case_sensitive);
        assert_eq!((spec.min_len, spec.max_len), (100, 5_000_000));
        assert_eq!(spec.direction, SearchDirection::Reverse);
        assert_eq!(spec.header.fixed_len(), Some(4));
        assert_eq!(spec.footer.as_ref().and_then(Matcher::fixed_len), Some(5));
    }

    #[test]
    fn header_only_line() {
        let spec = compile("bmp n 100000 BM").unwrap();
        assert!(!spec.case_sensitive);
        assert_eq!(spec.min_len, 0);
        assert!(!spec.has_footer());
        assert_eq!(spec.direction, SearchDirection::Forward);
    }

    #[test]
    fn direction_is_case_insensitive() {
        let spec = compile("txt y 100 a b next").unwrap();
        assert_eq!(spec.direction, SearchDirection::Next);
        assert!(!spec.direction.includes_footer());
    }

    #[test]
    fn rejects_bad_token_count() {
        let err = compile("jpg y 100").unwrap_err();
        assert!(err.is_config());
        assert!(compile("a y 1 b c FORWARD extra").is_err());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(compile("a y 10:5 x y").is_err());
        assert!(compile("a y 0 x y").is_err());
        assert!(compile("a y ten x y").is_err());
        assert!(compile("a y 1:x x y").is_err());
    }

    #[test]
    fn rejects_unknown_direction() {
        let err = compile("a y 10 x y SIDEWAYS").unwrap_err();
        assert!(matches!(err, CoreError::Config { line: 1, .. }));
    }

    #[test]
    fn rejects_long_literal() {
        assert!(compile("a y 10 0123456789abcdefghijk").is_err());
        assert!(compile("a y 10 0123456789abcdefghij").is_ok());
    }

    #[test]
    fn regex_patterns() {
        let spec = compile(r"htm n 5000 /<html[ >]/ /html>/").unwrap();
        assert!(spec.uses_regex());
        assert_eq!(spec.window(), crate::matcher::REGEX_MATCH_WINDOW);
        assert!(compile("a y 10 /([/ b").is_err());
    }

    #[test]
    fn extension_none() {
        let spec = compile("NONE y 10 abc").unwrap();
        assert_eq!(spec.extension(), None);
        let spec = compile("gif y 10 abc").unwrap();
        assert_eq!(spec.extension(), Some("gif"));
    }

    #[test]
    fn compile_str_handles_comments_and_wildcard() {
        let text = "# comment\r\n\r\n  gif y 5000000 GIF8?a \\x00\\x3b\r\nwildcard *\r\nzip y 100 PK*\\x04\r\n";
        let mut compiler = SpecCompiler::new();
        let set = compiler.compile_str(text).unwrap();
        assert_eq!(set.len(), 2);
        let gif = set[0].header.as_literal().unwrap();
        assert!(gif.pattern().is_wildcard(4));
        let zip = set[1].header.as_literal().unwrap();
        assert!(zip.pattern().is_wildcard(2));
        assert_eq!(set.max_window(), 6);
        assert_eq!(set.overlap(), 5);
    }

    #[test]
    fn error_reports_line_number() {
        let text = "a y 10 x\n\nb y oops x\n";
        let err = SpecCompiler::new().compile_str(text).unwrap_err();
        assert!(matches!(err, CoreError::Config { line: 3, .. }));
    }

    #[test]
    fn too_many_types() {
        let text: String = (0..=MAX_FILE_TYPES)
            .map(|i| format!("t{i} y 10 abc\n"))
            .collect();
        let err = SpecCompiler::new().compile_str(&text).unwrap_err();
        assert!(matches!(err, CoreError::TooManyFileTypes { .. }));
    }

    #[test]
    fn compile_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kopis.conf");
        fs::write(&path, "jpg y 1000 \\xff\\xd8 \\xff\\xd9\n").unwrap();
        let set = SpecCompiler::new().compile_file(&path).unwrap();
        assert_eq!(set.len(), 1);
        assert!(!set.has_regex());
    }
}
