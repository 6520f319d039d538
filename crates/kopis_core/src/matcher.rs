//! Compiled header/footer matchers.

use regex::bytes::{Regex, RegexBuilder};

use crate::pattern::LiteralPattern;

/// Longest regex match reported. Longer matches are clipped to this many
/// bytes, and the chunk overlap is sized from it.
pub const REGEX_MATCH_WINDOW: usize = 256;

/// Literal matcher using a Boyer-Moore-Horspool skip table.
///
/// The table is built once and reused for every buffer. Case folding is ASCII
/// only; wildcard positions match any byte.
#[derive(Debug, Clone)]
pub struct LiteralMatcher {
    pattern: LiteralPattern,
    case_sensitive: bool,
    skip: [usize; 256],
}

impl LiteralMatcher {
    pub fn new(pattern: LiteralPattern, case_sensitive: bool) -> Self {
        let len = pattern.len();
        let mut skip = [len.max(1); 256];

        for i in 0..len.saturating_sub(1) {
            let shift = len - 1 - i;
            if pattern.is_wildcard(i) {
                for entry in skip.iter_mut() {
                    *entry = (*entry).min(shift);
                }
                continue;
            }
            let b = pattern.bytes()[i];
            skip[b as usize] = skip[b as usize].min(shift);
            if !case_sensitive {
                let lower = b.to_ascii_lowercase() as usize;
                let upper = b.to_ascii_uppercase() as usize;
                skip[lower] = skip[lower].min(shift);
                skip[upper] = skip[upper].min(shift);
            }
        }

        Self {
            pattern,
            case_sensitive,
            skip,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    pub fn pattern(&self) -> &LiteralPattern {
        &self.pattern
    }

    #[inline]
    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn skip_table(&self) -> &[usize; 256] {
        &self.skip
    }

    /// Compares the pattern against `window`, which must be exactly as long
    /// as the pattern. Compares right to left like the search loop.
    #[inline]
    pub fn matches_at(&self, window: &[u8]) -> bool {
        let bytes = self.pattern.bytes();
        (0..bytes.len()).rev().all(|j| {
            self.pattern.is_wildcard(j)
                || bytes[j] == window[j]
                || (!self.case_sensitive && bytes[j].eq_ignore_ascii_case(&window[j]))
        })
    }

    /// Calls `f(start)` for every occurrence, overlapping ones included.
    pub fn for_each_match<F>(&self, haystack: &[u8], mut f: F)
    where
        F: FnMut(usize),
    {
        let len = self.len();
        if len == 0 || haystack.len() < len {
            return;
        }

        let mut pos = 0;
        while pos + len <= haystack.len() {
            if self.matches_at(&haystack[pos..pos + len]) {
                f(pos);
                pos += 1;
            } else {
                pos += self.skip[haystack[pos + len - 1] as usize];
            }
        }
    }

    pub fn find_all(&self, haystack: &[u8]) -> Vec<usize> {
        let mut out = Vec::new();
        self.for_each_match(haystack, |pos| out.push(pos));
        out
    }
}

#[derive(Debug, Clone)]
pub struct RegexMatcher {
    source: String,
    regex: Regex,
}

impl RegexMatcher {
    /// Compiles `source` (without delimiters) for byte-oriented matching.
    pub fn new(source: &str, case_sensitive: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(source)
            .unicode(false)
            .case_insensitive(!case_sensitive)
            .build()?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Calls `f(start, len)` for every non-empty match, trying every start
    /// position so overlapping matches are reported too.
    ///
    /// A match only sees the [`REGEX_MATCH_WINDOW`] bytes from its start, so
    /// greedy matches are clipped to that length and the result for a start
    /// does not depend on how far the haystack extends past the window.
    pub fn for_each_match<F>(&self, haystack: &[u8], mut f: F)
    where
        F: FnMut(usize, usize),
    {
        let len = haystack.len();
        let mut pos = 0;
        while pos < len {
            // Any match starting in [pos, pos + W) fits in [pos, pos + 2W).
            let limit = (pos + 2 * REGEX_MATCH_WINDOW).min(len);
            let start = match self.regex.find_at(&haystack[..limit], pos) {
                Some(m) if m.start() < pos + REGEX_MATCH_WINDOW => m.start(),
                None if limit == len => break,
                _ => {
                    pos += REGEX_MATCH_WINDOW;
                    continue;
                }
            };

            let end = (start + REGEX_MATCH_WINDOW).min(len);
            if let Some(m) = self.regex.find_at(&haystack[..end], start) {
                if m.start() == start && m.end() > start {
                    f(start, m.end() - start);
                }
            }
            pos = start + 1;
        }
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Literal(LiteralMatcher),
    Regex(RegexMatcher),
}

impl Matcher {
    /// Calls `f(start, len)` for every occurrence in `haystack`.
    pub fn for_each_match<F>(&self, haystack: &[u8], mut f: F)
    where
        F: FnMut(usize, usize),
    {
        match self {
            Matcher::Literal(m) => {
                let len = m.len();
                m.for_each_match(haystack, |pos| f(pos, len));
            }
            Matcher::Regex(m) => m.for_each_match(haystack, f),
        }
    }

    #[inline]
    pub fn is_regex(&self) -> bool {
        matches!(self, Matcher::Regex(_))
    }

    pub fn as_literal(&self) -> Option<&LiteralMatcher> {
        match self {
            Matcher::Literal(m) => Some(m),
            Matcher::Regex(_) => None,
        }
    }

    /// Number of bytes a match may span, for overlap sizing.
    pub fn window(&self) -> usize {
        match self {
            Matcher::Literal(m) => m.len(),
            Matcher::Regex(_) => REGEX_MATCH_WINDOW,
        }
    }

    /// Length of a literal match; `None` for regexes, whose matches vary.
    pub fn fixed_len(&self) -> Option<usize> {
        self.as_literal().map(LiteralMatcher::len)
    }
}
