//! Wildcard patterns for paths, hosts and header values.
//!
//! Hosts compare case-insensitively; paths and header values are exact.
//!
//! `*` matches any sequence of characters (including empty); everything else
//! is literal. No regex on these fields keeps matching linear in practice.

/// A compiled wildcard pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatcher {
    pattern: String,
    segments: Vec<Segment>,
    case_insensitive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

impl PatternMatcher {
    /// Case-sensitive pattern.
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            segments: compile(pattern),
            case_insensitive: false,
        }
    }

    /// Pattern compared against lowercased input (hosts).
    pub fn case_insensitive(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            segments: compile(&pattern.to_lowercase()),
            case_insensitive: true,
        }
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.case_insensitive {
            match_segments(&self.segments, &text.to_lowercase())
        } else {
            match_segments(&self.segments, text)
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

fn compile(pattern: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();

    for ch in pattern.chars() {
        if ch == '*' {
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            // Consecutive wildcards collapse into one
            if !matches!(segments.last(), Some(Segment::Wildcard)) {
                segments.push(Segment::Wildcard);
            }
        } else {
            literal.push(ch);
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn match_segments(segments: &[Segment], text: &str) -> bool {
    match segments.first() {
        None => text.is_empty(),
        Some(Segment::Literal(lit)) => text
            .strip_prefix(lit.as_str())
            .map(|rest| match_segments(&segments[1..], rest))
            .unwrap_or(false),
        Some(Segment::Wildcard) => {
            let rest = &segments[1..];
            if rest.is_empty() {
                return true;
            }
            text.char_indices()
                .map(|(idx, _)| idx)
                .chain(std::iter::once(text.len()))
                .any(|idx| match_segments(rest, &text[idx..]))
        }
    }
}
