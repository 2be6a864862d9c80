//! Rule matchers: a sealed set of tagged variants with explicit dispatch.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Matcher as written in a rule file, before compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatcherSpec {
    /// Case-insensitive substring search over the canonical dumped form.
    Substring { pattern: String },
    /// Regular expression over the canonical dumped form.
    Regex { pattern: String },
    /// Case-insensitive substring search within the values of one header.
    /// Only meaningful for HTTP subjects; other subjects have no headers.
    Header { name: String, pattern: String },
    /// Case-insensitive substring search within the body section. Matches
    /// record a hash of the whole body they were found in.
    Body { pattern: String },
}

/// A compiled, ready-to-run matcher.
#[derive(Debug, Clone)]
pub enum Matcher {
    Substring { pattern: String },
    Regex { regex: Regex },
    Header { name: String, pattern: String },
    Body { pattern: String },
}

impl Matcher {
    /// Compile a matcher spec. Fails only on an invalid regular expression.
    pub fn compile(spec: &MatcherSpec) -> Result<Self, regex::Error> {
        Ok(match spec {
            MatcherSpec::Substring { pattern } => Matcher::Substring {
                pattern: pattern.clone(),
            },
            MatcherSpec::Regex { pattern } => Matcher::Regex {
                regex: Regex::new(pattern)?,
            },
            MatcherSpec::Header { name, pattern } => Matcher::Header {
                name: name.clone(),
                pattern: pattern.clone(),
            },
            MatcherSpec::Body { pattern } => Matcher::Body {
                pattern: pattern.clone(),
            },
        })
    }
}

/// The subject a matcher runs against.
///
/// For HTTP this is the canonical dump with the body section marked; for
/// WebSocket messages and TCP chunks the payload is both the text and the
/// body, starting at line 0.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub text: &'a str,
    pub body: &'a [u8],
    /// Line index at which the body starts within `text`.
    pub body_line_offset: usize,
}

impl<'a> Subject<'a> {
    /// A raw-payload subject (WebSocket message, TCP chunk).
    pub fn raw(text: &'a str, body: &'a [u8]) -> Self {
        Self {
            text,
            body,
            body_line_offset: 0,
        }
    }
}

/// One location where a matcher fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchHit {
    pub line: i64,
    pub line_index: i64,
    pub length: i64,
    pub matched: String,
    /// `(hash, algorithm)` of the body the match was found in, when the
    /// matcher hashes bodies.
    pub body_hash: Option<(String, String)>,
}

impl Matcher {
    /// Run the matcher against a subject, returning every hit in match
    /// order.
    pub fn evaluate(&self, subject: &Subject<'_>) -> Vec<MatchHit> {
        match self {
            Matcher::Substring { pattern } => find_all_ci(subject.text, pattern)
                .into_iter()
                .map(|offset| {
                    let (line, line_index) = line_location(subject.text, offset);
                    MatchHit {
                        line,
                        line_index,
                        length: pattern.len() as i64,
                        matched: subject.text[offset..offset + pattern.len()].to_string(),
                        body_hash: None,
                    }
                })
                .collect(),
            Matcher::Regex { regex } => regex
                .find_iter(subject.text)
                .map(|m| {
                    let (line, line_index) = line_location(subject.text, m.start());
                    MatchHit {
                        line,
                        line_index,
                        length: m.len() as i64,
                        matched: m.as_str().to_string(),
                        body_hash: None,
                    }
                })
                .collect(),
            Matcher::Header { name, pattern } => {
                let mut hits = Vec::new();
                for (line_no, line) in subject
                    .text
                    .split('\n')
                    .take(subject.body_line_offset)
                    .enumerate()
                {
                    let Some((header_name, value)) = line.split_once(": ") else {
                        continue;
                    };
                    if !header_name.eq_ignore_ascii_case(name) {
                        continue;
                    }
                    let value_start = header_name.len() + 2;
                    for offset in find_all_ci(value, pattern) {
                        hits.push(MatchHit {
                            line: line_no as i64,
                            line_index: (value_start + offset) as i64,
                            length: pattern.len() as i64,
                            matched: value[offset..offset + pattern.len()].to_string(),
                            body_hash: None,
                        });
                    }
                }
                hits
            }
            Matcher::Body { pattern } => {
                if subject.body.is_empty() {
                    return Vec::new();
                }
                let body_text = String::from_utf8_lossy(subject.body);
                let hash = format!("{:x}", Sha256::digest(subject.body));
                find_all_ci(&body_text, pattern)
                    .into_iter()
                    .map(|offset| {
                        let (line, line_index) = line_location(&body_text, offset);
                        MatchHit {
                            line: subject.body_line_offset as i64 + line,
                            line_index,
                            length: pattern.len() as i64,
                            matched: body_text[offset..offset + pattern.len()].to_string(),
                            body_hash: Some((hash.clone(), "sha256".to_string())),
                        }
                    })
                    .collect()
            }
        }
    }
}

/// Byte offsets of every case-insensitive (ASCII) occurrence of `needle` in
/// `haystack`, in order. Empty needles never match.
fn find_all_ci(haystack: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    let hay = haystack.as_bytes();
    let pat = needle.as_bytes();
    let mut offsets = Vec::new();
    for start in 0..=hay.len() - pat.len() {
        if hay[start..start + pat.len()].eq_ignore_ascii_case(pat)
            && haystack.is_char_boundary(start)
            && haystack.is_char_boundary(start + pat.len())
        {
            offsets.push(start);
        }
    }
    offsets
}

/// Locate a byte offset as (LF-split line number, byte offset within line).
fn line_location(text: &str, offset: usize) -> (i64, i64) {
    let before = &text.as_bytes()[..offset];
    let line = before.iter().filter(|b| **b == b'\n').count();
    let line_start = before
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    (line as i64, (offset - line_start) as i64)
}
