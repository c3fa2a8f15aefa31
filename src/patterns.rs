// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface-name glob matching and the config-file format that feeds it.
//!
//! Patterns are shell-style globs (`*`, `?`, `[...]` classes, with `!` for
//! negation inside a class). A name is "managed" if it matches any
//! pattern in the set. A one-entry memo of the most recently matching
//! pattern short-circuits repeat lookups for the same hot interface.

use crate::error::{DaemonError, Result};
use std::io::{BufRead, BufReader};

/// A name-matching glob is malformed (e.g. an unclosed `[` class).
#[derive(Debug)]
struct MalformedGlob;

/// Ordered set of interface-name patterns, with a most-recently-matched
/// cache. Built once at startup; read-only during the event loop except
/// for cache updates.
#[derive(Default)]
pub struct PatternSet {
    patterns: Vec<String>,
    memo: Option<usize>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pattern, after validating it glob-evaluates cleanly
    /// against a sentinel interface name. Empty strings are ignored (a
    /// blank config line is not an error).
    pub fn push(&mut self, pattern: &str) -> Result<()> {
        if pattern.is_empty() {
            return Ok(());
        }

        if glob_match(pattern, "eth0").is_err() {
            return Err(DaemonError::InvalidPattern {
                source: "-i".to_string(),
                pattern: pattern.to_string(),
            });
        }

        self.patterns.push(pattern.to_string());
        Ok(())
    }

    /// Does `name` match any pattern in the set?
    pub fn matches(&mut self, name: &str) -> bool {
        if let Some(idx) = self.memo {
            if let Some(pat) = self.patterns.get(idx) {
                if glob_match(pat, name).unwrap_or(false) {
                    return true;
                }
            }
        }

        for (idx, pat) in self.patterns.iter().enumerate() {
            if glob_match(pat, name).unwrap_or(false) {
                self.memo = Some(idx);
                return true;
            }
        }

        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Does `pattern` contain a glob metacharacter at all? Used by the
/// startup autoprobe pass to decide whether a pattern names one literal
/// interface or a family of them.
pub fn has_meta(pattern: &str) -> bool {
    pattern.chars().any(|c| matches!(c, '*' | '?' | '['))
}

/// Index of the first glob metacharacter in `pattern`, if any.
pub fn first_meta(pattern: &str) -> Option<usize> {
    pattern.find(|c| matches!(c, '*' | '?' | '['))
}

/// Evaluate one already-validated pattern against `text`. Patterns are
/// validated at `push` time, so a malformed pattern reaching here is
/// treated as simply not matching.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    glob_match(pattern, text).unwrap_or(false)
}

/// Read patterns from `path` (one per line), appending them to `set`.
/// `"-"` reads from stdin. Leading whitespace is stripped; content runs
/// to the first whitespace character; a `#` anywhere begins a trailing
/// comment. Blank lines are skipped. A malformed pattern is fatal, with
/// the exact diagnostic `"{path}, line {n}: bad pattern: {pat}"`.
pub fn read_config_file(set: &mut PatternSet, path: &str) -> Result<()> {
    let (display_name, mut reader): (String, Box<dyn BufRead>) = if path == "-" {
        ("stdin".to_string(), Box::new(BufReader::new(std::io::stdin())))
    } else {
        let file = std::fs::File::open(path)?;
        (path.to_string(), Box::new(BufReader::new(file)))
    };

    for (lineno, line) in read_lines(&mut reader).enumerate() {
        let line = line?;
        let pat = trim_config_line(&line);

        if set.push(pat).is_err() {
            return Err(DaemonError::InvalidPattern {
                source: format!("{display_name}, line {}", lineno + 1),
                pattern: pat.to_string(),
            });
        }
    }

    Ok(())
}

fn read_lines<'a>(reader: &'a mut dyn BufRead) -> impl Iterator<Item = std::io::Result<String>> + 'a {
    reader.lines()
}

/// Apply the config-line trimming rules: strip leading whitespace, cut
/// at the first whitespace after that, then cut at the first `#`.
fn trim_config_line(line: &str) -> &str {
    let after_leading_ws = line.trim_start();
    let token_end = after_leading_ws
        .find(char::is_whitespace)
        .unwrap_or(after_leading_ws.len());
    let token = &after_leading_ws[..token_end];
    match token.find('#') {
        Some(idx) => &token[..idx],
        None => token,
    }
}

/// Match `pattern` against `text`, shell-glob style. `Err` means the
/// pattern itself is malformed (an unclosed `[` class), not that it
/// failed to match.
fn glob_match(pattern: &str, text: &str) -> std::result::Result<bool, MalformedGlob> {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text, 0, 0)
}

fn match_from(
    pattern: &[char],
    text: &[char],
    pi: usize,
    ti: usize,
) -> std::result::Result<bool, MalformedGlob> {
    if pi == pattern.len() {
        return Ok(ti == text.len());
    }

    match pattern[pi] {
        '*' => {
            for i in ti..=text.len() {
                if match_from(pattern, text, pi + 1, i)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        '?' => {
            if ti >= text.len() {
                return Ok(false);
            }
            match_from(pattern, text, pi + 1, ti + 1)
        }
        '[' => {
            let (class_end, negate, ranges) = parse_class(pattern, pi)?;
            if ti >= text.len() {
                return Ok(false);
            }
            let in_class = ranges.iter().any(|&(lo, hi)| text[ti] >= lo && text[ti] <= hi);
            if in_class == negate {
                return Ok(false);
            }
            match_from(pattern, text, class_end, ti + 1)
        }
        c => {
            if ti < text.len() && text[ti] == c {
                match_from(pattern, text, pi + 1, ti + 1)
            } else {
                Ok(false)
            }
        }
    }
}

/// Parse a `[...]` class starting at `pattern[start] == '['`. Returns
/// the index just past the closing `]`, whether the class is negated
/// (`[!...]`), and its (inclusive) character ranges.
fn parse_class(
    pattern: &[char],
    start: usize,
) -> std::result::Result<(usize, bool, Vec<(char, char)>), MalformedGlob> {
    let mut idx = start + 1;
    let mut negate = false;

    if pattern.get(idx) == Some(&'!') {
        negate = true;
        idx += 1;
    }

    let mut ranges = Vec::new();
    let mut first = true;

    loop {
        match pattern.get(idx) {
            None => return Err(MalformedGlob),
            Some(']') if !first => {
                idx += 1;
                break;
            }
            Some(&c) => {
                first = false;
                if pattern.get(idx + 1) == Some(&'-') && pattern.get(idx + 2).is_some_and(|&e| e != ']')
                {
                    ranges.push((c, pattern[idx + 2]));
                    idx += 3;
                } else {
                    ranges.push((c, c));
                    idx += 1;
                }
            }
        }
    }

    Ok((idx, negate, ranges))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_anything() {
        assert!(glob_match("*", "anything").unwrap());
        assert!(glob_match("eth*", "eth0").unwrap());
        assert!(!glob_match("eth*", "wlan0").unwrap());
    }

    #[test]
    fn question_matches_single_char() {
        assert!(glob_match("eth?", "eth0").unwrap());
        assert!(!glob_match("eth?", "eth10").unwrap());
    }

    #[test]
    fn class_matches_range() {
        assert!(glob_match("eth[0-3]", "eth2").unwrap());
        assert!(!glob_match("eth[0-3]", "eth9").unwrap());
    }

    #[test]
    fn class_negation() {
        assert!(glob_match("eth[!0-3]", "eth9").unwrap());
        assert!(!glob_match("eth[!0-3]", "eth2").unwrap());
    }

    #[test]
    fn unclosed_class_is_malformed() {
        assert!(glob_match("[abc", "a").is_err());
    }

    #[test]
    fn pattern_set_memo_hits_before_full_scan() {
        let mut set = PatternSet::new();
        set.push("wlan*").unwrap();
        set.push("eth*").unwrap();

        assert!(set.matches("eth0"));
        assert_eq!(set.memo, Some(1));
        // Second lookup for the same pattern should hit the memo, not rescan.
        assert!(set.matches("eth1"));
        assert_eq!(set.memo, Some(1));
    }

    #[test]
    fn adding_patterns_is_monotone() {
        let mut set = PatternSet::new();
        set.push("eth*").unwrap();
        assert!(set.matches("eth0"));
        set.push("wlan*").unwrap();
        // eth0 must still match after adding an unrelated pattern.
        assert!(set.matches("eth0"));
    }

    #[test]
    fn invalid_pattern_rejected() {
        let mut set = PatternSet::new();
        assert!(set.push("[abc").is_err());
    }

    #[test]
    fn trim_config_line_rules() {
        assert_eq!(trim_config_line("  eth0  "), "eth0");
        assert_eq!(trim_config_line("eth0 # comment"), "eth0");
        assert_eq!(trim_config_line("# just a comment"), "");
        assert_eq!(trim_config_line(""), "");
        assert_eq!(trim_config_line("  "), "");
    }

    #[test]
    fn read_config_file_parses_patterns() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "eth*").unwrap();
        writeln!(file, "  wlan0  # wireless").unwrap();
        writeln!(file, "# comment line").unwrap();
        writeln!(file).unwrap();
        file.flush().unwrap();

        let mut set = PatternSet::new();
        read_config_file(&mut set, file.path().to_str().unwrap()).unwrap();

        assert!(set.matches("eth0"));
        assert!(set.matches("wlan0"));
        assert!(!set.matches("usb0"));
    }

    #[test]
    fn read_config_file_rejects_bad_pattern() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[abc").unwrap();
        file.flush().unwrap();

        let mut set = PatternSet::new();
        let err = read_config_file(&mut set, file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidPattern { .. }));
    }
}
