//! Pattern dialects shared by filter rules, source/metric groups and list
//! filters.
//!
//! A pattern string is either prefixed with `glob:` or `regexp:`, or taken as
//! written. Globs understand `*`, `?` and `[...]`, ignore ASCII case and treat
//! `/` as an ordinary character. Regexps ignore case.

use glob::MatchOptions;
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::error::ErrorKind;

pub const GLOB_PREFIX: &str = "glob:";
pub const REGEXP_PREFIX: &str = "regexp:";

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("invalid regexp pattern {pattern:?}: {source}")]
    Regexp {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl PatternError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// A compiled pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Glob(glob::Pattern),
    Regexp(Regex),
}

impl Pattern {
    /// Compiles `raw`; an unprefixed string matches by exact equality.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        match split_prefix(raw) {
            (Some(GLOB_PREFIX), body) => compile_glob(body),
            (Some(_), body) => compile_regexp(body),
            (None, body) => Ok(Pattern::Literal(body.to_string())),
        }
    }

    /// Compiles `raw`; an unprefixed string is a regexp. Filter rules use this
    /// form.
    pub fn parse_regexp_default(raw: &str) -> Result<Self, PatternError> {
        match split_prefix(raw) {
            (Some(GLOB_PREFIX), body) => compile_glob(body),
            (_, body) => compile_regexp(body),
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        match self {
            Pattern::Literal(s) => s == value,
            Pattern::Glob(p) => p.matches_with(value, GLOB_OPTIONS),
            Pattern::Regexp(re) => re.is_match(value),
        }
    }

    /// Returns the rewritten value, or `None` when the pattern does not match.
    ///
    /// Regexps replace every match and expand `$1`/`${name}` references;
    /// globs and literals replace the whole value.
    pub fn rewrite(&self, value: &str, replacement: &str) -> Option<String> {
        if !self.is_match(value) {
            return None;
        }
        match self {
            Pattern::Regexp(re) => Some(re.replace_all(value, replacement).into_owned()),
            _ => Some(replacement.to_string()),
        }
    }
}

/// One-shot match of a raw pattern string against `value`.
pub fn is_match(pattern: &str, value: &str) -> Result<bool, PatternError> {
    Ok(Pattern::parse(pattern)?.is_match(value))
}

fn split_prefix(raw: &str) -> (Option<&'static str>, &str) {
    if let Some(body) = raw.strip_prefix(GLOB_PREFIX) {
        (Some(GLOB_PREFIX), body)
    } else if let Some(body) = raw.strip_prefix(REGEXP_PREFIX) {
        (Some(REGEXP_PREFIX), body)
    } else {
        (None, raw)
    }
}

fn compile_glob(body: &str) -> Result<Pattern, PatternError> {
    glob::Pattern::new(body)
        .map(Pattern::Glob)
        .map_err(|source| PatternError::Glob { pattern: body.to_string(), source })
}

fn compile_regexp(body: &str) -> Result<Pattern, PatternError> {
    RegexBuilder::new(body)
        .case_insensitive(true)
        .build()
        .map(Pattern::Regexp)
        .map_err(|source| PatternError::Regexp { pattern: body.to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_is_exact() {
        assert!(is_match("host1", "host1").unwrap());
        assert!(!is_match("host1", "HOST1").unwrap());
        assert!(!is_match("host", "host1").unwrap());
    }

    #[test]
    fn glob_ignores_case() {
        assert!(is_match("glob:host*", "HOST1").unwrap());
        assert!(is_match("glob:h?st1", "host1").unwrap());
        assert!(!is_match("glob:host*", "other").unwrap());
    }

    #[test]
    fn glob_star_crosses_slashes() {
        assert!(is_match("glob:disk*", "disk/sda/read").unwrap());
        assert!(is_match("glob:disk/*/read", "disk/sda/read").unwrap());
        assert!(!is_match("glob:disk/*/read", "disk-sda-read").unwrap());
    }

    #[test]
    fn regexp_ignores_case_and_is_unanchored() {
        assert!(is_match("regexp:^web[0-9]+$", "WEB01").unwrap());
        assert!(is_match("regexp:load", "cpu.load.avg").unwrap());
        assert!(!is_match("regexp:^load", "cpu.load").unwrap());
    }

    #[test]
    fn invalid_regexp_is_configuration_error() {
        let err = Pattern::parse("regexp:(unclosed").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn unprefixed_filter_pattern_is_regexp() {
        let p = Pattern::parse_regexp_default("^h-(.*)$").unwrap();
        assert_eq!(p.rewrite("h-1", "host-$1").as_deref(), Some("host-1"));
        assert_eq!(p.rewrite("x-1", "host-$1"), None);
    }

    #[test]
    fn glob_rewrite_replaces_whole_value() {
        let p = Pattern::parse("glob:*.local").unwrap();
        assert_eq!(p.rewrite("db.local", "db").as_deref(), Some("db"));
    }
}
