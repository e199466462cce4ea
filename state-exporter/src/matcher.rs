use regex::{Regex, RegexBuilder};

use crate::error::ConfigurationError;

const NEGATION_SYMBOL: char = '!';
const WILDCARD_SYMBOL: &str = "*";
const REGEX_SYMBOL: char = '/';

#[derive(Debug, Clone, Copy, PartialEq)]
enum MatchResult {
    Found,
    Continue,
    Interrupt,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Regex(Regex),
    Wildcard,
    Negation(Box<Matcher>),
}

impl Matcher {
    fn parse(pattern: &str) -> Result<Self, ConfigurationError> {
        match pattern.strip_prefix(NEGATION_SYMBOL) {
            Some(inner) => Ok(Matcher::Negation(Box::new(Self::parse_simple(inner, pattern)?))),
            None => Self::parse_simple(pattern, pattern),
        }
    }

    fn parse_simple(pattern: &str, raw: &str) -> Result<Self, ConfigurationError> {
        if pattern == WILDCARD_SYMBOL {
            return Ok(Matcher::Wildcard);
        }

        let regex = match pattern.strip_prefix(REGEX_SYMBOL) {
            Some(rest) => match rest.rfind(REGEX_SYMBOL) {
                Some(end) => Some((&rest[..end], &rest[end + 1..])),
                None => None,
            },
            None => None,
        };

        match regex {
            Some((body, flags)) => Self::build_regex(body, flags, raw),
            None => Ok(Matcher::Literal(pattern.to_owned())),
        }
    }

    fn build_regex(body: &str, flags: &str, raw: &str) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidPattern {
            pattern: raw.to_owned(),
            reason,
        };

        let unrecognized: Vec<String> = flags
            .chars()
            .filter(|flag| !matches!(flag, 'i' | 'm' | 'l' | 'd'))
            .map(String::from)
            .collect();
        if !unrecognized.is_empty() {
            return Err(invalid(format!(
                "Unrecognized regex flags: {}",
                unrecognized.join(", ")
            )));
        }

        let body = if flags.contains('l') {
            regex::escape(body)
        } else {
            body.to_owned()
        };

        RegexBuilder::new(&format!(r"\A(?:{body})\z"))
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .dot_matches_new_line(flags.contains('d'))
            .build()
            .map(Matcher::Regex)
            .map_err(|e| invalid(e.to_string()))
    }

    fn evaluate(&self, value: &str) -> MatchResult {
        let found = match self {
            Matcher::Literal(literal) => literal == value,
            Matcher::Regex(regex) => regex.is_match(value),
            Matcher::Wildcard => true,
            Matcher::Negation(inner) => {
                return match inner.evaluate(value) {
                    MatchResult::Found | MatchResult::Interrupt => MatchResult::Interrupt,
                    MatchResult::Continue => MatchResult::Continue,
                }
            }
        };

        if found {
            MatchResult::Found
        } else {
            MatchResult::Continue
        }
    }
}

/// Ordered list of value patterns: literals, `*`, `/regex/flags` and `!`-negated forms.
/// The first pattern that decides wins; a matching negation stops evaluation with no match.
#[derive(Debug, Clone, Default)]
pub struct MultiValueMatcher {
    matchers: Vec<Matcher>,
}

impl MultiValueMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigurationError> {
        let matchers = patterns
            .iter()
            .map(|pattern| Matcher::parse(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { matchers })
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn matches(&self, value: &str) -> bool {
        for matcher in &self.matchers {
            match matcher.evaluate(value) {
                MatchResult::Found => return true,
                MatchResult::Interrupt => return false,
                MatchResult::Continue => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        let matcher = MultiValueMatcher::new(&["unknown", "unavailable"]).unwrap();

        assert!(matcher.matches("unknown"));
        assert!(matcher.matches("unavailable"));
        assert!(!matcher.matches("Unknown"));
        assert!(!matcher.matches("21.5"));
    }

    #[test]
    fn test_empty_never_matches() {
        let matcher = MultiValueMatcher::new::<&str>(&[]).unwrap();
        assert!(matcher.is_empty());
        assert!(!matcher.matches(""));
    }

    #[test]
    fn test_wildcard() {
        let matcher = MultiValueMatcher::new(&["*"]).unwrap();
        assert!(matcher.matches("anything"));
    }

    #[test]
    fn test_regex_is_whole_value() {
        let matcher = MultiValueMatcher::new(&["/[0-9]+/"]).unwrap();

        assert!(matcher.matches("123"));
        assert!(!matcher.matches("123a"));
    }

    #[test]
    fn test_regex_flags() {
        let matcher = MultiValueMatcher::new(&["/unknown/i"]).unwrap();
        assert!(matcher.matches("UNKNOWN"));

        let matcher = MultiValueMatcher::new(&["/a.c/l"]).unwrap();
        assert!(matcher.matches("a.c"));
        assert!(!matcher.matches("abc"));

        let matcher = MultiValueMatcher::new(&["/a.c/d"]).unwrap();
        assert!(matcher.matches("a\nc"));
    }

    #[test]
    fn test_multi_line_regex_is_whole_value() {
        let matcher = MultiValueMatcher::new(&["/unavailable/m"]).unwrap();

        assert!(matcher.matches("unavailable"));
        assert!(!matcher.matches("21.5\nunavailable"));
        assert!(!matcher.matches("unavailable\n21.5"));
    }

    #[test]
    fn test_unrecognized_flags() {
        let err = MultiValueMatcher::new(&["/abc/ix"]).unwrap_err();
        assert!(err.to_string().contains("Unrecognized regex flags: x"));
    }

    #[test]
    fn test_invalid_regex() {
        assert!(MultiValueMatcher::new(&["/a(b/"]).is_err());
    }

    #[test]
    fn test_unterminated_regex_is_literal() {
        let matcher = MultiValueMatcher::new(&["/abc"]).unwrap();
        assert!(matcher.matches("/abc"));

        let matcher = MultiValueMatcher::new(&["/"]).unwrap();
        assert!(matcher.matches("/"));
    }

    #[test]
    fn test_negation_interrupts() {
        let matcher = MultiValueMatcher::new(&["!on", "*"]).unwrap();

        assert!(!matcher.matches("on"));
        assert!(matcher.matches("off"));

        let matcher = MultiValueMatcher::new(&["!/[0-9.]+/", "*"]).unwrap();
        assert!(!matcher.matches("21.5"));
        assert!(matcher.matches("unavailable"));
    }
}
