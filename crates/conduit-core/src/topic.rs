//! Topic grammar and matchers.
//!
//! A topic key is one or more `[A-Za-z0-9]+` segments joined by a delimiter
//! (`.` unless configured otherwise). Handlers register against a [`Matcher`],
//! which is either an exact key or a regular expression tested against the
//! literal topic string.

use std::fmt;
use std::hash::{Hash, Hasher};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};

/// Default segment delimiter.
pub const DEFAULT_DELIMITER: &str = ".";

/// Identifiers that can never be used as topics.
pub const RESERVED_TOPICS: [&str; 3] = ["error", "subscribe", "unsubscribe"];

// =============================================================================
// TopicKey
// =============================================================================

/// A validated, trimmed topic key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicKey(String);

impl TopicKey {
    /// Parses a topic using the default `.` delimiter.
    pub fn parse(raw: &str) -> BusResult<Self> {
        Self::parse_with(raw, DEFAULT_DELIMITER)
    }

    /// Parses a topic split on `delimiter`.
    pub fn parse_with(raw: &str, delimiter: &str) -> BusResult<Self> {
        let topic = raw.trim();
        check_common(raw, topic)?;

        if delimiter.is_empty() {
            return Err(BusError::invalid_topic(raw, "delimiter must not be empty"));
        }

        for segment in topic.split(delimiter) {
            if segment.is_empty() {
                return Err(BusError::invalid_topic(raw, "empty segment"));
            }
            if !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(BusError::invalid_topic(
                    raw,
                    format!("segment '{segment}' must only contain ASCII letters and digits"),
                ));
            }
        }

        Ok(Self(topic.to_string()))
    }

    /// Accepts a topic received from a peer whose delimiter is unknown.
    ///
    /// Only the delimiter independent rules are enforced; the receiving bus
    /// re-parses the key with its own delimiter before dispatching locally.
    pub fn from_wire(raw: &str) -> BusResult<Self> {
        let topic = raw.trim();
        check_common(raw, topic)?;
        if topic.chars().any(char::is_whitespace) {
            return Err(BusError::invalid_topic(raw, "whitespace inside topic"));
        }
        Ok(Self(topic.to_string()))
    }

    /// The normalized key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the segments of the key.
    pub fn segments<'a>(&'a self, delimiter: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.split(delimiter)
    }

    /// Appends `suffix` below this key: `prefix` + `delimiter` + `suffix`.
    pub fn join(&self, suffix: &str, delimiter: &str) -> BusResult<Self> {
        Self::parse_with(&format!("{}{delimiter}{}", self.0, suffix.trim()), delimiter)
    }

    /// Returns the remainder after `prefix` + `delimiter`, if this key lives
    /// below `prefix`.
    pub fn strip_prefix<'a>(&'a self, prefix: &str, delimiter: &str) -> Option<&'a str> {
        self.0
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(delimiter))
            .filter(|rest| !rest.is_empty())
    }
}

fn check_common(raw: &str, topic: &str) -> BusResult<()> {
    if topic.is_empty() {
        return Err(BusError::invalid_topic(raw, "topic must not be empty"));
    }
    if RESERVED_TOPICS.contains(&topic) {
        return Err(BusError::invalid_topic(raw, "reserved identifier"));
    }
    Ok(())
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TopicKey {
    type Error = BusError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::from_wire(&raw)
    }
}

impl From<TopicKey> for String {
    fn from(key: TopicKey) -> Self {
        key.0
    }
}

impl PartialEq<str> for TopicKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TopicKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

// =============================================================================
// Matcher
// =============================================================================

/// What a handler registration (or a dispatch target) matches on.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches one exact topic key.
    Exact(TopicKey),
    /// Matches every topic string the expression accepts.
    Pattern(Regex),
}

impl Matcher {
    /// Builds an exact matcher with the default delimiter.
    pub fn exact(raw: &str) -> BusResult<Self> {
        TopicKey::parse(raw).map(Self::Exact)
    }

    /// Compiles a pattern matcher.
    pub fn pattern(source: &str) -> BusResult<Self> {
        Regex::new(source)
            .map(Self::Pattern)
            .map_err(|e| BusError::InvalidPattern {
                pattern: source.to_string(),
                reason: e.to_string(),
            })
    }

    /// Returns `true` for regex matchers.
    pub fn is_pattern(&self) -> bool {
        matches!(self, Self::Pattern(_))
    }

    /// The exact key, if this is an exact matcher.
    pub fn as_key(&self) -> Option<&TopicKey> {
        match self {
            Self::Exact(key) => Some(key),
            Self::Pattern(_) => None,
        }
    }

    /// Tests a literal topic string.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::Exact(key) => key.as_str() == topic,
            Self::Pattern(re) => re.is_match(topic),
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Pattern(a), Self::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for Matcher {}

impl Hash for Matcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Exact(key) => {
                0u8.hash(state);
                key.hash(state);
            }
            Self::Pattern(re) => {
                1u8.hash(state);
                re.as_str().hash(state);
            }
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(key) => f.write_str(key.as_str()),
            Self::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl From<TopicKey> for Matcher {
    fn from(key: TopicKey) -> Self {
        Self::Exact(key)
    }
}

impl From<Regex> for Matcher {
    fn from(re: Regex) -> Self {
        Self::Pattern(re)
    }
}

// =============================================================================
// IntoMatcher
// =============================================================================

/// Conversion into a [`Matcher`], validated against a delimiter.
///
/// Strings become exact matchers; [`Regex`] values become pattern matchers.
pub trait IntoMatcher {
    /// Performs the conversion.
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher>;
}

impl IntoMatcher for &str {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        TopicKey::parse_with(self, delimiter).map(Matcher::Exact)
    }
}

impl IntoMatcher for String {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        self.as_str().into_matcher(delimiter)
    }
}

impl IntoMatcher for &String {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        self.as_str().into_matcher(delimiter)
    }
}

impl IntoMatcher for TopicKey {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        // Keys parsed elsewhere may have used another delimiter.
        self.as_str().into_matcher(delimiter)
    }
}

impl IntoMatcher for &TopicKey {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        self.as_str().into_matcher(delimiter)
    }
}

impl IntoMatcher for Regex {
    fn into_matcher(self, _delimiter: &str) -> BusResult<Matcher> {
        Ok(Matcher::Pattern(self))
    }
}

impl IntoMatcher for Matcher {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        match self {
            Self::Exact(key) => key.into_matcher(delimiter),
            pattern => Ok(pattern),
        }
    }
}

impl IntoMatcher for &Matcher {
    fn into_matcher(self, delimiter: &str) -> BusResult<Matcher> {
        self.clone().into_matcher(delimiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_topics() {
        assert_eq!(TopicKey::parse("test").unwrap(), "test");
        assert_eq!(TopicKey::parse("  say.hello ").unwrap(), "say.hello");
        assert_eq!(TopicKey::parse("Math.Add2").unwrap(), "Math.Add2");
        assert_eq!(TopicKey::parse_with("a:b:c", ":").unwrap(), "a:b:c");
    }

    #[test]
    fn test_rejected_topics() {
        for raw in ["", "   ", "it..works", ".test", "test.", "te st", "a-b", "emoji.🙂"] {
            let err = TopicKey::parse(raw).unwrap_err();
            assert!(
                matches!(err, BusError::InvalidTopic { .. }),
                "{raw:?} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_reserved_topics() {
        for raw in RESERVED_TOPICS {
            assert!(TopicKey::parse(raw).is_err());
        }
        assert!(TopicKey::parse(" error ").is_err());
        // Reserved only as a whole identifier.
        assert!(TopicKey::parse("error.log").is_ok());
    }

    #[test]
    fn test_custom_delimiter_rejects_dots() {
        assert!(TopicKey::parse_with("a.b", ":").is_err());
        assert!(TopicKey::parse_with("a::b", ":").is_err());
    }

    #[test]
    fn test_join_and_strip_prefix() {
        let ns = TopicKey::parse("calc").unwrap();
        let key = ns.join("add", ".").unwrap();
        assert_eq!(key, "calc.add");
        assert_eq!(key.strip_prefix("calc", "."), Some("add"));
        assert_eq!(key.strip_prefix("cal", "."), None);
        assert_eq!(ns.strip_prefix("calc", "."), None);

        let deep = TopicKey::parse("calc.test.secondary").unwrap();
        assert_eq!(deep.strip_prefix("calc", "."), Some("test.secondary"));
    }

    #[test]
    fn test_wire_deserialization() {
        let key: TopicKey = serde_json::from_value(serde_json::json!("a:b")).unwrap();
        assert_eq!(key, "a:b");
        assert!(serde_json::from_value::<TopicKey>(serde_json::json!("error")).is_err());
        assert!(serde_json::from_value::<TopicKey>(serde_json::json!("a b")).is_err());
    }

    #[test]
    fn test_matcher_equality_and_display() {
        let a = Matcher::pattern("^te").unwrap();
        let b = Matcher::pattern("^te").unwrap();
        let c = Matcher::pattern("st$").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "/^te/");

        let exact = Matcher::exact("test").unwrap();
        assert_eq!(exact.to_string(), "test");
        assert_ne!(exact, Matcher::pattern("test").unwrap());
    }

    #[test]
    fn test_matcher_matches_literal_topic() {
        let re = Matcher::pattern("^math\\.").unwrap();
        assert!(re.matches("math.add"));
        assert!(!re.matches("mathadd"));

        let exact = Matcher::exact("math.add").unwrap();
        assert!(exact.matches("math.add"));
        assert!(!exact.matches("math.add.more"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Matcher::pattern("(unclosed").unwrap_err();
        assert_eq!(err.kind(), "invalid_pattern");
    }

    #[test]
    fn test_into_matcher() {
        assert!("test".into_matcher(".").unwrap().as_key().is_some());
        assert!(Regex::new("x").unwrap().into_matcher(".").unwrap().is_pattern());
        assert!("a.b".into_matcher(":").is_err());
    }
}
