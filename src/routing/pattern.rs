//! Topic patterns with named parameters
//!
//! A pattern is a slash separated topic in which whole segments of the form
//! `<name>` bind one concrete topic segment to `name`:
//!
//! ```text
//! simplisafe/uid/<userId>/sid/<systemId>/cmd
//!         ↓ subscription_topic()
//! simplisafe/uid/+/sid/+/cmd
//! ```
//!
//! Compilation is pure. The same input always yields the same matcher and
//! the same broker subscription.

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::error::RoutingError;

/// Parameter bindings extracted from one concrete topic
pub type ParamMap = HashMap<String, String>;

const SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A compiled topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compiles `pattern` into a matcher.
    ///
    /// # Errors
    ///
    /// [`RoutingError::InvalidPattern`] if the pattern is empty, a parameter
    /// is empty (`<>`), a parameter name is used twice, or a literal segment
    /// carries an MQTT wildcard (`+`, `#`).
    pub fn compile(pattern: &str) -> Result<Self, RoutingError> {
        if pattern.is_empty() {
            return Err(RoutingError::invalid(pattern, "pattern is empty"));
        }

        let mut seen = HashSet::new();
        let mut segments = Vec::new();

        for raw in pattern.split(SEPARATOR) {
            if let Some(name) = raw.strip_prefix('<').and_then(|r| r.strip_suffix('>')) {
                if name.is_empty() {
                    return Err(RoutingError::invalid(pattern, "empty parameter segment"));
                }
                if !seen.insert(name) {
                    return Err(RoutingError::invalid(
                        pattern,
                        format!("duplicate parameter '{}'", name),
                    ));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                if raw.contains('+') || raw.contains('#') {
                    return Err(RoutingError::invalid(
                        pattern,
                        format!("wildcard in literal segment '{}', use <name>", raw),
                    ));
                }
                segments.push(Segment::Literal(raw.to_string()));
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// The pattern text this matcher was compiled from
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parameter names in declaration order
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Matches a concrete topic against the whole pattern.
    ///
    /// Returns `None` unless every segment matches: literals compare
    /// case-sensitively, parameters take exactly one non-empty segment.
    pub fn matches(&self, topic: &str) -> Option<ParamMap> {
        let parts: Vec<&str> = topic.split(SEPARATOR).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = ParamMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if part.is_empty() => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }

    /// The broker subscription covering every topic this pattern matches
    pub fn subscription_topic(&self) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(literal) => literal.as_str(),
                Segment::Param(_) => SINGLE_LEVEL_WILDCARD,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_named_params() {
        let pattern = TopicPattern::compile("simplisafe/uid/<userId>/sid/<systemId>/cmd").unwrap();

        let params = pattern
            .matches("simplisafe/uid/12345/sid/54321/cmd")
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params["userId"], "12345");
        assert_eq!(params["systemId"], "54321");
        assert_eq!(pattern.subscription_topic(), "simplisafe/uid/+/sid/+/cmd");
    }

    #[test]
    fn test_literal_pattern() {
        let pattern = TopicPattern::compile("test/echo").unwrap();
        assert_eq!(pattern.matches("test/echo"), Some(ParamMap::new()));
        assert_eq!(pattern.subscription_topic(), "test/echo");
        assert_eq!(pattern.params().count(), 0);
    }

    #[test]
    fn test_match_is_anchored() {
        let pattern = TopicPattern::compile("lights/<id>/set").unwrap();
        assert!(pattern.matches("lights/1/set").is_some());
        assert!(pattern.matches("x/lights/1/set").is_none());
        assert!(pattern.matches("lights/1/set/extra").is_none());
        assert!(pattern.matches("lights/1").is_none());
    }

    #[test]
    fn test_param_needs_non_empty_segment() {
        let pattern = TopicPattern::compile("lights/<id>/set").unwrap();
        assert!(pattern.matches("lights//set").is_none());
    }

    #[test]
    fn test_literals_are_case_sensitive() {
        let pattern = TopicPattern::compile("Lights/<id>").unwrap();
        assert!(pattern.matches("lights/1").is_none());
        assert!(pattern.matches("Lights/1").is_some());
    }

    #[test]
    fn test_param_does_not_span_separator() {
        let pattern = TopicPattern::compile("a/<x>/b").unwrap();
        assert!(pattern.matches("a/1/2/b").is_none());
    }

    #[test]
    fn test_duplicate_param_rejected() {
        let err = TopicPattern::compile("a/<id>/b/<id>").unwrap_err();
        assert!(matches!(err, RoutingError::InvalidPattern { .. }));
    }

    #[test]
    fn test_empty_param_rejected() {
        assert!(TopicPattern::compile("a/<>/b").is_err());
    }

    #[test]
    fn test_wildcards_in_literals_rejected() {
        assert!(TopicPattern::compile("a/+/b").is_err());
        assert!(TopicPattern::compile("a/#").is_err());
        assert!(TopicPattern::compile("").is_err());
    }

    #[test]
    fn test_compile_is_idempotent() {
        let a = TopicPattern::compile("home/<room>/<device>/state").unwrap();
        let b = TopicPattern::compile("home/<room>/<device>/state").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.subscription_topic(), b.subscription_topic());
        assert_eq!(a.params().collect::<Vec<_>>(), vec!["room", "device"]);
    }
}
