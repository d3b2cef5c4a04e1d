//! Topic patterns - hierarchical matching of bus topics.

use std::fmt::{self, Formatter};
use std::str::FromStr;

use thiserror::Error;

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

#[derive(Clone, Hash, Eq, PartialEq)]
enum Level {
    Literal(String),
    Single,
    Multi,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic pattern is empty")]
    Empty,

    #[error("Wildcard must occupy a whole level in '{0}'")]
    PartialWildcard(String),

    #[error("'#' is only allowed as the last level in '{0}'")]
    MisplacedMultiLevel(String),
}

/// A subscription pattern such as `PIR/MOTION_DETECTED`, `PIR/+` or `#`.
///
/// Levels are separated by `/`. `+` matches exactly one level, `#` matches
/// the remaining levels (including none) and must be the last level.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct TopicPattern {
    raw: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        if raw.is_empty() {
            return Err(TopicError::Empty);
        }

        let tokens: Vec<&str> = raw.split(SEPARATOR).collect();
        let last = tokens.len() - 1;
        let mut levels = Vec::with_capacity(tokens.len());

        for (index, token) in tokens.into_iter().enumerate() {
            let level = match token {
                MULTI_LEVEL if index == last => Level::Multi,
                MULTI_LEVEL => return Err(TopicError::MisplacedMultiLevel(raw.to_string())),
                SINGLE_LEVEL => Level::Single,
                other if other.contains(['+', '#']) => {
                    return Err(TopicError::PartialWildcard(raw.to_string()));
                }
                other => Level::Literal(other.to_string()),
            };
            levels.push(level);
        }

        Ok(TopicPattern {
            raw: raw.to_string(),
            levels,
        })
    }

    /// The pattern matching every topic.
    pub fn all() -> Self {
        TopicPattern {
            raw: MULTI_LEVEL.to_string(),
            levels: vec![Level::Multi],
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn level(&self) -> usize {
        self.levels.len()
    }

    /// True when the pattern contains no wildcard and matches a single topic.
    pub fn is_exact(&self) -> bool {
        self.levels
            .iter()
            .all(|level| matches!(level, Level::Literal(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split(SEPARATOR);

        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        topic_levels.next().is_none()
    }
}

impl FromStr for TopicPattern {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TopicPattern::parse(s)
    }
}

impl TryFrom<&str> for TopicPattern {
    type Error = TopicError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        TopicPattern::parse(value)
    }
}

impl TryFrom<String> for TopicPattern {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TopicPattern::parse(&value)
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl std::fmt::Debug for TopicPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TopicPattern({})", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let pattern = TopicPattern::parse("PIR/MOTION_DETECTED").unwrap();
        assert!(pattern.is_exact());
        assert!(pattern.matches("PIR/MOTION_DETECTED"));
        assert!(!pattern.matches("PIR/MOTION_ENDED"));
        assert!(!pattern.matches("PIR"));
        assert!(!pattern.matches("PIR/MOTION_DETECTED/extra"));
    }

    #[test]
    fn test_single_level_wildcard() {
        let pattern = TopicPattern::parse("PIR/+").unwrap();
        assert!(pattern.matches("PIR/HEARTBEAT"));
        assert!(pattern.matches("PIR/MOTION_ENDED"));
        assert!(!pattern.matches("PIR"));
        assert!(!pattern.matches("PIR/a/b"));
        assert!(!pattern.matches("CAMERA/HEARTBEAT"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        let pattern = TopicPattern::parse("PIR/#").unwrap();
        assert!(pattern.matches("PIR"));
        assert!(pattern.matches("PIR/HEARTBEAT"));
        assert!(pattern.matches("PIR/a/b/c"));
        assert!(!pattern.matches("TAKE_PICTURE"));
    }

    #[test]
    fn test_all_topics() {
        let pattern = TopicPattern::all();
        assert_eq!(pattern, TopicPattern::parse("#").unwrap());
        assert!(pattern.matches("GET_LATEST_PICTURES_N"));
        assert!(pattern.matches("PIR/MOTION_DETECTED"));
        assert!(!pattern.is_exact());
    }

    #[test]
    fn test_invalid_patterns() {
        assert_eq!(TopicPattern::parse(""), Err(TopicError::Empty));
        assert!(matches!(
            TopicPattern::parse("PIR/#/x"),
            Err(TopicError::MisplacedMultiLevel(_))
        ));
        assert!(matches!(
            TopicPattern::parse("PIR/MOTION+"),
            Err(TopicError::PartialWildcard(_))
        ));
    }

    #[test]
    fn test_display() {
        let pattern: TopicPattern = "PIR/+".parse().unwrap();
        assert_eq!(pattern.to_string(), "PIR/+");
        assert_eq!(pattern.level(), 2);
    }
}
