//! Hierarchical topic filters with broker-style wildcards.

use serde::{Deserialize, Serialize};

use crate::error::EnvError;

/// A subscription expression over `/`-separated topics.
///
/// - `*` as a whole level matches exactly one level
/// - `>` as the last level matches one or more remaining levels
///
/// `buses/grid/>` therefore matches `buses/grid/A1` and
/// `buses/grid/A1/extra` but not `buses/grid` itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TopicFilter {
    levels: Vec<String>,
}

impl TopicFilter {
    /// Parses and validates a filter expression.
    pub fn parse(expr: &str) -> Result<Self, EnvError> {
        if expr.is_empty() {
            return Err(EnvError::invalid_topic("empty filter"));
        }

        let levels: Vec<String> = expr.split('/').map(str::to_owned).collect();
        let last = levels.len() - 1;

        for (i, level) in levels.iter().enumerate() {
            if level.is_empty() {
                return Err(EnvError::invalid_topic(format!("{expr}: empty level")));
            }
            if level == ">" && i != last {
                return Err(EnvError::invalid_topic(format!(
                    "{expr}: '>' must be the last level"
                )));
            }
        }

        Ok(Self { levels })
    }

    /// Returns true if `topic` is covered by this filter.
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');

        for (i, level) in self.levels.iter().enumerate() {
            if level == ">" {
                // Needs at least one more level, and it must be non-empty
                let rest: Vec<&str> = topic_levels.collect();
                return i == self.levels.len() - 1
                    && !rest.is_empty()
                    && rest.iter().all(|l| !l.is_empty());
            }

            match topic_levels.next() {
                Some(t) if level == "*" && !t.is_empty() => {}
                Some(t) if t == level => {}
                _ => return false,
            }
        }

        topic_levels.next().is_none()
    }

    /// Returns true if the filter contains any wildcard level.
    pub fn is_wildcard(&self) -> bool {
        self.levels.iter().any(|l| l == "*" || l == ">")
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.levels.join("/"))
    }
}

impl std::str::FromStr for TopicFilter {
    type Err = EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TopicFilter {
    type Error = EnvError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TopicFilter> for String {
    fn from(filter: TopicFilter) -> Self {
        filter.to_string()
    }
}
