// ABOUTME: Run identifier keying the persisted deployment state.
// ABOUTME: Safe to use as a file name; generated from project and UTC time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunIdError {
    #[error("run id cannot be empty")]
    Empty,

    #[error("run id exceeds maximum length of 128 characters")]
    TooLong,

    #[error("run id cannot start with '.'")]
    LeadingDot,

    #[error("invalid character in run id: '{0}'")]
    InvalidChar(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(String);

impl RunId {
    pub fn new(value: &str) -> Result<Self, RunIdError> {
        if value.is_empty() {
            return Err(RunIdError::Empty);
        }
        if value.len() > 128 {
            return Err(RunIdError::TooLong);
        }
        if value.starts_with('.') {
            return Err(RunIdError::LeadingDot);
        }
        if let Some(c) = value
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
        {
            return Err(RunIdError::InvalidChar(c));
        }
        Ok(Self(value.to_string()))
    }

    /// Build a run ID of the form `<project>-<yyyymmddThhmmss>`.
    ///
    /// Characters of the project that are not valid in a run ID are replaced
    /// with `-`.
    pub fn generate(project: &str, at: DateTime<Utc>) -> Self {
        let project: String = project
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let project = project.trim_start_matches('.');
        let prefix = if project.is_empty() { "run" } else { project };
        Self(format!("{}-{}", prefix, at.format("%Y%m%dT%H%M%S")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for RunId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::new(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn generate_uses_project_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let id = RunId::generate("My Project", at);
        assert_eq!(id.as_str(), "my-project-20260304T050607");
        assert!(RunId::new(id.as_str()).is_ok());
    }

    #[test]
    fn rejects_path_separators() {
        assert_eq!(RunId::new("../etc"), Err(RunIdError::LeadingDot));
        assert_eq!(RunId::new("a/b"), Err(RunIdError::InvalidChar('/')));
    }
}
