// ABOUTME: Validated stage name used as a key in plans and persisted state.
// ABOUTME: Restricted to lowercase alphanumerics, hyphens, and underscores.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageNameError {
    #[error("stage name cannot be empty")]
    Empty,

    #[error("stage name exceeds maximum length of 63 characters")]
    TooLong,

    #[error("stage name must start with a lowercase letter")]
    InvalidStart,

    #[error("invalid character in stage name: '{0}'")]
    InvalidChar(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageName(String);

impl StageName {
    pub fn new(value: &str) -> Result<Self, StageNameError> {
        if value.is_empty() {
            return Err(StageNameError::Empty);
        }

        if value.len() > 63 {
            return Err(StageNameError::TooLong);
        }

        if !value.starts_with(|c: char| c.is_ascii_lowercase()) {
            return Err(StageNameError::InvalidStart);
        }

        for c in value.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' && c != '_' {
                return Err(StageNameError::InvalidChar(c));
            }
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for StageName {
    type Err = StageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for StageName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StageName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::new(&value).map_err(serde::de::Error::custom)
    }
}
