// ABOUTME: Custom serde deserializers for config types.
// ABOUTME: Handles command shorthands, non-empty health check lists and stage-keyed maps.

use nonempty::NonEmpty;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::sections::{CommandSpec, RetryOverride};
use crate::health::HealthCheckSpec;
use crate::types::StageName;

pub fn deserialize_commands<'de, D>(deserializer: D) -> Result<Vec<CommandSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let values: Vec<CommandEntry> = Vec::deserialize(deserializer)?;
    Ok(values.into_iter().map(CommandEntry::into_spec).collect())
}

pub fn deserialize_healthchecks<'de, D>(
    deserializer: D,
) -> Result<NonEmpty<HealthCheckSpec>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let checks: Vec<HealthCheckSpec> = Vec::deserialize(deserializer)?;
    NonEmpty::from_vec(checks)
        .ok_or_else(|| serde::de::Error::custom("at least one health check is required"))
}

pub fn deserialize_retry_overrides<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<StageName, RetryOverride>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: BTreeMap<String, RetryOverride> = BTreeMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(name, over)| {
            StageName::new(&name)
                .map(|name| (name, over))
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandEntry {
    Simple(String),
    Detailed(CommandSpec),
}

impl CommandEntry {
    fn into_spec(self) -> CommandSpec {
        match self {
            CommandEntry::Simple(run) => CommandSpec::new(run),
            CommandEntry::Detailed(spec) => spec,
        }
    }
}
