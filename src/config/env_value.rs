// ABOUTME: Configuration values taken literally or from the environment.
// ABOUTME: Keeps secrets such as database passwords out of shipwright.yml.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv {
        #[serde(rename = "env")]
        var: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl fmt::Debug for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValue::Literal(_) => f.write_str("Literal(..)"),
            EnvValue::FromEnv { var, .. } => write!(f, "FromEnv({})", var),
        }
    }
}

impl EnvValue {
    pub fn resolve(&self) -> Result<String> {
        match self {
            EnvValue::Literal(s) => Ok(s.clone()),
            EnvValue::FromEnv { var, default } => match std::env::var(var) {
                Ok(val) => Ok(val),
                Err(_) => default
                    .clone()
                    .ok_or_else(|| Error::MissingEnvVar(var.clone())),
            },
        }
    }
}

pub fn resolve_env_map(map: &BTreeMap<String, EnvValue>) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(k, v)| v.resolve().map(|resolved| (k.clone(), resolved)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_env_forms_parse() {
        let map: BTreeMap<String, EnvValue> = serde_yaml::from_str(
            "plain: hello\nsecret:\n  env: SHIPWRIGHT_TEST_DB_PASSWORD\n  default: fallback\n",
        )
        .unwrap();
        assert_eq!(map["plain"], EnvValue::Literal("hello".to_string()));
        assert!(matches!(map["secret"], EnvValue::FromEnv { .. }));
    }

    #[test]
    fn env_wins_over_default() {
        let value = EnvValue::FromEnv {
            var: "SHIPWRIGHT_TEST_TOKEN".to_string(),
            default: Some("fallback".to_string()),
        };
        temp_env::with_var("SHIPWRIGHT_TEST_TOKEN", Some("from-env"), || {
            assert_eq!(value.resolve().unwrap(), "from-env");
        });
        temp_env::with_var_unset("SHIPWRIGHT_TEST_TOKEN", || {
            assert_eq!(value.resolve().unwrap(), "fallback");
        });
    }

    #[test]
    fn missing_env_without_default_is_an_error() {
        let value = EnvValue::FromEnv {
            var: "SHIPWRIGHT_TEST_MISSING".to_string(),
            default: None,
        };
        temp_env::with_var_unset("SHIPWRIGHT_TEST_MISSING", || {
            assert!(matches!(value.resolve(), Err(Error::MissingEnvVar(v)) if v == "SHIPWRIGHT_TEST_MISSING"));
        });
    }

    #[test]
    fn debug_does_not_print_literals() {
        let value = EnvValue::Literal("hunter2".to_string());
        assert!(!format!("{:?}", value).contains("hunter2"));
    }
}
