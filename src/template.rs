// ABOUTME: `${KEY}` placeholder substitution for workload, proxy and probe templates.
// ABOUTME: Unknown placeholders are errors so half-rendered files never reach a host.

use crate::deploy::StageError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Values available to a template, keyed by placeholder name.
pub type Vars<'a> = BTreeMap<&'a str, &'a str>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template references unknown value '${{{0}}}'")]
    UnknownKey(String),

    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyKey(usize),
}

impl From<TemplateError> for StageError {
    fn from(err: TemplateError) -> Self {
        StageError::fatal(err.to_string())
    }
}

/// Replace every `${KEY}` in `template` with its value from `vars`.
///
/// `$$` renders a literal `$`. A `$` not followed by `{` or `$` is copied as is.
pub fn render(template: &str, vars: &Vars<'_>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            offset += pos + 2;
            rest = stripped;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or(TemplateError::Unterminated(offset + pos))?;
            let key = body[..end].trim();
            if key.is_empty() {
                return Err(TemplateError::EmptyKey(offset + pos));
            }
            let value = vars
                .get(key)
                .ok_or_else(|| TemplateError::UnknownKey(key.to_string()))?;
            out.push_str(value);
            let consumed = pos + 2 + end + 1;
            offset += consumed;
            rest = &rest[consumed..];
        } else {
            out.push('$');
            offset += pos + 1;
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Placeholder names referenced by `template`, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(pos) = rest.find("${") {
        let body = &rest[pos + 2..];
        let Some(end) = body.find('}') else { break };
        let key = body[..end].trim().to_string();
        if !key.is_empty() && !keys.contains(&key) {
            keys.push(key);
        }
        rest = &body[end + 1..];
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Vars<'static> {
        BTreeMap::from([("public_address", "203.0.113.7"), ("domain", "example.org")])
    }

    #[test]
    fn substitutes_known_keys() {
        let rendered = render("server_name ${domain}; # ${ public_address }", &vars()).unwrap();
        assert_eq!(rendered, "server_name example.org; # 203.0.113.7");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = render("host=${db_host}", &vars()).unwrap_err();
        assert_eq!(err, TemplateError::UnknownKey("db_host".to_string()));
    }

    #[test]
    fn dollar_escapes_and_bare_dollars() {
        assert_eq!(render("cost: $$5 and $HOME", &vars()).unwrap(), "cost: $5 and $HOME");
    }

    #[test]
    fn unterminated_and_empty_placeholders_are_rejected() {
        assert_eq!(
            render("abc ${domain", &vars()).unwrap_err(),
            TemplateError::Unterminated(4)
        );
        assert_eq!(render("${}", &vars()).unwrap_err(), TemplateError::EmptyKey(0));
    }

    #[test]
    fn placeholders_are_listed_once() {
        assert_eq!(
            placeholders("${a} ${b} ${a} ${"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
