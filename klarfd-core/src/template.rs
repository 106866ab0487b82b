//! Output directory templates such as `/data/output/{loader_name}`.
//!
//! Placeholders are resolved from fields of the parsed report once it is
//! available. Resolution is pure and knows nothing about the report schema.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no value for placeholder {{{0}}}")]
    MissingField(String),

    #[error("value {value:?} for placeholder {{{field}}} is not a single path segment")]
    InvalidValue { field: String, value: String },
}

/// An output location with `{name}` placeholders.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputTemplate(String);

impl OutputTemplate {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder names in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        PLACEHOLDER
            .captures_iter(&self.0)
            .filter_map(|caps| caps.get(1))
            .map(|name| name.as_str())
            .collect()
    }

    pub fn is_templated(&self) -> bool {
        PLACEHOLDER.is_match(&self.0)
    }

    /// Longest leading directory that contains no placeholder. This part can
    /// be created at startup.
    pub fn static_prefix(&self) -> PathBuf {
        let mut prefix = PathBuf::new();
        for component in Path::new(&self.0).components() {
            if PLACEHOLDER.is_match(&component.as_os_str().to_string_lossy()) {
                break;
            }
            prefix.push(component);
        }
        prefix
    }

    /// Substitute every placeholder using `lookup`.
    ///
    /// Values come from file content, so each one must be a plain path
    /// segment; separators and `..` are rejected.
    pub fn resolve<'a, F>(&self, lookup: F) -> Result<PathBuf, TemplateError>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut resolved = String::with_capacity(self.0.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(&self.0) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let field = name.as_str();
            let value = lookup(field)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| TemplateError::MissingField(field.to_string()))?;

            if !is_single_segment(value) {
                return Err(TemplateError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }

            resolved.push_str(&self.0[last..whole.start()]);
            resolved.push_str(value);
            last = whole.end();
        }
        resolved.push_str(&self.0[last..]);

        Ok(PathBuf::from(resolved))
    }
}

impl fmt::Display for OutputTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OutputTemplate {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

fn is_single_segment(value: &str) -> bool {
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn resolves_named_placeholders() {
        let template = OutputTemplate::new("/data/output/{loader_name}/{lot_id}");
        let fields: HashMap<&str, &str> =
            HashMap::from([("loader_name", "KLA01"), ("lot_id", "LOT42")]);

        let path = template.resolve(|name| fields.get(name).copied()).unwrap();
        assert_eq!(path, PathBuf::from("/data/output/KLA01/LOT42"));
        assert_eq!(template.placeholders(), vec!["loader_name", "lot_id"]);
    }

    #[test]
    fn plain_paths_pass_through() {
        let template = OutputTemplate::new("/data/output");
        assert!(!template.is_templated());
        assert_eq!(
            template.resolve(|_| None).unwrap(),
            PathBuf::from("/data/output")
        );
    }

    #[test]
    fn missing_field_is_an_error() {
        let template = OutputTemplate::new("/data/{loader_name}");
        assert_eq!(
            template.resolve(|_| None),
            Err(TemplateError::MissingField("loader_name".into()))
        );
    }

    #[test]
    fn traversal_values_are_rejected() {
        let template = OutputTemplate::new("/data/{loader_name}");
        for bad in ["..", "a/b", "..\\x", "."] {
            let err = template.resolve(|_| Some(bad)).unwrap_err();
            assert!(matches!(err, TemplateError::InvalidValue { .. }), "{bad}");
        }
    }

    #[test]
    fn static_prefix_stops_at_first_placeholder() {
        let template = OutputTemplate::new("/data/output/{loader_name}/maps");
        assert_eq!(template.static_prefix(), PathBuf::from("/data/output"));
        assert_eq!(
            OutputTemplate::new("/data/output").static_prefix(),
            PathBuf::from("/data/output")
        );
    }
}
