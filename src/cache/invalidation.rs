//! Declared invalidation rules.
//!
//! Each mutation category maps to a list of key templates such as
//! `like/{article_id}`. Templates are resolved against the mutation's own
//! arguments before its settlement marks the resulting keys stale.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use super::keys::{CacheKey, KeySegment};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("malformed key template `{template}`: {reason}")]
    Malformed { template: String, reason: String },
    #[error("key template `{template}` needs argument `{name}`")]
    MissingArgument { template: String, name: String },
    #[error("no invalidation rule declared for mutation category `{0}`")]
    UnknownCategory(String),
}

impl TemplateError {
    fn malformed(template: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            template: template.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateSegment {
    Literal(KeySegment),
    /// Replaced by the mutation argument of the same name.
    Param(String),
}

/// Key with named holes, e.g. `["article", {article_id}]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct KeyTemplate(Vec<TemplateSegment>);

impl KeyTemplate {
    pub fn literal(segment: impl Into<KeySegment>) -> Self {
        Self(vec![TemplateSegment::Literal(segment.into())])
    }

    pub fn lit(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(TemplateSegment::Literal(segment.into()));
        self
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.0.push(TemplateSegment::Param(name.into()));
        self
    }

    pub fn segments(&self) -> &[TemplateSegment] {
        &self.0
    }

    pub fn resolve(&self, args: &MutationArgs) -> Result<CacheKey, TemplateError> {
        self.0
            .iter()
            .map(|segment| match segment {
                TemplateSegment::Literal(value) => Ok(value.clone()),
                TemplateSegment::Param(name) => {
                    args.get(name)
                        .cloned()
                        .ok_or_else(|| TemplateError::MissingArgument {
                            template: self.to_string(),
                            name: name.clone(),
                        })
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(CacheKey::from)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            match segment {
                TemplateSegment::Literal(value) => write!(f, "{value}")?,
                TemplateSegment::Param(name) => write!(f, "{{{name}}}")?,
            }
        }
        Ok(())
    }
}

/// Parses `segment/segment/...`; `{name}` marks a parameter. An all-digit
/// literal that fits an `i64` becomes an integer segment, anything else is
/// text. Parameters take whatever segment kind the argument carries.
impl FromStr for KeyTemplate {
    type Err = TemplateError;

    fn from_str(template: &str) -> Result<Self, Self::Err> {
        let trimmed = template.trim();
        if trimmed.is_empty() {
            return Err(TemplateError::malformed(template, "template is empty"));
        }

        trimmed
            .split('/')
            .map(|raw| {
                if raw.is_empty() {
                    return Err(TemplateError::malformed(template, "empty segment"));
                }
                match raw.strip_prefix('{') {
                    Some(rest) => {
                        let name = rest.strip_suffix('}').ok_or_else(|| {
                            TemplateError::malformed(template, format!("unclosed `{raw}`"))
                        })?;
                        if name.is_empty() || name.contains(['{', '}']) {
                            return Err(TemplateError::malformed(
                                template,
                                format!("bad parameter `{raw}`"),
                            ));
                        }
                        Ok(TemplateSegment::Param(name.to_string()))
                    }
                    None if raw.contains(['{', '}']) => Err(TemplateError::malformed(
                        template,
                        format!("stray brace in `{raw}`"),
                    )),
                    None => Ok(TemplateSegment::Literal(literal_segment(raw))),
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

fn literal_segment(raw: &str) -> KeySegment {
    match raw.parse::<i64>() {
        Ok(value) if raw.bytes().all(|byte| byte.is_ascii_digit()) => KeySegment::Int(value),
        _ => KeySegment::from(raw),
    }
}

impl TryFrom<String> for KeyTemplate {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Named arguments of one mutation, used to fill template parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationArgs(BTreeMap<String, KeySegment>);

impl MutationArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<KeySegment>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&KeySegment> {
        self.0.get(name)
    }
}

/// Static table from mutation category to the key templates it invalidates.
#[derive(Debug, Clone, Default)]
pub struct InvalidationGraph {
    rules: HashMap<String, Vec<KeyTemplate>>,
}

impl InvalidationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or replace) the rule for `category`.
    pub fn rule<I>(mut self, category: impl Into<String>, templates: I) -> Self
    where
        I: IntoIterator<Item = KeyTemplate>,
    {
        self.rules
            .insert(category.into(), templates.into_iter().collect());
        self
    }

    /// Add templates to an existing rule, creating it when absent. Duplicate
    /// templates are skipped.
    pub fn extend<I>(&mut self, category: impl Into<String>, templates: I)
    where
        I: IntoIterator<Item = KeyTemplate>,
    {
        let rule = self.rules.entry(category.into()).or_default();
        for template in templates {
            if !rule.contains(&template) {
                rule.push(template);
            }
        }
    }

    pub fn replace<I>(&mut self, category: impl Into<String>, templates: I)
    where
        I: IntoIterator<Item = KeyTemplate>,
    {
        self.rules
            .insert(category.into(), templates.into_iter().collect());
    }

    pub fn templates(&self, category: &str) -> Option<&[KeyTemplate]> {
        self.rules.get(category).map(Vec::as_slice)
    }

    /// Categories in sorted order.
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self.rules.keys().map(String::as_str).collect();
        categories.sort_unstable();
        categories
    }

    /// Resolve every template of `category` against `args`, dropping
    /// duplicate keys while keeping declaration order.
    pub fn resolve(
        &self,
        category: &str,
        args: &MutationArgs,
    ) -> Result<Vec<CacheKey>, TemplateError> {
        let templates = self
            .templates(category)
            .ok_or_else(|| TemplateError::UnknownCategory(category.to_string()))?;

        let mut keys: Vec<CacheKey> = Vec::with_capacity(templates.len());
        for template in templates {
            let key = template.resolve(args)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}
