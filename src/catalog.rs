use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One fetchable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub source_url: String,
}

/// How a model name turns into a download URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlStrategy {
    BaseJoin,
    Fixed(String),
}

/// Name-to-URL resolution: a base URL plus a table of per-name overrides.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    base_url: String,
    overrides: BTreeMap<String, String>,
}

impl Catalog {
    pub fn new(base_url: impl Into<String>, overrides: BTreeMap<String, String>) -> Self {
        Self { base_url: base_url.into(), overrides }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn strategy(&self, name: &str) -> UrlStrategy {
        match self.overrides.get(name) {
            Some(url) => UrlStrategy::Fixed(url.clone()),
            None => UrlStrategy::BaseJoin,
        }
    }

    pub fn resolve(&self, name: &str) -> ModelSpec {
        let source_url = match self.strategy(name) {
            UrlStrategy::Fixed(url) => url,
            UrlStrategy::BaseJoin => format!("{}/{}", self.base_url.trim_end_matches('/'), name),
        };
        ModelSpec { name: name.to_string(), source_url }
    }

    /// Resolve a list of names in order, rejecting unsafe or repeated names.
    pub fn specs<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ModelSpec>, ConfigError> {
        let mut seen = BTreeSet::new();
        let mut specs = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            validate_name(name)?;
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateName(name.to_string()));
            }
            specs.push(self.resolve(name));
        }
        Ok(specs)
    }
}

/// Names become file names inside the target directory, so anything that
/// could escape it is refused.
fn validate_name(name: &str) -> Result<(), ConfigError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(ConfigError::InvalidName(name.to_string()));
    }
    Ok(())
}
