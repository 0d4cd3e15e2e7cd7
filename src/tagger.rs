use std::collections::BTreeMap;

use tracing::debug;

use crate::config::{expand_vars, Config};
use crate::types::RunContext;

/// Tags appended to every line a check emits during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        Self(tags)
    }

    /// Build the run's tags from `[tags]`, dropping keys shadowed by a default
    /// and expanding `${name}` references in the values.
    pub fn resolve(config: &Config, ctx: &RunContext) -> Self {
        let tags = config
            .tags
            .iter()
            .filter(|(key, _)| {
                let shadowed = config.is_default_key(key);
                if shadowed {
                    debug!(tag = %key, "Skipping tag shadowed by a default");
                }
                !shadowed
            })
            .map(|(key, value)| {
                let value = expand_vars(value, |name| config.lookup(name, &ctx.hostname));
                (key.clone(), value)
            })
            .collect();

        Self(tags)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Render tags as the suffix for a metric line: ` k1=v1 k2=v2`, keys ascending.
pub fn render(tags: &TagSet) -> String {
    tags.iter().fold(String::new(), |mut out, (key, value)| {
        out.push(' ');
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out
    })
}
