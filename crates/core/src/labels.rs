//! Label maps and equality selectors.
//!
//! Labels are a sorted `key -> value` map so their string form (`k=v,k2=v2`) is stable and
//! can be compared directly to detect label changes.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix reserved for labels maintained by the server.
pub const RESERVED_PREFIX: &str = "bindplane/";

/// Label that pins an agent to a named configuration, overriding selector matching.
pub const CONFIGURATION_LABEL: &str = "configuration";

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

static NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("static label regex")
});
static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static label prefix regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    pub fn new() -> Self { Self::default() }

    /// Build labels from pairs, validating every key and value.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut out = Labels::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            validate_key(&k)?;
            validate_value(&v)?;
            out.0.insert(k, v);
        }
        Ok(out)
    }

    pub fn get(&self, key: &str) -> Option<&str> { self.0.get(key).map(|s| s.as_str()) }
    pub fn contains_key(&self, key: &str) -> bool { self.0.contains_key(key) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> { self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())) }

    /// Insert without validation. Used for server-maintained labels whose values come from
    /// agent-reported attributes.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> { self.0.remove(key) }

    /// Validate every pair.
    pub fn validate(&self) -> Result<()> {
        for (k, v) in self.0.iter() {
            validate_key(k)?;
            validate_value(v)?;
        }
        Ok(())
    }

    /// Labels with the reserved `bindplane/` prefix.
    pub fn reserved(&self) -> Labels {
        Labels(self.0.iter().filter(|(k, _)| is_reserved(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Labels without the reserved prefix.
    pub fn custom(&self) -> Labels {
        Labels(self.0.iter().filter(|(k, _)| !is_reserved(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// True if `other` assigns a different value to any key already present here.
    pub fn conflicts(&self, other: &Labels) -> bool {
        other.0.iter().any(|(k, v)| self.0.get(k).map(|cur| cur != v).unwrap_or(false))
    }

    /// Keys of `other` that would change a value already present here.
    pub fn conflicting_keys(&self, other: &Labels) -> Vec<String> {
        other
            .0
            .iter()
            .filter(|(k, v)| self.0.get(*k).map(|cur| cur != *v).unwrap_or(false))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Copy of `self` with every pair from `other` applied on top.
    pub fn merged(&self, other: &Labels) -> Labels {
        let mut out = self.clone();
        for (k, v) in other.0.iter() {
            out.0.insert(k.clone(), v.clone());
        }
        out
    }

    /// True when every pair in `subset` is present here with the same value.
    pub fn is_superset_of(&self, subset: &Labels) -> bool {
        subset.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> { &self.0 }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0.iter() {
            if !first { f.write_str(",")?; }
            first = false;
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

impl FromStr for Labels {
    type Err = Error;

    /// Parse `k=v[,k=v]*`. Whitespace around pairs is ignored; an empty string is empty labels.
    fn from_str(s: &str) -> Result<Self> {
        let mut out = Labels::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() { continue; }
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| Error::Invalid(format!("invalid label '{}': expected key=value", part)))?;
            let (k, v) = (k.trim(), v.trim());
            validate_key(k)?;
            validate_value(v)?;
            out.0.insert(k.to_string(), v.to_string());
        }
        Ok(out)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'a str, &'a str)>>(iter: T) -> Self {
        Labels(iter.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }
}

pub fn is_reserved(key: &str) -> bool { key.starts_with(RESERVED_PREFIX) }

fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > MAX_PREFIX_LEN || !PREFIX_RE.is_match(p) {
            return Err(Error::Invalid(format!("invalid label key '{}': bad prefix", key)));
        }
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(Error::Invalid(format!("invalid label key '{}'", key)));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.is_empty() { return Ok(()); }
    if value.len() > MAX_NAME_LEN || !NAME_RE.is_match(value) {
        return Err(Error::Invalid(format!("invalid label value '{}'", value)));
    }
    Ok(())
}

/// Conjunction of `key=value` requirements. The empty selector is the everything selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Labels,
}

impl Selector {
    /// Selector matching every label set.
    pub fn everything() -> Self { Self::default() }

    pub fn from_labels(labels: &Labels) -> Self { Self { requirements: labels.clone() } }

    pub fn is_everything(&self) -> bool { self.requirements.is_empty() }

    pub fn matches(&self, labels: &Labels) -> bool { labels.is_superset_of(&self.requirements) }

    pub fn requirements(&self) -> &Labels { &self.requirements }
}

impl FromStr for Selector {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Ok(Self { requirements: s.parse()? }) }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.requirements.fmt(f) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_are_sorted() {
        let l: Labels = "env=test, app=bp".parse().unwrap();
        assert_eq!(l.to_string(), "app=bp,env=test");
        assert_eq!(l.get("env"), Some("test"));
        assert!("".parse::<Labels>().unwrap().is_empty());
    }

    #[test]
    fn invalid_pairs_rejected() {
        assert!("env".parse::<Labels>().is_err());
        assert!("-bad=x".parse::<Labels>().is_err());
        assert!("ok=bad value".parse::<Labels>().is_err());
        assert!("bindplane/agent-id=abc".parse::<Labels>().is_ok());
    }

    #[test]
    fn conflicts_only_on_changed_values() {
        let cur: Labels = "env=prod,app=web".parse().unwrap();
        assert!(!cur.conflicts(&"env=prod,tier=fe".parse().unwrap()));
        assert!(cur.conflicts(&"env=dev".parse().unwrap()));
        assert_eq!(cur.conflicting_keys(&"env=dev,app=web".parse().unwrap()), vec!["env".to_string()]);
    }

    #[test]
    fn selector_matches_superset() {
        let sel: Selector = "env=test,app=bp".parse().unwrap();
        assert!(sel.matches(&"env=test,app=bp,x=y".parse().unwrap()));
        assert!(!sel.matches(&"env=test".parse().unwrap()));
        assert!(Selector::everything().matches(&Labels::new()));
    }

    #[test]
    fn reserved_split() {
        let l: Labels = "bindplane/agent-id=1,env=prod".parse().unwrap();
        assert_eq!(l.reserved().to_string(), "bindplane/agent-id=1");
        assert_eq!(l.custom().to_string(), "env=prod");
    }
}
