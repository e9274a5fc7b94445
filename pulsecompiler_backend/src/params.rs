//! Named experiment parameters.
//!
//! Sequences read their inputs from a flat map keyed by [`ParameterKey`], a `(collection, name)`
//! pair such as `Cooling.duration`. The map is usually filled from an external parameter vault
//! through [`collect_parameters`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::units::WithUnit;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterKey {
    pub collection: String,
    pub name: String,
}

impl ParameterKey {
    pub fn new(collection: &str, name: &str) -> Self {
        Self {
            collection: collection.to_string(),
            name: name.to_string(),
        }
    }
}

fn key_regex() -> &'static Regex {
    static KEY_RE: OnceLock<Regex> = OnceLock::new();
    KEY_RE.get_or_init(|| Regex::new(r"^\s*([^.\s]+)\.([^.\s]+)\s*$").unwrap())
}

impl FromStr for ParameterKey {
    type Err = Error;

    /// Parses `"collection.name"`. Both parts must be non-empty and free of dots.
    fn from_str(s: &str) -> Result<Self> {
        let caps = key_regex()
            .captures(s)
            .ok_or_else(|| Error::InvalidParameterKey(s.to_string()))?;
        Ok(ParameterKey::new(&caps[1], &caps[2]))
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.name)
    }
}

pub type ParameterMap = HashMap<ParameterKey, WithUnit>;

/// Builds a [`ParameterMap`] from `"collection.name" => value` pairs.
///
/// # Example
/// ```
/// use maplit::hashmap;
/// use pulsecompiler_backend::params::*;
/// use pulsecompiler_backend::units::*;
///
/// let params = parameter_map(hashmap! {
///     "Cooling.duration" => WithUnit::new(5., Unit::Us),
/// }).unwrap();
/// assert!(params.contains_key(&ParameterKey::new("Cooling", "duration")));
/// ```
pub fn parameter_map<'a, I>(entries: I) -> Result<ParameterMap>
where
    I: IntoIterator<Item = (&'a str, WithUnit)>,
{
    entries
        .into_iter()
        .map(|(key, value)| Ok((key.parse::<ParameterKey>()?, value)))
        .collect()
}

/// An external store of named parameters.
pub trait ParameterSource {
    fn get_parameter(&self, collection: &str, name: &str) -> Option<WithUnit>;
}

impl ParameterSource for ParameterMap {
    fn get_parameter(&self, collection: &str, name: &str) -> Option<WithUnit> {
        self.get(&ParameterKey::new(collection, name)).copied()
    }
}

/// Fetches every key from `source`. The first absent key is reported as
/// [`Error::MissingParameter`] on behalf of `sequence`.
pub fn collect_parameters<'a, S, I>(source: &S, keys: I, sequence: &str) -> Result<ParameterMap>
where
    S: ParameterSource + ?Sized,
    I: IntoIterator<Item = &'a ParameterKey>,
{
    let mut params = ParameterMap::new();
    for key in keys {
        let value = source
            .get_parameter(&key.collection, &key.name)
            .ok_or_else(|| Error::MissingParameter {
                collection: key.collection.clone(),
                name: key.name.clone(),
                sequence: sequence.to_string(),
            })?;
        params.insert(key.clone(), value);
    }
    Ok(params)
}
