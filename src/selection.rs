//! Sparse protein → selection-name tags, the exchange format with storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::warn;

use crate::domain::{DatasetId, HexColor};
use crate::error::KiraError;

/// The only value a selection map stores. Absence means "not selected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SelectionFlag {
    True,
}

impl Serialize for SelectionFlag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bool(true)
    }
}

impl<'de> Deserialize<'de> for SelectionFlag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlagVisitor;

        impl Visitor<'_> for FlagVisitor {
            type Value = SelectionFlag;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("the boolean `true`")
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<SelectionFlag, E> {
                if value {
                    Ok(SelectionFlag::True)
                } else {
                    Err(E::invalid_value(de::Unexpected::Bool(false), &self))
                }
            }
        }

        deserializer.deserialize_bool(FlagVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionMap {
    entries: BTreeMap<String, BTreeMap<String, SelectionFlag>>,
}

impl SelectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a loosely typed `{protein: {name: bool}}` document. `false`
    /// and non-boolean leaves are dropped, anything that is not an object
    /// of objects is rejected.
    pub fn from_json(value: &Value) -> Result<Self, KiraError> {
        let Value::Object(proteins) = value else {
            return Err(KiraError::InvalidSelectionMap(
                "expected an object keyed by protein id".to_string(),
            ));
        };
        let mut map = Self::new();
        for (protein, names) in proteins {
            let Value::Object(names) = names else {
                return Err(KiraError::InvalidSelectionMap(format!(
                    "entry for {protein} is not an object"
                )));
            };
            for (name, flag) in names {
                match flag {
                    Value::Bool(true) => map.insert(protein, name),
                    Value::Bool(false) | Value::Null => {}
                    other => warn!(%protein, %name, value = %other, "ignoring non-boolean selection"),
                }
            }
        }
        Ok(map)
    }

    pub fn insert(&mut self, protein: &str, name: &str) {
        self.entries
            .entry(protein.to_string())
            .or_default()
            .insert(name.to_string(), SelectionFlag::True);
    }

    /// Removes one tag, dropping the protein when it has none left.
    pub fn remove(&mut self, protein: &str, name: &str) -> bool {
        let Some(names) = self.entries.get_mut(protein) else {
            return false;
        };
        let removed = names.remove(name).is_some();
        if names.is_empty() {
            self.entries.remove(protein);
        }
        removed
    }

    pub fn contains(&self, protein: &str, name: &str) -> bool {
        self.entries
            .get(protein)
            .is_some_and(|names| names.contains_key(name))
    }

    pub fn selections_of(&self, protein: &str) -> impl Iterator<Item = &str> {
        self.entries
            .get(protein)
            .into_iter()
            .flat_map(|names| names.keys().map(String::as_str))
    }

    pub fn proteins_with<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(_, names)| names.contains_key(name))
            .map(|(protein, _)| protein.as_str())
    }

    pub fn selection_names(&self) -> BTreeSet<&str> {
        self.entries
            .values()
            .flat_map(|names| names.keys().map(String::as_str))
            .collect()
    }

    /// Drops every tag named `name`. Returns how many proteins lost it.
    pub fn remove_selection(&mut self, name: &str) -> usize {
        let mut removed = 0;
        for names in self.entries.values_mut() {
            if names.remove(name).is_some() {
                removed += 1;
            }
        }
        self.strip_empty();
        removed
    }

    /// Union merge: every tag in `other` is added, nothing is removed.
    pub fn merge(&mut self, other: &SelectionMap) {
        for (protein, names) in &other.entries {
            for name in names.keys() {
                self.insert(protein, name);
            }
        }
    }

    pub fn strip_empty(&mut self) {
        self.entries.retain(|_, names| !names.is_empty());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a selection session mutates for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSelections {
    pub dataset: DatasetId,
    #[serde(default)]
    pub selections: SelectionMap,
    #[serde(default)]
    pub colors: BTreeMap<String, HexColor>,
}

impl DatasetSelections {
    pub fn new(dataset: DatasetId) -> Self {
        Self {
            dataset,
            selections: SelectionMap::new(),
            colors: BTreeMap::new(),
        }
    }
}
