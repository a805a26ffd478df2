//! Editable document sections targeted by skill merges.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named group of fields in a document (e.g. the campaign brief).
///
/// `locked` freezes the whole section against automated merges.
/// `user_edited_fields` protects individual fields regardless of the lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Section {
    pub fields: BTreeMap<String, Value>,
    pub locked: bool,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub user_edited_fields: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Section {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn is_user_edited(&self, field: &str) -> bool {
        self.user_edited_fields.contains(field)
    }

    /// Applies a user edit and protects the field from later merges.
    pub fn edit(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        self.user_edited_fields.insert(field.clone());
        self.fields.insert(field, value);
    }
}
