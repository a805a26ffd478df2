//! Document stores holding editable sections.
//!
//! Every mutation is a read-modify-write under the store's mutex, so a user
//! edit never interleaves with a half-applied merge.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use adbrief_types::Section;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Sections = BTreeMap<String, Section>;

/// Field maps keyed by the section they are written to.
pub type SectionFields = BTreeMap<String, Map<String, Value>>;

/// Options for `DocumentStore::set_fields`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetFieldsOptions {
    /// Leave a locked section untouched.
    pub skip_locked: bool,
}

impl Default for SetFieldsOptions {
    fn default() -> Self {
        Self { skip_locked: true }
    }
}

/// Why a field was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SectionLocked,
    UserEdited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedField {
    pub field: String,
    pub reason: SkipReason,
}

/// What a `set_fields` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetFieldsOutcome {
    pub written: Vec<String>,
    pub skipped: Vec<SkippedField>,
    /// The section did not exist and was created.
    pub created: bool,
}

pub trait DocumentStore: Send + Sync {
    fn get(&self, section: &str) -> Option<Section>;

    fn sections(&self) -> Sections;

    /// Writes `fields` into `section`, creating it unlocked if missing.
    ///
    /// Fields in `user_edited_fields` are never overwritten; a locked section
    /// is skipped entirely when `options.skip_locked` is set. Fields absent
    /// from `fields` are left as they are.
    ///
    /// # Errors
    /// Returns an error if the change cannot be persisted.
    fn set_fields(
        &self,
        section: &str,
        fields: Map<String, Value>,
        options: SetFieldsOptions,
    ) -> Result<SetFieldsOutcome>;

    /// `set_fields` for several sections as one change. Lock and user-edit
    /// rules are checked per section; either every section is written or
    /// none is.
    ///
    /// # Errors
    /// Returns an error if the change cannot be persisted.
    fn set_sections(
        &self,
        batch: SectionFields,
        options: SetFieldsOptions,
    ) -> Result<BTreeMap<String, SetFieldsOutcome>>;

    /// Applies a user edit and protects the field from later merges.
    ///
    /// # Errors
    /// Returns an error if the change cannot be persisted.
    fn mark_user_edit(&self, section: &str, field: &str, value: Value) -> Result<()>;

    /// # Errors
    /// Returns an error if the change cannot be persisted.
    fn set_locked(&self, section: &str, locked: bool) -> Result<()>;
}

/// Applies a merge to a single section in place.
pub fn apply_fields(
    section: &mut Section,
    fields: Map<String, Value>,
    options: SetFieldsOptions,
) -> SetFieldsOutcome {
    let mut outcome = SetFieldsOutcome::default();
    if section.locked && options.skip_locked {
        outcome.skipped = fields
            .into_iter()
            .map(|(field, _)| SkippedField {
                field,
                reason: SkipReason::SectionLocked,
            })
            .collect();
        return outcome;
    }

    for (field, value) in fields {
        if section.is_user_edited(&field) {
            outcome.skipped.push(SkippedField {
                field,
                reason: SkipReason::UserEdited,
            });
            continue;
        }
        section.fields.insert(field.clone(), value);
        outcome.written.push(field);
    }
    outcome
}

fn lock(sections: &Mutex<Sections>) -> MutexGuard<'_, Sections> {
    sections.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_fields_in(
    sections: &mut Sections,
    section: &str,
    fields: Map<String, Value>,
    options: SetFieldsOptions,
) -> SetFieldsOutcome {
    let created = !sections.contains_key(section);
    let target = sections.entry(section.to_string()).or_default();
    let mut outcome = apply_fields(target, fields, options);
    outcome.created = created;
    outcome
}

fn set_sections_in(
    sections: &mut Sections,
    batch: SectionFields,
    options: SetFieldsOptions,
) -> BTreeMap<String, SetFieldsOutcome> {
    batch
        .into_iter()
        .map(|(section, fields)| {
            let outcome = set_fields_in(sections, &section, fields, options);
            (section, outcome)
        })
        .collect()
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    sections: Mutex<Sections>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sections(sections: Sections) -> Self {
        Self {
            sections: Mutex::new(sections),
        }
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, section: &str) -> Option<Section> {
        lock(&self.sections).get(section).cloned()
    }

    fn sections(&self) -> Sections {
        lock(&self.sections).clone()
    }

    fn set_fields(
        &self,
        section: &str,
        fields: Map<String, Value>,
        options: SetFieldsOptions,
    ) -> Result<SetFieldsOutcome> {
        Ok(set_fields_in(
            &mut lock(&self.sections),
            section,
            fields,
            options,
        ))
    }

    fn set_sections(
        &self,
        batch: SectionFields,
        options: SetFieldsOptions,
    ) -> Result<BTreeMap<String, SetFieldsOutcome>> {
        Ok(set_sections_in(&mut lock(&self.sections), batch, options))
    }

    fn mark_user_edit(&self, section: &str, field: &str, value: Value) -> Result<()> {
        lock(&self.sections)
            .entry(section.to_string())
            .or_default()
            .edit(field, value);
        Ok(())
    }

    fn set_locked(&self, section: &str, locked: bool) -> Result<()> {
        lock(&self.sections)
            .entry(section.to_string())
            .or_default()
            .locked = locked;
        Ok(())
    }
}

/// Store persisted as one pretty-printed JSON object keyed by section.
///
/// The file is rewritten after every mutation while the lock is held. A
/// mutation that cannot be written is not applied.
#[derive(Debug)]
pub struct JsonFileDocumentStore {
    path: PathBuf,
    sections: Mutex<Sections>,
}

impl JsonFileDocumentStore {
    /// Opens the store, starting empty if the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sections = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read documents from {}", path.display()))?;
            if contents.trim().is_empty() {
                Sections::new()
            } else {
                serde_json::from_str(&contents).with_context(|| {
                    format!("Failed to parse documents from {}", path.display())
                })?
            }
        } else {
            Sections::new()
        };
        Ok(Self {
            path,
            sections: Mutex::new(sections),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `f` to a copy and swaps it in once the file is written, so a
    /// failed write leaves memory matching disk.
    fn mutate<T>(&self, f: impl FnOnce(&mut Sections) -> T) -> Result<T> {
        let mut sections = lock(&self.sections);
        let mut next = sections.clone();
        let result = f(&mut next);
        persist(&self.path, &next)?;
        *sections = next;
        Ok(result)
    }
}

fn persist(path: &Path, sections: &Sections) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(sections).context("Failed to serialize documents")?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)
        .with_context(|| format!("Failed to write documents to {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })
}

impl DocumentStore for JsonFileDocumentStore {
    fn get(&self, section: &str) -> Option<Section> {
        lock(&self.sections).get(section).cloned()
    }

    fn sections(&self) -> Sections {
        lock(&self.sections).clone()
    }

    fn set_fields(
        &self,
        section: &str,
        fields: Map<String, Value>,
        options: SetFieldsOptions,
    ) -> Result<SetFieldsOutcome> {
        self.mutate(|sections| set_fields_in(sections, section, fields, options))
    }

    fn set_sections(
        &self,
        batch: SectionFields,
        options: SetFieldsOptions,
    ) -> Result<BTreeMap<String, SetFieldsOutcome>> {
        self.mutate(|sections| set_sections_in(sections, batch, options))
    }

    fn mark_user_edit(&self, section: &str, field: &str, value: Value) -> Result<()> {
        self.mutate(|sections| {
            sections
                .entry(section.to_string())
                .or_default()
                .edit(field, value);
        })
    }

    fn set_locked(&self, section: &str, locked: bool) -> Result<()> {
        self.mutate(|sections| {
            sections.entry(section.to_string()).or_default().locked = locked;
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn locked_section_is_left_untouched() {
        let store = MemoryDocumentStore::new();
        store.set_locked("brief", true).unwrap();

        let outcome = store
            .set_fields(
                "brief",
                fields(json!({"objective": "x"})),
                SetFieldsOptions::default(),
            )
            .unwrap();

        assert!(outcome.written.is_empty());
        assert_eq!(outcome.skipped[0].reason, SkipReason::SectionLocked);
        assert!(store.get("brief").unwrap().fields.is_empty());
    }

    #[test]
    fn locked_section_can_be_forced() {
        let store = MemoryDocumentStore::new();
        store.set_locked("brief", true).unwrap();

        let outcome = store
            .set_fields(
                "brief",
                fields(json!({"objective": "x"})),
                SetFieldsOptions { skip_locked: false },
            )
            .unwrap();
        assert_eq!(outcome.written, vec!["objective"]);
    }

    #[test]
    fn user_edits_survive_merges_and_absent_fields_stay() {
        let store = MemoryDocumentStore::new();
        store
            .set_fields(
                "brief",
                fields(json!({"budget": "$10k", "objective": "old"})),
                SetFieldsOptions::default(),
            )
            .unwrap();
        store
            .mark_user_edit("brief", "objective", json!("mine"))
            .unwrap();

        let outcome = store
            .set_fields(
                "brief",
                fields(json!({"objective": "theirs", "channels": ["tv"]})),
                SetFieldsOptions::default(),
            )
            .unwrap();

        assert_eq!(outcome.written, vec!["channels"]);
        assert_eq!(
            outcome.skipped,
            vec![SkippedField {
                field: "objective".to_string(),
                reason: SkipReason::UserEdited,
            }]
        );
        let section = store.get("brief").unwrap();
        assert_eq!(section.get("objective"), Some(&json!("mine")));
        assert_eq!(section.get("budget"), Some(&json!("$10k")));
    }

    #[test]
    fn missing_section_is_created_unlocked() {
        let store = MemoryDocumentStore::new();
        let outcome = store
            .set_fields("audience", fields(json!({"segments": []})), SetFieldsOptions::default())
            .unwrap();
        assert!(outcome.created);
        assert!(!store.get("audience").unwrap().locked);
    }

    #[test]
    fn batch_checks_locks_per_section() {
        let store = MemoryDocumentStore::new();
        store.set_locked("audience", true).unwrap();

        let batch = SectionFields::from([
            ("brief".to_string(), fields(json!({"objective": "Grow"}))),
            ("audience".to_string(), fields(json!({"segments": ["A"]}))),
        ]);
        let outcomes = store
            .set_sections(batch, SetFieldsOptions::default())
            .unwrap();

        assert_eq!(outcomes["brief"].written, vec!["objective"]);
        assert!(outcomes["brief"].created);
        assert!(outcomes["audience"].written.is_empty());
        assert_eq!(
            outcomes["audience"].skipped[0].reason,
            SkipReason::SectionLocked
        );
        assert!(store.get("audience").unwrap().fields.is_empty());
    }

    #[test]
    fn json_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("docs").join("documents.json");

        let store = JsonFileDocumentStore::open(&path).unwrap();
        store
            .set_fields("brief", fields(json!({"objective": "Grow"})), SetFieldsOptions::default())
            .unwrap();
        store.mark_user_edit("brief", "budget", json!("$5k")).unwrap();
        store.set_locked("brief", true).unwrap();
        drop(store);

        let reopened = JsonFileDocumentStore::open(&path).unwrap();
        let section = reopened.get("brief").unwrap();
        assert!(section.locked);
        assert!(section.is_user_edited("budget"));
        assert_eq!(section.get("objective"), Some(&json!("Grow")));
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let store = JsonFileDocumentStore::open(blocker.join("documents.json")).unwrap();

        let result = store.set_fields(
            "brief",
            fields(json!({"objective": "x"})),
            SetFieldsOptions::default(),
        );
        assert!(result.is_err());
        assert!(store.get("brief").is_none());

        assert!(store.mark_user_edit("brief", "budget", json!("$1")).is_err());
        assert!(store.set_locked("brief", true).is_err());
        assert!(store.sections().is_empty());
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("documents.json");
        fs::write(&path, "{not json").unwrap();

        let err = JsonFileDocumentStore::open(&path).unwrap_err();
        assert!(format!("{err}").contains("Failed to parse documents"));
    }
}
