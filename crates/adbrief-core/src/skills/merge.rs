//! Lock-aware merge of skill payloads into the document store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ParsedSkill;
use crate::documents::{DocumentStore, SetFieldsOptions, SkippedField};

/// Outcome of one merge, per target section. Skipped fields are reported,
/// never treated as failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub skill: String,
    pub sections: Vec<SectionMerge>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionMerge {
    pub section: String,
    pub written: Vec<String>,
    pub skipped: Vec<SkippedField>,
    /// The section did not exist before this merge.
    pub created: bool,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.sections.iter().all(|section| section.written.is_empty())
    }

    pub fn section(&self, name: &str) -> Option<&SectionMerge> {
        self.sections.iter().find(|section| section.section == name)
    }

    /// Skipped fields across all sections, with the section they belong to.
    pub fn skipped(&self) -> impl Iterator<Item = (&str, &SkippedField)> {
        self.sections.iter().flat_map(|section| {
            section
                .skipped
                .iter()
                .map(move |skip| (section.section.as_str(), skip))
        })
    }
}

/// Routes the payload's normalized fields to their sections and writes them
/// in one store update.
///
/// # Errors
/// Returns an error if the store cannot persist the change.
pub fn merge(store: &dyn DocumentStore, parsed: &ParsedSkill) -> Result<MergeReport> {
    let skill = parsed.payload.skill_name();
    let batch = parsed.targets.route(parsed.payload.fields());
    let outcomes = store
        .set_sections(batch, SetFieldsOptions::default())
        .with_context(|| format!("Failed to merge {skill} output"))?;

    let sections: Vec<SectionMerge> = outcomes
        .into_iter()
        .map(|(section, outcome)| {
            info!(
                skill,
                section = %section,
                written = outcome.written.len(),
                skipped = outcome.skipped.len(),
                "merged skill output"
            );
            SectionMerge {
                section,
                written: outcome.written,
                skipped: outcome.skipped,
                created: outcome.created,
            }
        })
        .collect();

    Ok(MergeReport {
        skill: skill.to_string(),
        sections,
    })
}
