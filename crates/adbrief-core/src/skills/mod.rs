//! Skill output extraction.
//!
//! The agent embeds structured results in its replies as fenced code blocks
//! whose language tag names a skill:
//!
//! ````text
//! ```campaign-brief
//! {"campaignName": "...", "objective": "...", "targetAudience": "..."}
//! ```
//! ````
//!
//! Only the first fence with a registered tag is considered. Anything that
//! fails to parse or validate is logged and ignored.

pub mod merge;
pub mod normalize;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use self::merge::{MergeReport, SectionMerge, merge};
pub use self::normalize::Confidence;
use crate::config::CustomSkillConfig;
use crate::documents::{DocumentStore, SectionFields};

pub const CAMPAIGN_BRIEF: &str = "campaign-brief";
pub const AUDIENCE_RESEARCH: &str = "audience-research";
pub const CREATIVE_CONCEPTS: &str = "creative-concepts";

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_.-]+)[ \t]*\r?\n(.*?)```")
        .expect("fence pattern is a valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignBrief {
    #[serde(deserialize_with = "normalize::de_text")]
    pub campaign_name: String,
    #[serde(deserialize_with = "normalize::de_text")]
    pub objective: String,
    #[serde(deserialize_with = "normalize::de_text")]
    pub target_audience: String,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub key_messages: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub channels: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub kpis: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub budget: Option<String>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeline: Option<String>,
    #[serde(
        default,
        deserialize_with = "normalize::de_confidence",
        skip_serializing_if = "Option::is_none"
    )]
    pub confidence: Option<Confidence>,
    /// Fields without a dedicated normalizer, passed through.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceResearch {
    #[serde(deserialize_with = "normalize::de_list")]
    pub segments: Vec<String>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub insights: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "normalize::de_confidence",
        skip_serializing_if = "Option::is_none"
    )]
    pub confidence: Option<Confidence>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreativeConcepts {
    #[serde(deserialize_with = "normalize::de_list")]
    pub concepts: Vec<String>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub headlines: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "normalize::de_opt_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub tone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A validated, normalized skill payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillPayload {
    CampaignBrief(CampaignBrief),
    AudienceResearch(AudienceResearch),
    CreativeConcepts(CreativeConcepts),
    Custom {
        name: String,
        fields: Map<String, Value>,
    },
}

impl SkillPayload {
    pub fn skill_name(&self) -> &str {
        match self {
            SkillPayload::CampaignBrief(_) => CAMPAIGN_BRIEF,
            SkillPayload::AudienceResearch(_) => AUDIENCE_RESEARCH,
            SkillPayload::CreativeConcepts(_) => CREATIVE_CONCEPTS,
            SkillPayload::Custom { name, .. } => name,
        }
    }

    /// Normalized top-level fields, keyed as the agent sent them.
    pub fn fields(&self) -> Map<String, Value> {
        let value = match self {
            SkillPayload::CampaignBrief(brief) => serde_json::to_value(brief),
            SkillPayload::AudienceResearch(research) => serde_json::to_value(research),
            SkillPayload::CreativeConcepts(concepts) => serde_json::to_value(concepts),
            SkillPayload::Custom { fields, .. } => return fields.clone(),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// A skill fence found in agent output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSkill {
    pub payload: SkillPayload,
    /// The JSON exactly as the agent wrote it.
    pub raw: Value,
    pub targets: SectionTargets,
}

/// Where a skill's fields land: a default section plus per-field overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectionTargets {
    pub default: String,
    pub fields: BTreeMap<String, String>,
}

impl SectionTargets {
    pub fn single(section: impl Into<String>) -> Self {
        Self {
            default: section.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn section_for(&self, field: &str) -> &str {
        self.fields.get(field).map_or(self.default.as_str(), String::as_str)
    }

    /// Every section the skill can write to, default first.
    pub fn sections(&self) -> Vec<&str> {
        let mut sections = vec![self.default.as_str()];
        for section in self.fields.values() {
            if !sections.contains(&section.as_str()) {
                sections.push(section.as_str());
            }
        }
        sections
    }

    /// Groups `fields` by target section.
    pub fn route(&self, fields: Map<String, Value>) -> SectionFields {
        let mut batch = SectionFields::new();
        for (field, value) in fields {
            batch
                .entry(self.section_for(&field).to_string())
                .or_default()
                .insert(field, value);
        }
        batch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillParseError {
    InvalidJson { skill: String, message: String },
    NotAnObject { skill: String },
    MissingKeys { skill: String, keys: Vec<String> },
    Schema { skill: String, message: String },
}

impl fmt::Display for SkillParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillParseError::InvalidJson { skill, message } => {
                write!(f, "{skill}: invalid JSON: {message}")
            }
            SkillParseError::NotAnObject { skill } => {
                write!(f, "{skill}: payload is not a JSON object")
            }
            SkillParseError::MissingKeys { skill, keys } => {
                write!(f, "{skill}: missing required keys: {}", keys.join(", "))
            }
            SkillParseError::Schema { skill, message } => write!(f, "{skill}: {message}"),
        }
    }
}

impl std::error::Error for SkillParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkillKind {
    CampaignBrief,
    AudienceResearch,
    CreativeConcepts,
    Custom,
}

/// A registered skill: its fence tag, required keys and target sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillDefinition {
    pub name: String,
    pub required_keys: Vec<String>,
    pub targets: SectionTargets,
    kind: SkillKind,
}

impl SkillDefinition {
    fn builtin(name: &str, required: &[&str], section: &str, kind: SkillKind) -> Self {
        Self {
            name: name.to_string(),
            required_keys: required.iter().map(ToString::to_string).collect(),
            targets: SectionTargets::single(section),
            kind,
        }
    }

    fn validate(&self, raw: Value) -> Result<SkillPayload, SkillParseError> {
        let Value::Object(map) = raw else {
            return Err(SkillParseError::NotAnObject {
                skill: self.name.clone(),
            });
        };
        let missing: Vec<String> = self
            .required_keys
            .iter()
            .filter(|key| !map.contains_key(key.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(SkillParseError::MissingKeys {
                skill: self.name.clone(),
                keys: missing,
            });
        }

        match self.kind {
            SkillKind::CampaignBrief => self.typed(map).map(SkillPayload::CampaignBrief),
            SkillKind::AudienceResearch => self.typed(map).map(SkillPayload::AudienceResearch),
            SkillKind::CreativeConcepts => self.typed(map).map(SkillPayload::CreativeConcepts),
            SkillKind::Custom => Ok(SkillPayload::Custom {
                name: self.name.clone(),
                fields: map,
            }),
        }
    }

    fn typed<T: DeserializeOwned>(&self, map: Map<String, Value>) -> Result<T, SkillParseError> {
        serde_json::from_value(Value::Object(map)).map_err(|err| SkillParseError::Schema {
            skill: self.name.clone(),
            message: err.to_string(),
        })
    }
}

/// The set of skill tags recognised in agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillRegistry {
    skills: Vec<SkillDefinition>,
}

impl Default for SkillRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SkillRegistry {
    pub fn builtin() -> Self {
        Self {
            skills: vec![
                SkillDefinition::builtin(
                    CAMPAIGN_BRIEF,
                    &["campaignName", "objective", "targetAudience"],
                    "brief",
                    SkillKind::CampaignBrief,
                ),
                SkillDefinition::builtin(
                    AUDIENCE_RESEARCH,
                    &["segments"],
                    "audience",
                    SkillKind::AudienceResearch,
                ),
                SkillDefinition::builtin(
                    CREATIVE_CONCEPTS,
                    &["concepts"],
                    "creative",
                    SkillKind::CreativeConcepts,
                ),
            ],
        }
    }

    /// Built-in skills plus custom ones from config. A custom skill whose
    /// name is already registered is ignored.
    pub fn with_custom(custom: &[CustomSkillConfig]) -> Self {
        let mut registry = Self::builtin();
        for skill in custom {
            if skill.name.trim().is_empty() || skill.section.trim().is_empty() {
                warn!(name = %skill.name, "ignoring custom skill without name or section");
                continue;
            }
            if registry.get(&skill.name).is_some() {
                warn!(name = %skill.name, "ignoring duplicate custom skill");
                continue;
            }
            let mut targets = SectionTargets::single(skill.section.trim());
            for (field, section) in &skill.field_sections {
                if section.trim().is_empty() {
                    warn!(name = %skill.name, %field, "ignoring blank field section");
                    continue;
                }
                targets.fields.insert(field.clone(), section.trim().to_string());
            }
            registry.skills.push(SkillDefinition {
                name: skill.name.clone(),
                required_keys: skill.required_keys.clone(),
                targets,
                kind: SkillKind::Custom,
            });
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&SkillDefinition> {
        self.skills.iter().find(|skill| skill.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.skills.iter().map(|skill| skill.name.as_str())
    }

    /// Parses the first registered skill fence in `text`.
    ///
    /// # Errors
    /// Returns `SkillParseError` when the fence body is not valid JSON or
    /// fails validation. `Ok(None)` means no registered fence was found.
    pub fn try_parse(&self, text: &str) -> Result<Option<ParsedSkill>, SkillParseError> {
        let Some((skill, body)) = FENCE.captures_iter(text).find_map(|caps| {
            let tag = caps.get(1)?.as_str();
            let body = caps.get(2)?.as_str();
            self.get(tag).map(|skill| (skill, body))
        }) else {
            return Ok(None);
        };

        let raw: Value =
            serde_json::from_str(body.trim()).map_err(|err| SkillParseError::InvalidJson {
                skill: skill.name.clone(),
                message: err.to_string(),
            })?;
        let payload = skill.validate(raw.clone())?;
        Ok(Some(ParsedSkill {
            payload,
            raw,
            targets: skill.targets.clone(),
        }))
    }

    /// Like `try_parse`, but failures are logged and treated as no output.
    pub fn parse(&self, text: &str) -> Option<ParsedSkill> {
        match self.try_parse(text) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(error = %err, "ignoring skill output");
                None
            }
        }
    }
}

/// A skill extracted from a message and merged into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedSkill {
    pub skill: ParsedSkill,
    pub report: MergeReport,
}

/// Extracts a skill payload from `text` and merges it into `store`.
///
/// # Errors
/// Returns an error only if the store fails to persist the merge.
pub fn apply_skill_output(
    registry: &SkillRegistry,
    store: &dyn DocumentStore,
    text: &str,
) -> anyhow::Result<Option<AppliedSkill>> {
    let Some(skill) = registry.parse(text) else {
        return Ok(None);
    };
    let report = merge(store, &skill)?;
    Ok(Some(AppliedSkill { skill, report }))
}
