//! Subagent definitions — JSON documents under `<workdir>/.wave/agents/`,
//! lazily loaded and cached by the supervisor.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;

use super::SubagentError;

pub const AGENTS_DIR: &str = ".wave/agents";

/// Model selection for a subagent. Serialized as a plain string:
/// `"inherit"`, `"fastModel"`, or a literal model name; a missing field
/// means inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ModelChoice {
    #[default]
    Inherit,
    FastModel,
    Named(String),
}

impl ModelChoice {
    pub fn resolve(&self, agent_model: &str, fast_model: &str) -> String {
        match self {
            Self::Inherit => agent_model.to_string(),
            Self::FastModel => fast_model.to_string(),
            Self::Named(name) => name.clone(),
        }
    }
}

impl Serialize for ModelChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Inherit => "inherit".serialize(serializer),
            Self::FastModel => "fastModel".serialize(serializer),
            Self::Named(name) => name.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ModelChoice {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(match value.as_str() {
            "inherit" => Self::Inherit,
            "fastModel" => Self::FastModel,
            _ => Self::Named(value),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub system_prompt: String,
    /// Allow-list of tool names; absent means every registered tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub model: ModelChoice,
}

/// Read every `*.json` definition under `<workdir>/.wave/agents`. A missing
/// directory yields an empty set; a malformed file aborts loading.
pub fn load_configs(workdir: &Path) -> Result<Vec<SubagentConfig>, SubagentError> {
    let dir = workdir.join(AGENTS_DIR);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(Vec::new());
    };
    let mut configs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let json =
            std::fs::read_to_string(&path).map_err(|e| SubagentError::InvalidDefinition {
                path: path.clone(),
                detail: e.to_string(),
            })?;
        let config: SubagentConfig =
            serde_json::from_str(&json).map_err(|e| SubagentError::InvalidDefinition {
                path: path.clone(),
                detail: e.to_string(),
            })?;
        configs.push(config);
    }
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(configs)
}
