//! Per-model control-token profiles.
//!
//! Each model type has a profile directory containing `control_tokens.json`
//! describing its chat template: structural tokens, role tags, and named
//! capability tokens.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::FormatterError;

/// Tags wrapping one role's header in the rendered prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Name emitted between the tags (e.g. "assistant").
    pub role_name: String,
    pub role_start_tag: String,
    pub role_end_tag: String,
}

/// The canonical role set a profile advertises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleTags {
    #[serde(default)]
    pub system: Option<Role>,
    #[serde(default)]
    pub agent: Option<Role>,
    #[serde(default)]
    pub user: Option<Role>,
    #[serde(default)]
    pub tool: Option<Role>,
}

impl RoleTags {
    /// Look up a role by its normalized name, accepting common aliases.
    pub fn get(&self, role_name: &str) -> Option<&Role> {
        match role_name.to_lowercase().as_str() {
            "system" => self.system.as_ref(),
            "agent" | "assistant" => self.agent.as_ref(),
            "user" => self.user.as_ref(),
            "tool" | "ipython" => self.tool.as_ref(),
            _ => None,
        }
    }

    /// Canonical names of the roles this profile defines.
    pub fn available(&self) -> std::collections::HashSet<&'static str> {
        [
            self.system.as_ref().map(|_| "system"),
            self.agent.as_ref().map(|_| "agent"),
            self.user.as_ref().map(|_| "user"),
            self.tool.as_ref().map(|_| "tool"),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Parsed `control_tokens.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlTokens {
    pub template_type: String,
    pub begin_of_text: String,
    pub end_of_message: String,
    pub end_of_sequence: String,
    #[serde(default)]
    pub start_image_token: Option<String>,
    #[serde(default)]
    pub end_image_token: Option<String>,
    #[serde(default)]
    pub thinking_start_token: Option<String>,
    #[serde(default)]
    pub thinking_end_token: Option<String>,
    /// Placeholder for coordinate capabilities (object detection/pointing).
    #[serde(default)]
    pub coord_placeholder: Option<String>,
    /// Named capability tokens (capability name → token string).
    #[serde(default)]
    pub capabilities: HashMap<String, String>,
    pub roles: RoleTags,
}

impl ControlTokens {
    /// Load control tokens from a profile directory.
    pub fn load(profile_dir: &Path) -> Result<Self, FormatterError> {
        let path = profile_dir.join("control_tokens.json");
        if !path.exists() {
            return Err(FormatterError::TemplateNotFound(profile_dir.to_path_buf()));
        }

        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| FormatterError::InvalidConfig {
            path,
            reason: e.to_string(),
        })
    }
}
