//! Chat formatting: per-model profiles and conversation rendering.
//!
//! A model's `config.json` selects a profile directory; the profile's
//! control tokens drive the rendering of a conversation into prompt text.

pub mod control_tokens;
pub mod multimodal;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use control_tokens::{ControlTokens, Role, RoleTags};

use multimodal::{ContentPart, Interaction};

/// Placeholder used for image positions when the profile defines no image
/// token of its own. Stripped from the outgoing prompt after layout.
pub const DEFAULT_IMAGE_PLACEHOLDER: &str = "<|image|>";

/// Formatter errors.
#[derive(Error, Debug)]
pub enum FormatterError {
    #[error("config.json not found under {0}")]
    ConfigNotFound(PathBuf),

    #[error("invalid config {path}: {reason}")]
    InvalidConfig { path: PathBuf, reason: String },

    #[error("no formatter profile for model type '{0}'")]
    ProfileNotFound(String),

    #[error("control_tokens.json not found in profile {0}")]
    TemplateNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Map a config `model_type` onto a profile directory name.
fn profile_name(config: &serde_json::Value) -> &str {
    let model_type = config
        .get("model_type")
        .and_then(|v| v.as_str())
        .unwrap_or("llama");

    match model_type {
        "llama" | "llama3" => "llama3",
        "moondream" | "moondream3" => "moondream3",
        "gemma" | "gemma3" => "gemma3",
        "qwen" | "qwen2" => "qwen2",
        other => other,
    }
}

/// Renders conversations into prompt text using a model's control tokens.
#[derive(Debug, Clone)]
pub struct ChatFormatter {
    model_path: String,
    model_type: String,
    pub control_tokens: ControlTokens,
}

impl ChatFormatter {
    /// Build a formatter from a model directory's `config.json`.
    pub fn new(model_path: &Path) -> Result<Self, FormatterError> {
        let config_path = model_path.join("config.json");
        if !config_path.exists() {
            return Err(FormatterError::ConfigNotFound(model_path.to_path_buf()));
        }

        let config: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
            &config_path,
        )?)
        .map_err(|e| FormatterError::InvalidConfig {
            path: config_path,
            reason: e.to_string(),
        })?;

        let model_type = profile_name(&config).to_string();
        let profile_dir = find_profile_dir(&model_type)?;
        let control_tokens = ControlTokens::load(&profile_dir)?;

        Ok(Self {
            model_path: model_path.to_string_lossy().to_string(),
            model_type,
            control_tokens,
        })
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// Token that marks image positions in the rendered prompt.
    pub fn image_placeholder_token(&self) -> &str {
        self.control_tokens
            .start_image_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .unwrap_or(DEFAULT_IMAGE_PLACEHOLDER)
    }

    /// Whether image placeholder bytes are excluded from the prompt text.
    ///
    /// True exactly when the profile has no real start-image token and the
    /// default sentinel stands in for layout positions only.
    pub fn exclude_image_placeholder(&self) -> bool {
        self.control_tokens
            .start_image_token
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true)
    }

    /// Render a conversation to prompt text.
    ///
    /// `begin_of_text`, then per interaction the role header, the textual
    /// representation of each part, and the end-of-sequence token. Roles the
    /// profile does not define are skipped. With `add_generation_prompt`,
    /// the agent header is appended so the model continues as the agent.
    pub fn render_conversation(
        &self,
        interactions: &[Interaction],
        add_generation_prompt: bool,
        reasoning: bool,
    ) -> String {
        let tokens = &self.control_tokens;
        let mut output = tokens.begin_of_text.clone();

        for interaction in interactions {
            let Some(role) = tokens.roles.get(&interaction.role) else {
                log::debug!(
                    "skipping interaction with role '{}' not in '{}' profile",
                    interaction.role,
                    self.model_type
                );
                continue;
            };

            output.push_str(&role.role_start_tag);
            output.push_str(&role.role_name);
            output.push_str(&role.role_end_tag);

            for part in &interaction.parts {
                match part {
                    ContentPart::Text(text) => output.push_str(text),
                    ContentPart::Image => output.push_str(self.image_placeholder_token()),
                    // Capabilities occupy no prompt text; the layout carries them.
                    ContentPart::Capability => {}
                }
            }

            output.push_str(&tokens.end_of_sequence);
        }

        if add_generation_prompt {
            if let Some(agent) = &tokens.roles.agent {
                output.push_str(&agent.role_start_tag);
                output.push_str(&agent.role_name);
                output.push_str(&agent.role_end_tag);
                if reasoning {
                    if let Some(thinking) = &tokens.thinking_start_token {
                        output.push_str(thinking);
                    }
                }
            }
        }

        output
    }

    /// Strip placeholders that must not reach the engine as prompt bytes:
    /// the default image sentinel (when excluded) and coord placeholders.
    pub fn strip_placeholders(&self, prompt: &str) -> String {
        let mut stripped = prompt.to_string();
        if self.exclude_image_placeholder() {
            stripped = stripped.replace(DEFAULT_IMAGE_PLACEHOLDER, "");
        }
        if let Some(coord) = &self.control_tokens.coord_placeholder {
            if !coord.is_empty() {
                stripped = stripped.replace(coord.as_str(), "");
            }
        }
        stripped
    }
}

/// Locate the profile directory for a model type.
///
/// Checked in order: the crate's own `profiles/` directory, then
/// `profiles/` under the current working directory.
fn find_profile_dir(model_type: &str) -> Result<PathBuf, FormatterError> {
    let candidates = [
        Some(
            PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .join("profiles")
                .join(model_type),
        ),
        std::env::current_dir()
            .ok()
            .map(|p| p.join("profiles").join(model_type)),
    ];

    for candidate in candidates.into_iter().flatten() {
        if candidate.is_dir() {
            return Ok(candidate);
        }
    }

    Err(FormatterError::ProfileNotFound(model_type.to_string()))
}
