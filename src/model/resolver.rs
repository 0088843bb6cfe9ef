//! Model identifier resolution.
//!
//! Maps user-supplied identifiers — local paths, HuggingFace repo ids, or
//! short aliases — to model directories already present on disk. Grove never
//! downloads weights; a repo id that is not in the local HF cache resolves
//! with `source == "hf_hub"` so the registry can report it as unsupported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::ModelError;

/// Short aliases for models whose repo id is unambiguous.
const ALIASES: &[(&str, &str)] = &[("moondream3", "moondream/moondream3-preview")];

/// Result of resolving a model identifier. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub canonical_id: String,
    pub model_path: PathBuf,
    /// Where the directory came from: `local`, `hf_cache`, or `hf_hub`
    /// (known repo shape, but not on disk).
    pub source: String,
    pub metadata: HashMap<String, String>,
    pub hf_repo: Option<String>,
}

impl ResolvedModel {
    /// Whether the model's files are available on this machine.
    pub fn is_on_disk(&self) -> bool {
        self.source == "local" || self.source == "hf_cache"
    }
}

/// Resolves model identifiers to on-disk model directories.
pub struct ModelResolver {
    resolved: HashMap<String, ResolvedModel>,
    hf_cache: hf_hub::Cache,
}

impl ModelResolver {
    pub fn new() -> Self {
        Self {
            resolved: HashMap::new(),
            hf_cache: hf_hub::Cache::default(),
        }
    }

    /// Use a specific HuggingFace cache directory (tests).
    pub fn with_hf_cache(cache_dir: PathBuf) -> Self {
        Self {
            resolved: HashMap::new(),
            hf_cache: hf_hub::Cache::new(cache_dir),
        }
    }

    /// Resolve an identifier to a model directory.
    ///
    /// Identifiers are tried as, in order: an absolute or `./`/`../`
    /// relative path, a known alias, a repo id in the local HF cache.
    /// Other relative-looking identifiers (e.g. `models/foo`) are treated
    /// as repo ids, never as paths.
    pub fn resolve(&mut self, requested_id: &str) -> Result<ResolvedModel, ModelError> {
        let identifier = requested_id.trim();
        if identifier.is_empty() {
            return Err(ModelError::EmptyIdentifier);
        }

        let cache_key = identifier.to_lowercase();
        if let Some(cached) = self.resolved.get(&cache_key) {
            return Ok(cached.clone());
        }

        let resolved = self.resolve_uncached(identifier)?;
        self.resolved.insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    /// Drop all cached resolutions.
    pub fn clear_cache(&mut self) {
        self.resolved.clear();
    }

    fn resolve_uncached(&self, identifier: &str) -> Result<ResolvedModel, ModelError> {
        if is_path_like(identifier) {
            let path = PathBuf::from(identifier);
            if !path.is_dir() {
                return Err(ModelError::NotFound(identifier.to_string()));
            }
            let path = std::fs::canonicalize(&path)?;
            return build_resolved(path, "local", None, None);
        }

        let repo_id = ALIASES
            .iter()
            .find(|(alias, _)| alias.eq_ignore_ascii_case(identifier))
            .map(|(_, repo)| *repo)
            .unwrap_or(identifier);
        let alias = (repo_id != identifier).then_some(identifier);

        if let Some(config_path) = self.hf_cache.model(repo_id.to_string()).get("config.json") {
            let model_dir = config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or(config_path);
            return build_resolved(model_dir, "hf_cache", alias, Some(repo_id));
        }

        // Repo-shaped but not cached: resolvable in name only.
        if repo_id.contains('/') {
            let folder = format!("models--{}", repo_id.replace('/', "--"));
            return Ok(ResolvedModel {
                canonical_id: alias.unwrap_or(repo_id).to_string(),
                model_path: self.hf_cache.path().join(folder),
                source: "hf_hub".to_string(),
                metadata: HashMap::new(),
                hf_repo: Some(repo_id.to_string()),
            });
        }

        Err(ModelError::NotFound(identifier.to_string()))
    }
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Only absolute paths and `./`/`../`-prefixed identifiers are paths.
fn is_path_like(identifier: &str) -> bool {
    Path::new(identifier).is_absolute()
        || identifier.starts_with("./")
        || identifier.starts_with("../")
}

fn build_resolved(
    model_path: PathBuf,
    source: &str,
    alias: Option<&str>,
    hf_repo: Option<&str>,
) -> Result<ResolvedModel, ModelError> {
    let config = load_config(&model_path)?;
    let metadata = collect_metadata(&config);

    let canonical_id = alias
        .map(String::from)
        .or_else(|| config_canonical_id(&config))
        .unwrap_or_else(|| {
            model_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        });

    let hf_repo = hf_repo.map(String::from).or_else(|| infer_hf_repo(&config));

    Ok(ResolvedModel {
        canonical_id,
        model_path,
        source: source.to_string(),
        metadata,
        hf_repo,
    })
}

fn load_config(model_dir: &Path) -> Result<serde_json::Value, ModelError> {
    let config_file = model_dir.join("config.json");
    if !config_file.exists() {
        return Err(ModelError::MissingConfig(model_dir.to_path_buf()));
    }

    let content = std::fs::read_to_string(&config_file)?;
    serde_json::from_str(&content).map_err(|e| ModelError::LoadFailed {
        id: model_dir.to_string_lossy().to_string(),
        reason: format!("invalid config.json: {}", e),
    })
}

fn config_canonical_id(config: &serde_json::Value) -> Option<String> {
    config
        .get("_name_or_path")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .or_else(|| {
            config
                .get("model_id")
                .and_then(|v| v.as_str())
                .map(String::from)
        })
}

fn infer_hf_repo(config: &serde_json::Value) -> Option<String> {
    config
        .get("_name_or_path")
        .or_else(|| config.get("original_repo"))
        .and_then(|v| v.as_str())
        .filter(|s| s.contains('/') && !s.starts_with('/'))
        .map(String::from)
}

fn collect_metadata(config: &serde_json::Value) -> HashMap<String, String> {
    let mut metadata = HashMap::new();

    for key in ["model_type", "hidden_size", "num_hidden_layers", "architecture"] {
        let Some(value) = config.get(key) else { continue };
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => continue,
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        metadata.insert(key.to_string(), rendered);
    }

    if let Some(bits) = config
        .get("quantization_config")
        .or_else(|| config.get("quantization"))
        .and_then(|q| q.get("bits").or_else(|| q.get("num_bits")))
        .and_then(|v| v.as_u64())
    {
        metadata.insert("quantization_bits".to_string(), bits.to_string());
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_model_dir(dir: &Path, config: serde_json::Value) {
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let mut resolver = ModelResolver::new();
        assert!(matches!(
            resolver.resolve("   "),
            Err(ModelError::EmptyIdentifier)
        ));
    }

    #[test]
    fn absolute_path_resolves_as_local() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path(), serde_json::json!({"model_type": "llama"}));

        let mut resolver = ModelResolver::new();
        let resolved = resolver.resolve(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(resolved.source, "local");
        assert!(resolved.is_on_disk());
        assert_eq!(
            resolved.metadata.get("model_type"),
            Some(&"llama".to_string())
        );
    }

    #[test]
    fn bare_relative_identifiers_are_not_paths() {
        // Even if "models/foo" exists on disk, it is treated as a repo id.
        assert!(!is_path_like("models/foo"));
        assert!(is_path_like("./models/foo"));
        assert!(is_path_like("../models/foo"));
        assert!(is_path_like("/models/foo"));
    }

    #[test]
    fn path_without_config_is_missing_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut resolver = ModelResolver::new();
        let result = resolver.resolve(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(ModelError::MissingConfig(_))));
    }

    #[test]
    fn uncached_repo_id_resolves_off_disk() {
        let cache = tempfile::tempdir().unwrap();
        let mut resolver = ModelResolver::with_hf_cache(cache.path().to_path_buf());
        let resolved = resolver.resolve("meta-llama/Llama-3.1-8B-Instruct").unwrap();
        assert_eq!(resolved.source, "hf_hub");
        assert!(!resolved.is_on_disk());
        assert_eq!(
            resolved.hf_repo.as_deref(),
            Some("meta-llama/Llama-3.1-8B-Instruct")
        );
    }

    #[test]
    fn alias_maps_to_repo_id() {
        let cache = tempfile::tempdir().unwrap();
        let mut resolver = ModelResolver::with_hf_cache(cache.path().to_path_buf());
        let resolved = resolver.resolve("moondream3").unwrap();
        assert_eq!(resolved.canonical_id, "moondream3");
        assert_eq!(
            resolved.hf_repo.as_deref(),
            Some("moondream/moondream3-preview")
        );
    }

    #[test]
    fn unknown_plain_identifier_is_not_found() {
        let cache = tempfile::tempdir().unwrap();
        let mut resolver = ModelResolver::with_hf_cache(cache.path().to_path_buf());
        assert!(matches!(
            resolver.resolve("definitely-not-a-model"),
            Err(ModelError::NotFound(_))
        ));
    }

    #[test]
    fn canonical_id_prefers_name_or_path() {
        let config = serde_json::json!({"_name_or_path": "org/some-model"});
        assert_eq!(config_canonical_id(&config), Some("org/some-model".into()));
        assert_eq!(infer_hf_repo(&config), Some("org/some-model".into()));

        let local = serde_json::json!({"_name_or_path": "/local/path"});
        assert_eq!(infer_hf_repo(&local), None);
    }

    #[test]
    fn resolution_is_cached_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        write_model_dir(dir.path(), serde_json::json!({"model_type": "llama"}));

        let mut resolver = ModelResolver::new();
        let path = dir.path().to_str().unwrap();
        resolver.resolve(path).unwrap();
        assert_eq!(resolver.resolved.len(), 1);

        resolver.resolve(&path.to_uppercase()).ok();
        resolver.resolve(path).unwrap();
        assert!(resolver.resolved.len() <= 2);
    }

    #[test]
    fn metadata_includes_quantization() {
        let config = serde_json::json!({
            "model_type": "llama",
            "hidden_size": 4096,
            "quantization_config": {"bits": 4}
        });
        let metadata = collect_metadata(&config);
        assert_eq!(metadata.get("hidden_size"), Some(&"4096".to_string()));
        assert_eq!(metadata.get("quantization_bits"), Some(&"4".to_string()));
    }
}
