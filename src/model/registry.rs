//! Model registry and load state machine.
//!
//! Tracks each model's lifecycle and coordinates the asynchronous
//! `load_model` handshake with the engine: the management reply may confirm
//! synchronously (`ok`) or defer (`accepted`), in which case the receive
//! loop completes activation when the `model_loaded` event arrives.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};

use crate::formatter::ChatFormatter;
use crate::ipc::state::{IpcState, MANAGEMENT_TIMEOUT};
use crate::model::resolver::{ModelResolver, ResolvedModel};
use crate::model::ModelError;

/// Per-model load states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelLoadState {
    /// Not yet requested.
    Idle,
    /// Reserved: weight download is unsupported in this library.
    Downloading,
    /// Formatter built from local files; engine not yet asked.
    Loading,
    /// `load_model` sent; awaiting engine confirmation.
    Activating,
    /// Serving inference requests.
    Ready,
    Failed,
}

impl std::fmt::Display for ModelLoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Downloading => "DOWNLOADING",
            Self::Loading => "LOADING",
            Self::Activating => "ACTIVATING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Shared description of a loaded model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_path: String,
    pub formatter: Arc<ChatFormatter>,
    pub capabilities: Option<HashMap<String, Vec<i32>>>,
}

/// Registry entry for one canonical model id.
pub struct ModelEntry {
    pub state: ModelLoadState,
    pub info: Option<ModelInfo>,
    pub error: Option<String>,
    pub resolved: Option<ResolvedModel>,
    /// Wakes coalesced waiters on every state change.
    pub notify: Arc<Notify>,
    /// Single-slot activation waiter; present only while ACTIVATING.
    activation_tx: Option<oneshot::Sender<Result<(), String>>>,
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self {
            state: ModelLoadState::Idle,
            info: None,
            error: None,
            resolved: None,
            notify: Arc::new(Notify::new()),
            activation_tx: None,
        }
    }
}

enum ActivationClaim {
    /// This caller owns the activation and must send `load_model`.
    Claimed(ModelInfo, oneshot::Receiver<Result<(), String>>),
    /// Another caller is activating; wait on the entry's notify.
    Join(Arc<Notify>),
}

/// Registry of models known to this process.
pub struct ModelRegistry {
    entries: RwLock<HashMap<String, ModelEntry>>,
    /// Lowercase requested id → canonical id.
    aliases: RwLock<HashMap<String, String>>,
    resolver: Mutex<ModelResolver>,
    /// Set once the process-wide context connects. The receive loop reaches
    /// the registry through a weak reference, so this is the only strong
    /// edge between the two.
    ipc: RwLock<Option<Arc<IpcState>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::with_resolver(ModelResolver::new())
    }

    pub fn with_resolver(resolver: ModelResolver) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            resolver: Mutex::new(resolver),
            ipc: RwLock::new(None),
        }
    }

    /// Attach the IPC state used for management commands.
    pub async fn attach_ipc(&self, ipc: Arc<IpcState>) {
        *self.ipc.write().await = Some(ipc);
    }

    /// Schedule a model: resolve it, record aliases, and build the formatter.
    ///
    /// Returns the (possibly pre-existing) state and the canonical id. The
    /// entry only advances past LOADING through `ensure_loaded`.
    pub async fn schedule_model(
        &self,
        requested_id: &str,
        force_reload: bool,
    ) -> Result<(ModelLoadState, String), ModelError> {
        let resolved = {
            let mut resolver = self.resolver.lock().await;
            resolver.resolve(requested_id)?
        };
        let canonical_id = resolved.canonical_id.clone();

        {
            let mut aliases = self.aliases.write().await;
            aliases.insert(requested_id.to_lowercase(), canonical_id.clone());
            aliases
                .entry(canonical_id.to_lowercase())
                .or_insert_with(|| canonical_id.clone());
        }

        let mut entries = self.entries.write().await;
        let entry = entries.entry(canonical_id.clone()).or_default();

        if entry.state == ModelLoadState::Ready && !force_reload {
            return Ok((ModelLoadState::Ready, canonical_id));
        }
        if matches!(
            entry.state,
            ModelLoadState::Loading | ModelLoadState::Downloading | ModelLoadState::Activating
        ) && !force_reload
        {
            return Ok((entry.state, canonical_id));
        }

        entry.error = None;
        entry.info = None;
        entry.activation_tx = None;
        entry.notify = Arc::new(Notify::new());
        entry.resolved = Some(resolved.clone());

        if resolved.is_on_disk() {
            match ChatFormatter::new(&resolved.model_path) {
                Ok(formatter) => {
                    entry.info = Some(ModelInfo {
                        model_id: canonical_id.clone(),
                        model_path: resolved.model_path.to_string_lossy().to_string(),
                        formatter: Arc::new(formatter),
                        capabilities: None,
                    });
                    entry.state = ModelLoadState::Loading;
                }
                Err(e) => {
                    entry.error = Some(e.to_string());
                    entry.state = ModelLoadState::Failed;
                }
            }
        } else {
            entry.error = Some(format!(
                "model '{}' is not on disk and downloads are unsupported",
                canonical_id
            ));
            entry.state = ModelLoadState::Failed;
        }

        let state = entry.state;
        entry.notify.notify_waiters();
        Ok((state, canonical_id))
    }

    /// Ensure a model is READY, sending `load_model` to the engine if needed.
    ///
    /// Concurrent calls for the same id coalesce: one caller owns the
    /// activation, the rest await the same completion.
    pub async fn ensure_loaded(&self, requested_id: &str) -> Result<ModelInfo, ModelError> {
        let (state, canonical_id) = self.schedule_model(requested_id, false).await?;

        match state {
            ModelLoadState::Ready => {
                if let Some(info) = self.get_if_ready(&canonical_id).await {
                    return Ok(info);
                }
            }
            ModelLoadState::Failed => return Err(self.failure_of(&canonical_id).await),
            _ => {}
        }

        let claim = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&canonical_id)
                .ok_or_else(|| ModelError::NotFound(canonical_id.clone()))?;

            match entry.state {
                ModelLoadState::Ready => {
                    return entry
                        .info
                        .clone()
                        .ok_or_else(|| ModelError::ActivationFailed(canonical_id.clone()))
                }
                ModelLoadState::Failed => {
                    drop(entries);
                    return Err(self.failure_of(&canonical_id).await);
                }
                ModelLoadState::Activating => ActivationClaim::Join(entry.notify.clone()),
                ModelLoadState::Loading => {
                    let info = entry.info.clone().ok_or_else(|| ModelError::LoadFailed {
                        id: canonical_id.clone(),
                        reason: "entry is LOADING without model info".to_string(),
                    })?;
                    let (tx, rx) = oneshot::channel();
                    entry.state = ModelLoadState::Activating;
                    entry.activation_tx = Some(tx);
                    ActivationClaim::Claimed(info, rx)
                }
                other => {
                    return Err(ModelError::LoadFailed {
                        id: canonical_id.clone(),
                        reason: format!("unexpected state {}", other),
                    })
                }
            }
        };

        match claim {
            ActivationClaim::Claimed(info, rx) => {
                let completed_inline = self
                    .send_load_model(requested_id, &canonical_id, &info)
                    .await?;
                if completed_inline {
                    return self
                        .get_if_ready(&canonical_id)
                        .await
                        .ok_or_else(|| ModelError::ActivationFailed(canonical_id.clone()));
                }

                // Deferred: the receive loop resolves the waiter when the
                // engine broadcasts model_loaded.
                match rx.await {
                    Ok(Ok(())) => self
                        .get_if_ready(&canonical_id)
                        .await
                        .ok_or_else(|| ModelError::ActivationFailed(canonical_id.clone())),
                    Ok(Err(reason)) => Err(ModelError::LoadFailed {
                        id: canonical_id.clone(),
                        reason,
                    }),
                    Err(_) => Err(ModelError::ActivationFailed(canonical_id.clone())),
                }
            }
            ActivationClaim::Join(notify) => loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let entries = self.entries.read().await;
                    if let Some(entry) = entries.get(&canonical_id) {
                        match entry.state {
                            ModelLoadState::Ready => {
                                return entry.info.clone().ok_or_else(|| {
                                    ModelError::ActivationFailed(canonical_id.clone())
                                })
                            }
                            ModelLoadState::Failed => {
                                drop(entries);
                                return Err(self.failure_of(&canonical_id).await);
                            }
                            _ => {}
                        }
                    }
                }

                notified.await;
            },
        }
    }

    /// Re-resolve and reload a model even if it is READY.
    pub async fn force_reload(&self, requested_id: &str) -> Result<ModelInfo, ModelError> {
        {
            let mut resolver = self.resolver.lock().await;
            resolver.clear_cache();
        }
        self.schedule_model(requested_id, true).await?;
        self.ensure_loaded(requested_id).await
    }

    /// Send the `load_model` management command for a claimed activation.
    ///
    /// Returns true when the reply completed activation inline (`ok`).
    async fn send_load_model(
        &self,
        requested_id: &str,
        canonical_id: &str,
        info: &ModelInfo,
    ) -> Result<bool, ModelError> {
        let ipc = { self.ipc.read().await.clone() };
        let Some(ipc) = ipc else {
            self.fail_activation(canonical_id, "IPC state is not connected")
                .await;
            return Err(ModelError::ActivationFailed(canonical_id.to_string()));
        };

        let command = json!({
            "type": "load_model",
            "requested_id": requested_id,
            "canonical_id": canonical_id,
            "model_path": info.model_path,
            "wait_for_completion": false,
        });

        let reply = match ipc.management_command_async(command, MANAGEMENT_TIMEOUT).await {
            Ok(reply) => reply,
            Err(e) => {
                let reason = format!("load_model command failed: {}", e);
                self.fail_activation(canonical_id, &reason).await;
                return Err(ModelError::ActivationFailed(canonical_id.to_string()));
            }
        };

        match reply.get("status").and_then(Value::as_str).unwrap_or("") {
            "ok" => {
                let capabilities = capabilities_from_reply(&reply);
                self.complete_activation(canonical_id, capabilities).await;
                Ok(true)
            }
            "accepted" => {
                log::debug!(
                    "model '{}' accepted by engine; awaiting model_loaded event",
                    canonical_id
                );
                Ok(false)
            }
            _ => {
                let reason = reply
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                self.fail_activation(canonical_id, &reason).await;
                Err(ModelError::LoadRejected {
                    id: requested_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Transition ACTIVATING → READY and wake all waiters.
    ///
    /// Capability data is merged regardless; the state transition only
    /// happens from ACTIVATING, so a stray event cannot resurrect a failed
    /// or reloaded entry.
    async fn complete_activation(
        &self,
        canonical_id: &str,
        capabilities: Option<HashMap<String, Vec<i32>>>,
    ) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(canonical_id) else {
            return;
        };

        if let (Some(info), Some(caps)) = (entry.info.as_mut(), capabilities) {
            info.capabilities = Some(caps);
        }

        if entry.state == ModelLoadState::Activating {
            entry.state = ModelLoadState::Ready;
            if let Some(tx) = entry.activation_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        entry.notify.notify_waiters();
    }

    async fn fail_activation(&self, canonical_id: &str, reason: &str) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(canonical_id) else {
            return;
        };

        entry.state = ModelLoadState::Failed;
        entry.error = Some(reason.to_string());
        if let Some(tx) = entry.activation_tx.take() {
            let _ = tx.send(Err(reason.to_string()));
        }
        entry.notify.notify_waiters();
    }

    /// Handle a `model_loaded` broadcast from the engine.
    pub async fn handle_model_loaded(&self, payload: &Value) {
        let Some(model_id) = payload.get("model_id").and_then(Value::as_str) else {
            log::warn!("model_loaded event without model_id");
            return;
        };

        let canonical_id = match self.canonicalize(model_id).await {
            Some(id) => id,
            None => {
                log::debug!("model_loaded for unscheduled model '{}'", model_id);
                model_id.to_string()
            }
        };

        let capabilities = payload
            .get("capabilities")
            .and_then(parse_capabilities)
            .filter(|caps| !caps.is_empty());

        self.complete_activation(&canonical_id, capabilities).await;
    }

    /// Merge engine-reported capabilities into a model's info.
    pub async fn update_capabilities(
        &self,
        model_id: &str,
        capabilities: HashMap<String, Vec<i32>>,
    ) {
        let Some(canonical_id) = self.canonicalize(model_id).await else {
            log::warn!("capabilities for unknown model '{}'", model_id);
            return;
        };

        let mut entries = self.entries.write().await;
        if let Some(info) = entries
            .get_mut(&canonical_id)
            .and_then(|entry| entry.info.as_mut())
        {
            info.capabilities = Some(capabilities);
        }
    }

    /// Model info, but only while READY.
    pub async fn get_if_ready(&self, model_id: &str) -> Option<ModelInfo> {
        let canonical_id = self.canonicalize(model_id).await?;
        let entries = self.entries.read().await;
        let entry = entries.get(&canonical_id)?;
        if entry.state == ModelLoadState::Ready {
            entry.info.clone()
        } else {
            None
        }
    }

    /// Current state and error for a model; IDLE when unknown.
    pub async fn status(&self, model_id: &str) -> (ModelLoadState, Option<String>) {
        let Some(canonical_id) = self.canonicalize(model_id).await else {
            return (ModelLoadState::Idle, None);
        };
        let entries = self.entries.read().await;
        match entries.get(&canonical_id) {
            Some(entry) => (entry.state, entry.error.clone()),
            None => (ModelLoadState::Idle, None),
        }
    }

    /// List scheduled models with their resolution metadata.
    pub async fn list_models(&self) -> Vec<HashMap<String, String>> {
        let entries = self.entries.read().await;
        let mut listing = Vec::new();

        for (canonical_id, entry) in entries.iter() {
            let Some(resolved) = &entry.resolved else {
                continue;
            };
            let mut record = resolved.metadata.clone();
            record.insert("canonical_id".to_string(), canonical_id.clone());
            record.insert(
                "model_path".to_string(),
                resolved.model_path.to_string_lossy().to_string(),
            );
            record.insert("source".to_string(), resolved.source.clone());
            record.insert("state".to_string(), entry.state.to_string());
            if let Some(repo) = &resolved.hf_repo {
                record.insert("hf_repo".to_string(), repo.clone());
            }
            listing.push(record);
        }

        listing
    }

    async fn canonicalize(&self, model_id: &str) -> Option<String> {
        {
            let entries = self.entries.read().await;
            if entries.contains_key(model_id) {
                return Some(model_id.to_string());
            }
        }
        self.aliases.read().await.get(&model_id.to_lowercase()).cloned()
    }

    async fn failure_of(&self, canonical_id: &str) -> ModelError {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(canonical_id) else {
            return ModelError::NotFound(canonical_id.to_string());
        };

        if entry
            .resolved
            .as_ref()
            .map(|r| !r.is_on_disk())
            .unwrap_or(false)
        {
            return ModelError::DownloadUnsupported(canonical_id.to_string());
        }

        ModelError::LoadFailed {
            id: canonical_id.to_string(),
            reason: entry
                .error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn capabilities_from_reply(reply: &Value) -> Option<HashMap<String, Vec<i32>>> {
    reply
        .get("data")
        .and_then(|d| d.get("load_model"))
        .and_then(|lm| lm.get("capabilities"))
        .and_then(parse_capabilities)
}

/// Parse a capability map: values may be token-id arrays or single ids.
fn parse_capabilities(value: &Value) -> Option<HashMap<String, Vec<i32>>> {
    let map = value.as_object()?;
    Some(
        map.iter()
            .filter_map(|(name, v)| {
                let ids: Vec<i32> = if let Some(array) = v.as_array() {
                    array
                        .iter()
                        .filter_map(|x| x.as_i64().map(|n| n as i32))
                        .collect()
                } else if let Some(n) = v.as_i64() {
                    vec![n as i32]
                } else {
                    return None;
                };
                Some((name.clone(), ids))
            })
            .collect(),
    )
}
