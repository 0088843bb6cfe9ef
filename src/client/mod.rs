//! High-level client facade: `chat`, `chat_stream`, and `chat_batch`.

mod response;
pub mod vision;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::context::EngineContext;
use crate::defaults;
use crate::engine::lease::EngineLease;
use crate::error::{Error, Result};
use crate::formatter::multimodal::{build_conversation, build_layout, MultimodalError};
use crate::ipc::state::{ClientDelta, IpcState, MANAGEMENT_TIMEOUT};
use crate::ipc::wire::{PromptPayload, RequestType};
use crate::model::registry::{ModelInfo, ModelRegistry};

pub use response::{ClientResponse, UsageStats};
pub use vision::{BoundingBox, PointCoord, VisionClient};

/// Runtime backing the blocking wrappers when no runtime is running.
static SYNC_RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

fn sync_runtime() -> &'static tokio::runtime::Runtime {
    SYNC_RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build sync runtime")
    })
}

/// Caller-visible generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatParams {
    pub max_generated_tokens: i32,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: i32,
    pub min_p: f64,
    /// Random when unset; fixed for reproducible sampling.
    pub rng_seed: Option<u64>,
    pub stop: Vec<String>,
    pub top_logprobs: i32,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub repetition_context_size: i32,
    pub repetition_penalty: f64,
    pub logit_bias: HashMap<i32, f64>,
    pub tools: Vec<Value>,
    pub response_format: Option<Value>,
    /// Candidates sampled per prompt.
    pub n: i32,
    /// Candidates explored; defaults to `n`.
    pub best_of: Option<i32>,
    /// Candidates returned; defaults to `best_of`.
    pub final_candidates: Option<i32>,
    pub task_name: Option<String>,
    pub reasoning: bool,
    pub reasoning_effort: Option<String>,
    /// Prepended to the conversation as a system interaction.
    pub instructions: Option<String>,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            max_generated_tokens: defaults::MAX_GENERATED_TOKENS,
            temperature: defaults::TEMPERATURE,
            top_p: defaults::TOP_P,
            top_k: defaults::TOP_K,
            min_p: defaults::MIN_P,
            rng_seed: None,
            stop: Vec::new(),
            top_logprobs: defaults::TOP_LOGPROBS,
            frequency_penalty: defaults::FREQUENCY_PENALTY,
            presence_penalty: defaults::PRESENCE_PENALTY,
            repetition_context_size: defaults::REPETITION_CONTEXT_SIZE,
            repetition_penalty: defaults::REPETITION_PENALTY,
            logit_bias: HashMap::new(),
            tools: Vec::new(),
            response_format: None,
            n: defaults::NUM_CANDIDATES,
            best_of: None,
            final_candidates: None,
            task_name: None,
            reasoning: false,
            reasoning_effort: None,
            instructions: None,
        }
    }
}

/// A raw chat message: `role` plus `content` (text or typed parts).
pub type ChatMessage = HashMap<String, Value>;

/// Convenience constructor for a plain text message.
pub fn text_message(role: &str, content: &str) -> ChatMessage {
    HashMap::from([
        ("role".to_string(), json!(role)),
        ("content".to_string(), json!(content)),
    ])
}

/// Streaming handle returned by [`Client::chat_stream`].
///
/// Yields deltas in arrival order and ends once every expected final delta
/// has been seen. Dropping the stream unregisters the request; the engine
/// finishes it on its own schedule.
pub struct ChatStream {
    rx: mpsc::UnboundedReceiver<ClientDelta>,
    remaining_finals: usize,
}

impl ChatStream {
    /// Next delta, or `None` once the response is complete.
    pub async fn next(&mut self) -> Option<ClientDelta> {
        if self.remaining_finals == 0 {
            return None;
        }
        let delta = self.rx.recv().await?;
        if delta.is_final {
            self.remaining_finals -= 1;
        }
        Some(delta)
    }

    /// Drain the remaining deltas into an aggregated response.
    pub async fn collect(mut self) -> ClientResponse {
        let mut deltas = Vec::new();
        while let Some(delta) = self.next().await {
            deltas.push(delta);
        }
        ClientResponse::from_deltas(deltas)
    }
}

/// High-level client for the shared engine.
pub struct Client {
    ipc: Arc<IpcState>,
    registry: Arc<ModelRegistry>,
}

impl Client {
    /// Build a client over an acquired lease's context.
    pub fn new(lease: &EngineLease) -> Result<Self> {
        Ok(Self::from_context(&lease.context()?))
    }

    /// Build a client over the live process-wide context.
    ///
    /// Fails with [`Error::NotInitialized`] until some lease in this
    /// process has been acquired.
    pub fn connect() -> Result<Self> {
        let context = crate::context::current_context().ok_or(Error::NotInitialized)?;
        Ok(Self::from_context(&context))
    }

    /// Build a client over an explicit context.
    pub fn from_context(context: &Arc<EngineContext>) -> Self {
        Self {
            ipc: Arc::clone(context.ipc()),
            registry: Arc::clone(context.registry()),
        }
    }

    /// One conversation in, one aggregated response out.
    pub async fn chat(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: ChatParams,
    ) -> Result<ClientResponse> {
        self.task_request(model_id, messages, params, RequestType::Generation)
            .await
    }

    /// One conversation in, a lazy stream of deltas out.
    pub async fn chat_stream(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: ChatParams,
    ) -> Result<ChatStream> {
        let (info, payload) = self.prepare(model_id, &messages, &params).await?;
        let remaining_finals = payload.final_candidate_count();

        let request_id = self.ipc.next_request_id();
        let rx = self.ipc.send_request(
            request_id,
            &info.model_id,
            &info.model_path,
            RequestType::Generation,
            &[payload],
        )?;

        Ok(ChatStream {
            rx,
            remaining_finals,
        })
    }

    /// N conversations in one request frame; N aggregated responses out,
    /// grouped by `prompt_index` and returned in submission order.
    pub async fn chat_batch(
        &self,
        model_id: &str,
        conversations: Vec<Vec<ChatMessage>>,
        params: ChatParams,
    ) -> Result<Vec<ClientResponse>> {
        if conversations.is_empty() {
            return Ok(Vec::new());
        }

        let info = self.ensure_model(model_id).await?;

        let mut payloads = Vec::with_capacity(conversations.len());
        for messages in &conversations {
            payloads.push(build_prompt_payload(&info, messages, &params)?);
        }

        let expected_finals: usize = payloads
            .iter()
            .map(PromptPayload::final_candidate_count)
            .sum();

        let request_id = self.ipc.next_request_id();
        let mut rx = self.ipc.send_request(
            request_id,
            &info.model_id,
            &info.model_path,
            RequestType::Generation,
            &payloads,
        )?;

        let mut by_prompt: HashMap<u32, Vec<ClientDelta>> = HashMap::new();
        let mut finals = 0usize;
        while finals < expected_finals {
            let Some(delta) = rx.recv().await else {
                break;
            };
            if delta.is_final {
                finals += 1;
            }
            by_prompt
                .entry(delta.prompt_index.unwrap_or(0))
                .or_default()
                .push(delta);
        }

        let responses = (0..conversations.len())
            .map(|idx| {
                ClientResponse::from_deltas(by_prompt.remove(&(idx as u32)).unwrap_or_default())
            })
            .collect();
        Ok(responses)
    }

    /// Blocking wrapper over [`Client::chat`]; usable from sync code and
    /// from within a runtime.
    pub fn chat_blocking(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: ChatParams,
    ) -> Result<ClientResponse> {
        let future = self.chat(model_id, messages, params);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => tokio::task::block_in_place(|| handle.block_on(future)),
            Err(_) => sync_runtime().block_on(future),
        }
    }

    /// Ask the engine which models it has loaded (`list_models`).
    pub async fn list_engine_models(&self) -> Result<Value> {
        let reply = self
            .ipc
            .management_command_async(json!({"type": "list_models"}), MANAGEMENT_TIMEOUT)
            .await?;
        Ok(reply
            .get("data")
            .and_then(|d| d.get("list_models"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Shared request path for generation and vision task types.
    pub(crate) async fn task_request(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: ChatParams,
        request_type: RequestType,
    ) -> Result<ClientResponse> {
        let (info, payload) = self.prepare(model_id, &messages, &params).await?;
        let expected_finals = payload.final_candidate_count();

        let request_id = self.ipc.next_request_id();
        let mut rx = self.ipc.send_request(
            request_id,
            &info.model_id,
            &info.model_path,
            request_type,
            &[payload],
        )?;

        let mut deltas = Vec::new();
        let mut finals = 0usize;
        while finals < expected_finals {
            let Some(delta) = rx.recv().await else {
                break;
            };
            if delta.is_final {
                finals += 1;
            }
            deltas.push(delta);
        }

        Ok(ClientResponse::from_deltas(deltas))
    }

    async fn prepare(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<(ModelInfo, PromptPayload)> {
        let info = self.ensure_model(model_id).await?;
        let payload = build_prompt_payload(&info, messages, params)?;
        Ok((info, payload))
    }

    async fn ensure_model(&self, model_id: &str) -> Result<ModelInfo> {
        if model_id.trim().is_empty() {
            return Err(Error::NoModelSpecified);
        }
        Ok(self.registry.ensure_loaded(model_id).await?)
    }
}

/// Render one conversation into a serializable prompt payload.
fn build_prompt_payload(
    info: &ModelInfo,
    messages: &[ChatMessage],
    params: &ChatParams,
) -> Result<PromptPayload> {
    let formatter = &info.formatter;

    let conversation = build_conversation(formatter, messages, params.instructions.as_deref())?;
    if conversation.interactions.is_empty() {
        return Err(MultimodalError::EmptyPrompt.into());
    }

    let reasoning = params.reasoning || params.reasoning_effort.is_some();
    let prompt_text = formatter.render_conversation(&conversation.interactions, true, reasoning);

    let layout = build_layout(
        &prompt_text,
        &conversation.images,
        &conversation.capabilities,
        &conversation.content_order,
        formatter.image_placeholder_token(),
        formatter.exclude_image_placeholder(),
        formatter.control_tokens.coord_placeholder.as_deref(),
    )?;

    let text = formatter.strip_placeholders(&prompt_text);

    let tool_schemas_json = if params.tools.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&params.tools)?
    };
    let response_format_json = match &params.response_format {
        Some(format) => serde_json::to_string(format)?,
        None => String::new(),
    };

    let rng_seed = params
        .rng_seed
        .unwrap_or_else(|| rand::thread_rng().gen());

    Ok(PromptPayload {
        text,
        images: conversation.images,
        capabilities: conversation.capabilities,
        layout,
        max_generated_tokens: params.max_generated_tokens,
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        min_p: params.min_p,
        rng_seed,
        stop_sequences: params.stop.clone(),
        num_candidates: params.n,
        best_of: params.best_of,
        final_candidates: params.final_candidates,
        top_logprobs: params.top_logprobs,
        frequency_penalty: params.frequency_penalty,
        presence_penalty: params.presence_penalty,
        repetition_penalty: params.repetition_penalty,
        repetition_context_size: params.repetition_context_size,
        logit_bias: params.logit_bias.clone(),
        tool_schemas_json,
        response_format_json,
        task_name: params.task_name.clone(),
        reasoning_effort: params.reasoning_effort.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::ChatFormatter;

    fn llama_info() -> (tempfile::TempDir, ModelInfo) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::json!({"model_type": "llama"}).to_string(),
        )
        .unwrap();
        let formatter = ChatFormatter::new(dir.path()).unwrap();
        let info = ModelInfo {
            model_id: "test".to_string(),
            model_path: dir.path().to_string_lossy().to_string(),
            formatter: Arc::new(formatter),
            capabilities: None,
        };
        (dir, info)
    }

    #[test]
    fn chat_params_defaults_match_the_protocol() {
        let params = ChatParams::default();
        assert_eq!(params.max_generated_tokens, 1024);
        assert_eq!(params.temperature, 1.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.top_k, -1);
        assert_eq!(params.min_p, 0.0);
        assert!(params.rng_seed.is_none());
        assert!(params.stop.is_empty());
        assert_eq!(params.top_logprobs, 0);
        assert_eq!(params.repetition_context_size, 60);
        assert_eq!(params.repetition_penalty, 1.0);
        assert_eq!(params.n, 1);
        assert!(params.best_of.is_none());
        assert!(params.final_candidates.is_none());
        assert!(!params.reasoning);
        assert!(params.instructions.is_none());
    }

    #[test]
    fn chat_params_deserialize_partial() {
        let params: ChatParams =
            serde_json::from_value(serde_json::json!({"temperature": 0.2, "n": 3})).unwrap();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.n, 3);
        assert_eq!(params.max_generated_tokens, 1024);
    }

    #[test]
    fn payload_carries_rendered_prompt_and_params() {
        let (_dir, info) = llama_info();
        let params = ChatParams {
            rng_seed: Some(7),
            stop: vec!["<done>".to_string()],
            ..Default::default()
        };
        let messages = vec![text_message("user", "Hello!")];

        let payload = build_prompt_payload(&info, &messages, &params).unwrap();
        assert!(payload.text.contains("Hello!"));
        assert!(payload.text.starts_with("<|begin_of_text|>"));
        assert!(payload.text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
        assert_eq!(payload.rng_seed, 7);
        assert_eq!(payload.stop_sequences, vec!["<done>".to_string()]);
        assert_eq!(payload.layout.len(), 1);
        assert_eq!(payload.layout[0].length, payload.text.len() as u64);
    }

    #[test]
    fn unset_seed_is_randomized_per_prompt() {
        let (_dir, info) = llama_info();
        let params = ChatParams::default();
        let messages = vec![text_message("user", "Hello!")];

        let a = build_prompt_payload(&info, &messages, &params).unwrap();
        let b = build_prompt_payload(&info, &messages, &params).unwrap();
        // Overwhelmingly likely distinct; equal seeds would defeat best-of.
        assert_ne!(a.rng_seed, b.rng_seed);
    }

    #[test]
    fn instructions_prepend_a_system_turn() {
        let (_dir, info) = llama_info();
        let params = ChatParams {
            instructions: Some("Answer in French.".to_string()),
            ..Default::default()
        };
        let messages = vec![text_message("user", "Hello!")];

        let payload = build_prompt_payload(&info, &messages, &params).unwrap();
        let system_idx = payload.text.find("Answer in French.").unwrap();
        let user_idx = payload.text.find("Hello!").unwrap();
        assert!(system_idx < user_idx);
    }

    #[test]
    fn empty_conversation_is_rejected() {
        let (_dir, info) = llama_info();
        let result = build_prompt_payload(&info, &[], &ChatParams::default());
        assert!(matches!(
            result,
            Err(Error::Multimodal(MultimodalError::EmptyPrompt))
        ));
    }
}
