//! Aggregated response types for the client API.

use serde::{Deserialize, Serialize};

use crate::ipc::state::ClientDelta;

/// Token usage statistics for one completed prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A complete chat response aggregated from its deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientResponse {
    /// Concatenated content in arrival order.
    pub text: String,
    /// The last non-null finish reason.
    pub finish_reason: Option<String>,
    pub usage: UsageStats,
    /// The raw deltas, for callers that want token ids or logprobs.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<ClientDelta>,
}

impl ClientResponse {
    /// Aggregate deltas: text is the concatenation of non-empty content,
    /// finish reason the last one seen, token counts the maxima reported.
    pub fn from_deltas(deltas: Vec<ClientDelta>) -> Self {
        let text: String = deltas
            .iter()
            .filter_map(|d| d.content.as_deref())
            .collect();

        let finish_reason = deltas
            .iter()
            .rev()
            .find_map(|d| d.finish_reason.clone());

        let mut usage = UsageStats::default();
        for delta in &deltas {
            if let Some(count) = delta.prompt_token_count {
                usage.prompt_tokens = usage.prompt_tokens.max(count);
            }
            if let Some(len) = delta.generation_len {
                usage.completion_tokens = usage.completion_tokens.max(len);
            }
        }
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;

        Self {
            text,
            finish_reason,
            usage,
            deltas,
        }
    }

    /// The first error reported by any delta.
    pub fn error(&self) -> Option<&str> {
        self.deltas.iter().find_map(|d| d.error.as_deref())
    }
}
