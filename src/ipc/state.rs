//! Connection state and the response receive loop.
//!
//! One `IpcState` owns the three PIE sockets, the response channel id, the
//! request-id counter, and the map of per-request delta sinks. A dedicated
//! thread polls the response socket, routes deltas to their sinks by topic
//! prefix, and dispatches broadcast events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ipc::endpoints::{
    management_url, request_url, response_topic, response_url, EVENT_TOPIC_PREFIX,
};
use crate::ipc::sockets::{
    ManagementSocket, RequestSocket, SubscribeSocket, TransportError, DIAL_ATTEMPTS, DIAL_DELAY,
};
use crate::ipc::wire::{build_request_frame, PromptPayload, RequestType};

/// How long the receive loop waits per poll before re-checking the stop flag.
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Default deadline for management command replies.
pub const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback invoked by the receive loop for broadcast engine events.
pub type EventCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// One streamed chunk of a model response.
///
/// Deserialized leniently: the engine is authoritative and absent fields
/// fall back to defaults rather than failing the frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientDelta {
    pub request_id: u64,
    pub sequence_id: Option<u64>,
    /// Which prompt of a batched request this delta belongs to.
    pub prompt_index: Option<u32>,
    /// Which candidate of a multi-candidate generation.
    pub candidate_index: Option<u32>,
    pub prompt_token_count: Option<u32>,
    pub num_tokens_in_delta: Option<u32>,
    pub tokens: Vec<i32>,
    pub top_logprobs: Vec<HashMap<String, f64>>,
    pub cumulative_logprob: Option<f64>,
    pub generation_len: Option<u32>,
    pub content: Option<String>,
    pub content_len: Option<u32>,
    #[serde(rename = "is_final_delta")]
    pub is_final: bool,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
}

impl ClientDelta {
    fn disconnect_sentinel(request_id: u64) -> Self {
        Self {
            request_id,
            is_final: true,
            finish_reason: Some("error".to_string()),
            content: Some("Engine process disconnected.".to_string()),
            error: Some("Engine process disconnected.".to_string()),
            ..Default::default()
        }
    }
}

/// Registered sink for one in-flight request.
struct DeltaSink {
    tx: mpsc::UnboundedSender<ClientDelta>,
    /// Finals still expected before the sink is complete; a batch emits one
    /// final per prompt per surviving candidate.
    remaining_finals: usize,
}

type SinkMap = Arc<Mutex<HashMap<u64, DeltaSink>>>;

/// IPC connection state shared by all clients of one process-wide context.
pub struct IpcState {
    request_socket: RequestSocket,
    response_socket: SubscribeSocket,
    management_socket: ManagementSocket,
    response_channel_id: u64,
    request_counter: AtomicU64,
    sinks: SinkMap,
    stop: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl IpcState {
    /// Dial all three endpoints and start the receive loop.
    ///
    /// The response socket subscribes to this channel's topic and to the
    /// broadcast event prefix before dialling, so no frame published after
    /// the dial is missed.
    pub fn connect(events: EventCallback) -> Result<Self> {
        let response_channel_id = generate_channel_id();
        let topic = response_topic(response_channel_id);

        let request_socket = RequestSocket::dial(&request_url(), DIAL_ATTEMPTS, DIAL_DELAY)?;
        let response_socket = SubscribeSocket::dial(
            &response_url(),
            &[topic.as_slice(), EVENT_TOPIC_PREFIX],
            DIAL_ATTEMPTS,
            DIAL_DELAY,
        )?;
        let management_socket = ManagementSocket::dial(&management_url(), DIAL_ATTEMPTS, DIAL_DELAY)?;

        let state = Self {
            request_socket,
            response_socket,
            management_socket,
            response_channel_id,
            request_counter: AtomicU64::new(0),
            sinks: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        };
        state.start_receiver(topic, events);
        Ok(state)
    }

    /// The channel id embedded in this state's response topic.
    pub fn response_channel_id(&self) -> u64 {
        self.response_channel_id
    }

    /// Allocate the next request id: strictly increasing, nonzero, wrapping
    /// past `u64::MAX` back to 1.
    pub fn next_request_id(&self) -> u64 {
        next_request_id(&self.request_counter)
    }

    /// Frame and push a request, registering a sink for its deltas.
    ///
    /// Returns the receiving half; dropping it cancels delivery (the engine
    /// still completes the request on its own schedule).
    pub fn send_request(
        &self,
        request_id: u64,
        model_id: &str,
        model_path: &str,
        request_type: RequestType,
        prompts: &[PromptPayload],
    ) -> Result<mpsc::UnboundedReceiver<ClientDelta>> {
        let frame = build_request_frame(
            request_id,
            model_id,
            model_path,
            request_type,
            self.response_channel_id,
            prompts,
        )?;

        let remaining_finals = prompts
            .iter()
            .map(PromptPayload::final_candidate_count)
            .sum::<usize>()
            .max(1);

        let (tx, rx) = mpsc::unbounded_channel();
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                request_id,
                DeltaSink {
                    tx,
                    remaining_finals,
                },
            );

        if let Err(e) = self.request_socket.send(&frame) {
            self.sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
            return Err(e.into());
        }

        Ok(rx)
    }

    /// Send a management command and block for the reply.
    pub fn management_command(&self, command: &Value, timeout: Duration) -> Result<Value> {
        let payload = serde_json::to_vec(command)?;
        let reply = self
            .management_socket
            .call(&payload, timeout)
            .map_err(|e| match e {
                TransportError::Timeout => Error::Timeout,
                other => other.into(),
            })?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Send a management command without blocking the async caller.
    ///
    /// NNG request/reply is synchronous, so the call runs on the blocking
    /// thread pool.
    pub async fn management_command_async(
        self: &Arc<Self>,
        command: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || state.management_command(&command, timeout))
            .await
            .map_err(|_| Error::ChannelClosed)?
    }

    /// Stop the receive loop, fail any remaining sinks, and close sockets.
    /// Safe to call more than once.
    pub fn disconnect(&self) {
        self.stop.store(true, Ordering::SeqCst);

        {
            let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
            for (&request_id, sink) in sinks.iter() {
                let _ = sink.tx.send(ClientDelta::disconnect_sentinel(request_id));
            }
        }

        let handle = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        self.request_socket.close();
        self.response_socket.close();
        self.management_socket.close();

        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn start_receiver(&self, topic: Vec<u8>, events: EventCallback) {
        let socket = self.response_socket.clone();
        let sinks = Arc::clone(&self.sinks);
        let stop = Arc::clone(&self.stop);

        let handle = std::thread::Builder::new()
            .name("grove-ipc-receiver".to_string())
            .spawn(move || run_receive_loop(socket, sinks, stop, topic, events));

        match handle {
            Ok(h) => {
                let mut guard = self.receiver.lock().unwrap_or_else(|e| e.into_inner());
                *guard = Some(h);
            }
            Err(e) => log::error!("failed to spawn IPC receiver thread: {}", e),
        }
    }
}

impl Drop for IpcState {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Receive loop body. Runs until the stop flag is set.
fn run_receive_loop(
    socket: SubscribeSocket,
    sinks: SinkMap,
    stop: Arc<AtomicBool>,
    topic: Vec<u8>,
    events: EventCallback,
) {
    while !stop.load(Ordering::SeqCst) {
        let frame = match socket.recv(RECEIVE_POLL) {
            Ok(frame) => frame,
            Err(TransportError::Timeout) => continue,
            Err(_) => {
                // Connectionless at this layer: transient errors are retried
                // unless shutdown was requested.
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
        };

        if frame.starts_with(&topic) {
            dispatch_delta(&frame[topic.len()..], &sinks);
        } else if frame.starts_with(EVENT_TOPIC_PREFIX) {
            dispatch_event(&frame, &events);
        }
    }

    log::info!("IPC receiver shutting down");
    let sinks = sinks.lock().unwrap_or_else(|e| e.into_inner());
    if !sinks.is_empty() {
        log::warn!("IPC receiver exiting with {} active requests", sinks.len());
        for (&request_id, sink) in sinks.iter() {
            let _ = sink.tx.send(ClientDelta::disconnect_sentinel(request_id));
        }
    }
}

/// Route one delta frame to its sink, if still registered.
fn dispatch_delta(body: &[u8], sinks: &SinkMap) {
    let delta: ClientDelta = match serde_json::from_slice(body) {
        Ok(delta) => delta,
        Err(e) => {
            // One bad frame must not poison the loop.
            log::warn!("discarding malformed response delta: {}", e);
            return;
        }
    };

    let request_id = delta.request_id;
    let is_final = delta.is_final;

    // Copy the sender out under the lock, then push outside it.
    let tx = {
        let mut sinks = sinks.lock().unwrap_or_else(|e| e.into_inner());
        match sinks.get_mut(&request_id) {
            Some(sink) => {
                let tx = sink.tx.clone();
                if is_final {
                    sink.remaining_finals = sink.remaining_finals.saturating_sub(1);
                    if sink.remaining_finals == 0 {
                        sinks.remove(&request_id);
                    }
                }
                Some(tx)
            }
            None => None,
        }
    };

    if let Some(tx) = tx {
        if tx.send(delta).is_err() {
            // Caller dropped its stream; unregister and keep going.
            sinks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&request_id);
        }
    }
}

/// Parse and dispatch one broadcast event frame.
///
/// Format: `__PIE_EVENT__:<event_name>\x00<json_body>`.
fn dispatch_event(frame: &[u8], events: &EventCallback) {
    let Some(nul) = frame.iter().position(|&b| b == 0) else {
        log::warn!("discarding event frame without NUL separator");
        return;
    };
    let (topic, body) = (&frame[..nul], &frame[nul + 1..]);

    if topic.len() <= EVENT_TOPIC_PREFIX.len() {
        log::warn!("discarding event frame with empty event name");
        return;
    }
    let name = String::from_utf8_lossy(&topic[EVENT_TOPIC_PREFIX.len()..]).to_string();

    let payload: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("discarding malformed '{}' event payload: {}", name, e);
            return;
        }
    };

    log::debug!("engine event: {}", name);
    events(&name, &payload);
}

fn next_request_id(counter: &AtomicU64) -> u64 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

/// Generate the response channel id: high 32 bits are the process id, low
/// 32 bits are random, forced nonzero.
fn generate_channel_id() -> u64 {
    use rand::Rng;

    let pid = std::process::id() as u64 & 0xFFFF_FFFF;
    let random: u32 = rand::thread_rng().gen();

    let channel_id = (pid << 32) | random as u64;
    if channel_id == 0 {
        1
    } else {
        channel_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_ids_embed_the_pid() {
        let expected_pid = std::process::id() as u64 & 0xFFFF_FFFF;
        for _ in 0..100 {
            let id = generate_channel_id();
            assert_ne!(id, 0);
            assert_eq!(id >> 32, expected_pid);
        }
    }

    #[test]
    fn channel_ids_vary_across_calls() {
        let ids: std::collections::HashSet<u64> = (0..1000).map(|_| generate_channel_id()).collect();
        assert!(ids.len() > 990, "channel ids should rarely collide");
    }

    #[test]
    fn request_ids_are_increasing_and_nonzero() {
        let counter = AtomicU64::new(0);
        let mut previous = 0;
        for _ in 0..1000 {
            let id = next_request_id(&counter);
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn request_ids_wrap_to_one() {
        let counter = AtomicU64::new(u64::MAX - 1);
        assert_eq!(next_request_id(&counter), u64::MAX);
        // The wrap lands on zero, which is skipped.
        assert_eq!(next_request_id(&counter), 1);
        assert_eq!(next_request_id(&counter), 2);
    }

    #[test]
    fn delta_parses_all_fields() {
        let json = serde_json::json!({
            "request_id": 42,
            "content": "Hello, world!",
            "is_final_delta": true,
            "finish_reason": "stop",
            "prompt_token_count": 10,
            "generation_len": 5,
        });
        let delta: ClientDelta = serde_json::from_value(json).unwrap();
        assert_eq!(delta.request_id, 42);
        assert_eq!(delta.content.as_deref(), Some("Hello, world!"));
        assert!(delta.is_final);
        assert_eq!(delta.finish_reason.as_deref(), Some("stop"));
        assert_eq!(delta.prompt_token_count, Some(10));
        assert_eq!(delta.generation_len, Some(5));
    }

    #[test]
    fn delta_missing_fields_default() {
        let delta: ClientDelta = serde_json::from_value(serde_json::json!({"request_id": 1})).unwrap();
        assert_eq!(delta.request_id, 1);
        assert!(delta.content.is_none());
        assert!(!delta.is_final);
        assert!(delta.finish_reason.is_none());
        assert!(delta.tokens.is_empty());
        assert!(delta.top_logprobs.is_empty());
    }

    #[test]
    fn delta_parses_logprobs_and_tokens() {
        let json = serde_json::json!({
            "request_id": 7,
            "sequence_id": 3,
            "candidate_index": 1,
            "tokens": [5, 6, 7],
            "top_logprobs": [{"a": -0.5}, {"b": -1.25}],
            "cumulative_logprob": -1.75,
            "num_tokens_in_delta": 3,
        });
        let delta: ClientDelta = serde_json::from_value(json).unwrap();
        assert_eq!(delta.sequence_id, Some(3));
        assert_eq!(delta.candidate_index, Some(1));
        assert_eq!(delta.tokens, vec![5, 6, 7]);
        assert_eq!(delta.top_logprobs.len(), 2);
        assert_eq!(delta.cumulative_logprob, Some(-1.75));
    }

    #[test]
    fn malformed_event_frames_are_dropped() {
        // No NUL separator; must not panic or touch sinks.
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = Arc::clone(&called);
        let events: EventCallback = Arc::new(move |_, _| {
            called_clone.store(true, Ordering::SeqCst);
        });

        dispatch_event(b"__PIE_EVENT__:telemetry-without-separator", &events);
        assert!(!called.load(Ordering::SeqCst));

        dispatch_event(b"__PIE_EVENT__:\x00{}", &events);
        assert!(!called.load(Ordering::SeqCst), "empty event name is dropped");

        dispatch_event(b"__PIE_EVENT__:telemetry\x00{not json", &events);
        assert!(!called.load(Ordering::SeqCst), "bad JSON body is dropped");

        dispatch_event(b"__PIE_EVENT__:telemetry\x00{\"ok\":true}", &events);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_sink_is_unregistered_on_next_delta() {
        let sinks: SinkMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        sinks.lock().unwrap().insert(
            11,
            DeltaSink {
                tx,
                remaining_finals: 1,
            },
        );
        drop(rx);

        let body = serde_json::to_vec(&serde_json::json!({"request_id": 11})).unwrap();
        dispatch_delta(&body, &sinks);
        assert!(sinks.lock().unwrap().is_empty());

        // Later deltas for the same id are discarded silently.
        dispatch_delta(&body, &sinks);
    }

    #[test]
    fn final_delta_completes_single_prompt_sink() {
        let sinks: SinkMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sinks.lock().unwrap().insert(
            3,
            DeltaSink {
                tx,
                remaining_finals: 1,
            },
        );

        let body =
            serde_json::to_vec(&serde_json::json!({"request_id": 3, "is_final_delta": true}))
                .unwrap();
        dispatch_delta(&body, &sinks);

        assert!(sinks.lock().unwrap().is_empty());
        assert!(rx.try_recv().unwrap().is_final);
    }

    #[test]
    fn batch_sink_waits_for_all_finals() {
        let sinks: SinkMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        sinks.lock().unwrap().insert(
            4,
            DeltaSink {
                tx,
                remaining_finals: 2,
            },
        );

        let body =
            serde_json::to_vec(&serde_json::json!({"request_id": 4, "is_final_delta": true}))
                .unwrap();
        dispatch_delta(&body, &sinks);
        assert!(sinks.lock().unwrap().contains_key(&4));

        dispatch_delta(&body, &sinks);
        assert!(sinks.lock().unwrap().is_empty());
    }
}
