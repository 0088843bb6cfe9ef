//! Process-wide engine context.
//!
//! One context per process owns the IPC state, the model registry, and the
//! receive loop. It is reference-counted across `EngineLease` instances:
//! the first acquire connects, the last release disconnects. The receive
//! loop reaches the registry through a weak reference installed here, which
//! keeps the registry ↔ IPC relation acyclic.

use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::engine::telemetry::TelemetrySnapshot;
use crate::error::Result;
use crate::ipc::state::{EventCallback, IpcState};
use crate::model::registry::ModelRegistry;

/// Shared state owned by the process-wide context.
pub struct EngineContext {
    ipc: Arc<IpcState>,
    registry: Arc<ModelRegistry>,
    telemetry: Mutex<Option<TelemetrySnapshot>>,
}

impl EngineContext {
    pub fn ipc(&self) -> &Arc<IpcState> {
        &self.ipc
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Most recent telemetry snapshot broadcast by the engine.
    pub fn last_telemetry(&self) -> Option<TelemetrySnapshot> {
        self.telemetry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_telemetry(&self, snapshot: TelemetrySnapshot) {
        let mut guard = self.telemetry.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(snapshot);
    }
}

struct Shared {
    context: Arc<EngineContext>,
    ref_count: u32,
}

static SHARED: Mutex<Option<Shared>> = Mutex::new(None);

/// The live context, if any lease currently holds one.
pub fn current_context() -> Option<Arc<EngineContext>> {
    SHARED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(|shared| Arc::clone(&shared.context))
}

/// Most recent telemetry snapshot, if a context is live.
pub fn last_telemetry() -> Option<TelemetrySnapshot> {
    current_context().and_then(|context| context.last_telemetry())
}

/// Acquire a reference to the context, connecting it on first use.
pub(crate) async fn acquire_context() -> Result<Arc<EngineContext>> {
    {
        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(shared) = shared.as_mut() {
            shared.ref_count += 1;
            return Ok(Arc::clone(&shared.context));
        }
    }

    // Connect outside the lock; dialling can take a while.
    let context = connect_context().await?;

    let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = shared.as_mut() {
        // Lost an initialisation race; keep the winner.
        existing.ref_count += 1;
        let winner = Arc::clone(&existing.context);
        drop(shared);
        context.ipc.disconnect();
        return Ok(winner);
    }

    *shared = Some(Shared {
        context: Arc::clone(&context),
        ref_count: 1,
    });
    Ok(context)
}

/// Release one reference. Returns true when this was the last one and the
/// context has been torn down.
pub(crate) fn release_context() -> bool {
    let context = {
        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        let Some(inner) = shared.as_mut() else {
            return false;
        };
        inner.ref_count = inner.ref_count.saturating_sub(1);
        if inner.ref_count > 0 {
            return false;
        }
        shared.take().map(|s| s.context)
    };

    if let Some(context) = context {
        context.ipc.disconnect();
        true
    } else {
        false
    }
}

/// Tear down regardless of the reference count. Exit-hook path only.
pub(crate) fn force_teardown() {
    let context = SHARED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()
        .map(|s| s.context);
    if let Some(context) = context {
        context.ipc.disconnect();
    }
}

async fn connect_context() -> Result<Arc<EngineContext>> {
    let registry = Arc::new(ModelRegistry::new());
    let callback = event_callback(Arc::downgrade(&registry), tokio::runtime::Handle::current());

    let ipc = Arc::new(IpcState::connect(callback)?);
    registry.attach_ipc(Arc::clone(&ipc)).await;

    Ok(Arc::new(EngineContext {
        ipc,
        registry,
        telemetry: Mutex::new(None),
    }))
}

/// Build the broadcast-event dispatcher run by the receive loop.
fn event_callback(registry: Weak<ModelRegistry>, runtime: tokio::runtime::Handle) -> EventCallback {
    Arc::new(move |name: &str, payload: &Value| match name {
        "telemetry" => {
            let Some(snapshot) = TelemetrySnapshot::parse(payload) else {
                return;
            };
            if let Some(context) = current_context() {
                context.store_telemetry(snapshot);
            }
        }
        "model_loaded" => {
            if let Some(registry) = registry.upgrade() {
                let payload = payload.clone();
                runtime.spawn(async move {
                    registry.handle_model_loaded(&payload).await;
                });
            }
        }
        other => log::debug!("ignoring engine event '{}'", other),
    })
}
