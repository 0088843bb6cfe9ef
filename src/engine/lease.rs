//! Cross-process engine lease.
//!
//! Guarantees exactly one engine subprocess per host while any number of
//! client processes use it. Coordination state lives under the shared cache
//! directory: a pid file, a JSON refs file listing lease-holder processes,
//! and an advisory file lock serializing access to both. The engine is
//! launched by whichever process acquires first and stopped by whichever
//! releases last.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, Once};
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use thiserror::Error;

use crate::engine::fetch::EngineFetcher;
use crate::engine::process::{
    filter_alive_pids, pid_is_alive, read_pid_file, read_ref_pids, reap_engine_process,
    stop_engine_process, write_pid_file, write_ref_pids,
};
use crate::engine::telemetry::TelemetrySnapshot;
use crate::ipc::endpoints::{cache_root, response_url, EVENT_TOPIC_PREFIX};
use crate::ipc::sockets::{SubscribeSocket, TransportError, DIAL_ATTEMPTS, DIAL_DELAY};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Dwell time between SIGINT, SIGTERM, and SIGKILL when stopping the engine.
const SIGNAL_ESCALATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Lease errors.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("engine did not signal readiness within {0}s")]
    StartupTimeout(u64),

    #[error("engine startup failed: {0}")]
    StartupFailed(String),

    #[error("failed to stop engine process {0}")]
    ShutdownFailed(u32),

    #[error("timed out acquiring the engine lock")]
    LockTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Fetch(#[from] crate::engine::fetch::FetchError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// On-disk coordination paths for the shared engine.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub cache_dir: PathBuf,
    pub pid_file: PathBuf,
    pub refs_file: PathBuf,
    pub lock_file: PathBuf,
    pub ready_file: PathBuf,
    pub engine_log_file: PathBuf,
    pub client_log_file: PathBuf,
}

impl EnginePaths {
    pub fn new() -> Self {
        Self::rooted(cache_root())
    }

    /// Root the coordination files under a specific directory (tests).
    pub fn rooted(cache_dir: PathBuf) -> Self {
        Self {
            pid_file: cache_dir.join("engine.pid"),
            refs_file: cache_dir.join("engine.refs"),
            lock_file: cache_dir.join("engine.lock"),
            ready_file: cache_dir.join("engine.ready"),
            engine_log_file: cache_dir.join("engine.log"),
            client_log_file: cache_dir.join("client.log"),
            cache_dir,
        }
    }
}

impl Default for EnginePaths {
    fn default() -> Self {
        Self::new()
    }
}

/// Paths the exit hook should clean up for this process.
static EXIT_PATHS: Mutex<Option<EnginePaths>> = Mutex::new(None);
static EXIT_HOOK: Once = Once::new();

/// A reference to the shared engine subprocess.
///
/// Acquiring starts the engine when no live process holds a lease; dropping
/// (or closing) releases it, stopping the engine when this was the last
/// holder on the host.
pub struct EngineLease {
    paths: EnginePaths,
    fetcher: EngineFetcher,
    startup_timeout: Duration,
    context: Option<std::sync::Arc<crate::context::EngineContext>>,
    launched: Option<Child>,
    closed: bool,
}

impl EngineLease {
    /// Acquire a lease with default paths and timeouts.
    pub async fn acquire() -> crate::Result<Self> {
        Self::with_options(EnginePaths::new(), None).await
    }

    /// Acquire a lease with custom paths and startup timeout.
    pub async fn with_options(
        paths: EnginePaths,
        startup_timeout: Option<Duration>,
    ) -> crate::Result<Self> {
        let mut lease = Self {
            paths,
            fetcher: EngineFetcher::new(),
            startup_timeout: startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT),
            context: None,
            launched: None,
            closed: false,
        };

        lease.acquire_shared().await?;

        match crate::context::acquire_context().await {
            Ok(context) => lease.context = Some(context),
            Err(e) => {
                lease.release_shared();
                lease.closed = true;
                return Err(e);
            }
        }

        {
            let mut exit_paths = EXIT_PATHS.lock().unwrap_or_else(|e| e.into_inner());
            *exit_paths = Some(lease.paths.clone());
        }
        EXIT_HOOK.call_once(|| unsafe {
            libc::atexit(exit_hook);
        });

        Ok(lease)
    }

    /// The process-wide context this lease holds open.
    pub fn context(&self) -> crate::Result<std::sync::Arc<crate::context::EngineContext>> {
        self.context.clone().ok_or(crate::Error::Closed)
    }

    /// Release this lease. Idempotent; cleanup is best-effort.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.context = None;

        let was_last = crate::context::release_context();
        if was_last {
            self.release_shared();
        }
    }

    /// Force-stop the engine and clear coordination files, regardless of
    /// reference counts. Intended for test harnesses and CLI tooling.
    pub fn shutdown(timeout: Duration) -> Result<(), LeaseError> {
        let paths = EnginePaths::new();
        let lock_file = File::create(&paths.lock_file)?;
        lock_exclusive_timeout(&lock_file, LOCK_TIMEOUT)?;

        let Some(pid) = read_pid_file(&paths.pid_file).filter(|&pid| pid_is_alive(pid)) else {
            log::info!("engine is not running; clearing stale lease files");
            remove_lease_files(&paths);
            return Ok(());
        };

        log::info!("stopping engine process {}", pid);
        if !stop_engine_process(pid, timeout) {
            return Err(LeaseError::ShutdownFailed(pid));
        }
        reap_engine_process(pid);
        remove_lease_files(&paths);
        Ok(())
    }

    async fn acquire_shared(&mut self) -> Result<(), LeaseError> {
        std::fs::create_dir_all(&self.paths.cache_dir)?;

        let lock_file = File::create(&self.paths.lock_file)?;
        lock_exclusive_timeout(&lock_file, LOCK_TIMEOUT)?;

        let refs = filter_alive_pids(&read_ref_pids(&self.paths.refs_file));
        let engine_pid = read_pid_file(&self.paths.pid_file);
        let engine_running = engine_pid.map(pid_is_alive).unwrap_or(false);

        if !engine_running {
            let _ = std::fs::remove_file(&self.paths.pid_file);
            let _ = std::fs::remove_file(&self.paths.ready_file);
        }

        if !engine_running && refs.is_empty() {
            log::debug!("engine not running; launching a new instance");
            let binary = self.fetcher.engine_binary().await?;
            self.spawn_engine(&binary)?;
            self.wait_for_ready()?;
        }

        let mut refs = refs;
        let current_pid = std::process::id();
        if !refs.contains(&current_pid) {
            refs.push(current_pid);
        }
        write_ref_pids(&self.paths.refs_file, &refs)?;

        drop(lock_file);
        Ok(())
    }

    fn spawn_engine(&mut self, binary: &std::path::Path) -> Result<(), LeaseError> {
        log::info!("launching engine from {:?}", binary);
        let log_file = File::create(&self.paths.engine_log_file)?;

        let child = Command::new(binary)
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .spawn()
            .map_err(|e| LeaseError::StartupFailed(format!("failed to spawn engine: {}", e)))?;

        self.launched = Some(child);
        Ok(())
    }

    /// Block until the engine broadcasts its first telemetry event, then
    /// record its pid. The engine creates the response socket during boot,
    /// so the dial below retries until the socket file appears.
    fn wait_for_ready(&mut self) -> Result<(), LeaseError> {
        log::info!("waiting for telemetry heartbeat from engine");
        let deadline = Instant::now() + self.startup_timeout;

        let telemetry_topic: Vec<u8> = [EVENT_TOPIC_PREFIX, b"telemetry".as_slice()].concat();
        let socket = SubscribeSocket::dial(
            &response_url(),
            &[telemetry_topic.as_slice()],
            DIAL_ATTEMPTS,
            DIAL_DELAY,
        )?;

        let result = loop {
            if Instant::now() >= deadline {
                break Err(LeaseError::StartupTimeout(self.startup_timeout.as_secs()));
            }

            if let Some(child) = self.launched.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    break Err(LeaseError::StartupFailed(format!(
                        "engine exited with {} before signaling readiness; see {}",
                        status,
                        self.paths.engine_log_file.display()
                    )));
                }
            }

            let frame = match socket.recv(Duration::from_millis(250)) {
                Ok(frame) => frame,
                Err(TransportError::Timeout) => continue,
                Err(e) => {
                    log::debug!("error receiving startup telemetry: {}", e);
                    continue;
                }
            };

            let Some(nul) = frame.iter().position(|&b| b == 0) else {
                log::warn!("discarding malformed event frame during startup");
                continue;
            };
            if frame[..nul] != telemetry_topic[..] {
                continue;
            }

            let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&frame[nul + 1..]) else {
                log::warn!("discarding malformed telemetry payload during startup");
                continue;
            };
            let Some(snapshot) = TelemetrySnapshot::parse(&payload) else {
                continue;
            };

            if snapshot.health.pid > 0 {
                write_pid_file(&self.paths.pid_file, snapshot.health.pid)?;
                let _ = std::fs::write(&self.paths.ready_file, b"");
                log::info!("engine pid {} recorded", snapshot.health.pid);
                break Ok(());
            }
            log::warn!("telemetry heartbeat missing a valid pid; waiting for the next one");
        };

        socket.close();
        result
    }

    /// Drop this process from the refs file; stop the engine when no live
    /// holders remain. Best-effort: failures are logged, never raised.
    fn release_shared(&mut self) {
        let result = release_lease_files(&self.paths, self.launched.take());
        if let Err(e) = result {
            log::warn!("engine lease release failed: {}", e);
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_exclusive_timeout(file: &File, timeout: Duration) -> Result<(), LeaseError> {
    let deadline = Instant::now() + timeout;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(100))
            }
            Err(_) => return Err(LeaseError::LockTimeout),
        }
    }
}

fn remove_lease_files(paths: &EnginePaths) {
    let _ = std::fs::remove_file(&paths.pid_file);
    let _ = std::fs::remove_file(&paths.ready_file);
    let _ = std::fs::remove_file(&paths.refs_file);
}

fn release_lease_files(paths: &EnginePaths, launched: Option<Child>) -> Result<(), LeaseError> {
    let lock_file = File::create(&paths.lock_file)?;
    lock_exclusive_timeout(&lock_file, LOCK_TIMEOUT)?;

    let current_pid = std::process::id();
    let refs: Vec<u32> = filter_alive_pids(&read_ref_pids(&paths.refs_file))
        .into_iter()
        .filter(|&pid| pid != current_pid)
        .collect();

    if refs.is_empty() {
        if let Some(pid) = read_pid_file(&paths.pid_file).filter(|&pid| pid_is_alive(pid)) {
            if stop_engine_process(pid, SIGNAL_ESCALATION_TIMEOUT) {
                reap_engine_process(pid);
            } else {
                log::warn!("failed to stop engine process {}", pid);
            }
        }
        let _ = std::fs::remove_file(&paths.pid_file);
        let _ = std::fs::remove_file(&paths.ready_file);
    }

    // Reap our direct child if it exited on its own.
    if let Some(mut child) = launched {
        let _ = child.try_wait();
    }

    write_ref_pids(&paths.refs_file, &refs)?;
    Ok(())
}

/// Process-exit hook: best-effort context teardown and lease release so a
/// crashed or hastily-exited client does not strand a refs entry.
extern "C" fn exit_hook() {
    crate::context::force_teardown();

    let paths = EXIT_PATHS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(paths) = paths {
        let _ = release_lease_files(&paths, None);
    }
}
