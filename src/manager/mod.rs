//! Broker lifecycle manager.
//!
//! Spawns the broker as a child process, scans its stdout for the one-line
//! `ready:true` handshake, then supervises it with an exit-watcher and a
//! stderr-drainer task. Stop is graceful first (SIGTERM, bounded wait), then
//! forceful.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt as _;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::interceptor::UnixHttpClient;
use crate::proxy::ConnectionInfo;
use crate::utils::paths;

/// Default time allowed for the child to produce its handshake.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Spawning the broker binary failed.
    #[error("failed to spawn broker {binary}")]
    Spawn {
        /// The binary path.
        binary: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Another process holds the spawn lock.
    #[error("another process is already starting the broker")]
    SpawnLocked,

    /// The handshake did not arrive in time; the child was killed.
    #[error("broker did not become ready within {timeout_ms}ms")]
    StartupTimeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The child exited before emitting the handshake.
    #[error("broker exited during startup with {status}")]
    EarlyExit {
        /// The child's exit status.
        status: std::process::ExitStatus,
    },

    /// stdout closed without a handshake line.
    #[error("broker closed stdout without a ready handshake")]
    HandshakeMissing,

    /// I/O while reading the child's pipes.
    #[error("broker pipe error")]
    Io(#[from] std::io::Error),
}

/// How to launch the broker.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Broker executable.
    pub binary: PathBuf,
    /// Arguments (e.g. `["proxy"]`).
    pub args: Vec<String>,
    /// Extra environment (`AQUAMAN_*` configuration).
    pub envs: Vec<(String, String)>,
    /// Handshake deadline.
    pub startup_timeout: Duration,
    /// SIGTERM grace period.
    pub stop_timeout: Duration,
    /// Hold the cross-process spawn lock while starting. Disable for
    /// embedded/test managers that supervise their own private broker.
    pub spawn_lock: bool,
}

impl ManagerConfig {
    /// Launch configuration for an explicit binary.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            args: vec!["proxy".to_owned()],
            envs: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            spawn_lock: true,
        }
    }

    /// Launch the current executable with the `proxy` subcommand.
    pub fn for_current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Add one environment variable.
    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_owned(), value.to_owned()));
        self
    }
}

/// Invoked with the parsed handshake when the broker becomes ready.
pub type ReadyCallback = Box<dyn Fn(&ConnectionInfo) + Send + Sync>;
/// Invoked when startup fails.
pub type ErrorCallback = Box<dyn Fn(&ManagerError) + Send + Sync>;
/// Invoked exactly once with the exit code when the broker terminates.
pub type ExitCallback = Box<dyn Fn(Option<i32>) + Send + Sync>;

#[derive(Default)]
struct CallbackSet {
    on_ready: Option<ReadyCallback>,
    on_error: Option<ErrorCallback>,
    on_exit: Option<ExitCallback>,
}

struct RunningBroker {
    pid: u32,
    info: ConnectionInfo,
    exit_rx: watch::Receiver<Option<std::process::ExitStatus>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Supervises one broker child process.
pub struct ProxyManager {
    config: ManagerConfig,
    callbacks: Arc<CallbackSet>,
    running: Option<RunningBroker>,
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("config", &self.config)
            .field("running", &self.running.as_ref().map(|r| r.pid))
            .finish()
    }
}

/// RAII guard for the spawn lock; removes the lock file on drop.
struct SpawnLockGuard {
    _file: std::fs::File,
    path: PathBuf,
}

impl Drop for SpawnLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn acquire_spawn_lock() -> Result<SpawnLockGuard, ManagerError> {
    let lock_path = paths::broker_lock_path();
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&lock_path)?;

    file.try_lock_exclusive()
        .map_err(|_| ManagerError::SpawnLocked)?;

    // Record our PID for debugging.
    let _ = writeln!(file, "{}", std::process::id());

    Ok(SpawnLockGuard {
        _file: file,
        path: lock_path,
    })
}

impl ProxyManager {
    /// A manager for the given launch configuration.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            callbacks: Arc::new(CallbackSet::default()),
            running: None,
        }
    }

    /// Register lifecycle callbacks. Must be called before [`Self::start`].
    pub fn set_callbacks(
        &mut self,
        on_ready: Option<ReadyCallback>,
        on_error: Option<ErrorCallback>,
        on_exit: Option<ExitCallback>,
    ) {
        self.callbacks = Arc::new(CallbackSet {
            on_ready,
            on_error,
            on_exit,
        });
    }

    /// Spawn the broker and wait for its handshake.
    ///
    /// Returns the parsed [`ConnectionInfo`]. On timeout the child is killed
    /// and an error returned.
    pub async fn start(&mut self) -> Result<ConnectionInfo, ManagerError> {
        if self.is_running() {
            if let Some(running) = &self.running {
                return Ok(running.info.clone());
            }
        }

        let result = self.start_inner().await;
        if let Err(err) = &result {
            if let Some(on_error) = &self.callbacks.on_error {
                on_error(err);
            }
        }
        result
    }

    async fn start_inner(&mut self) -> Result<ConnectionInfo, ManagerError> {
        let _spawn_lock = if self.config.spawn_lock {
            Some(acquire_spawn_lock()?)
        } else {
            None
        };

        let mut command = tokio::process::Command::new(&self.config.binary);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ManagerError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;

        let Some(stdout) = child.stdout.take() else {
            return Err(ManagerError::HandshakeMissing);
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(ManagerError::HandshakeMissing);
        };
        let pid = child.id().unwrap_or_default();

        // Phase 1: scan stdout lines for the handshake, bounded overall.
        let mut lines = BufReader::new(stdout).lines();
        let handshake = tokio::time::timeout(self.config.startup_timeout, async {
            loop {
                match lines.next_line().await? {
                    Some(line) => {
                        if let Ok(info) = serde_json::from_str::<ConnectionInfo>(&line) {
                            if info.ready {
                                return Ok(info);
                            }
                        }
                        // Structured log line before the handshake; keep it.
                        tracing::debug!(target: "broker", "{line}");
                    }
                    None => return Err(ManagerError::HandshakeMissing),
                }
            }
        })
        .await;

        let info = match handshake {
            Ok(Ok(info)) => info,
            Ok(Err(err)) => {
                // stdout closed: the child likely died; prefer its status.
                let _ = child.start_kill();
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(ManagerError::EarlyExit { status });
                }
                let _ = child.wait().await;
                return Err(err);
            }
            Err(_elapsed) => {
                tracing::error!(
                    timeout_ms = self.config.startup_timeout.as_millis() as u64,
                    "broker startup timed out; killing child"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ManagerError::StartupTimeout {
                    timeout_ms: self.config.startup_timeout.as_millis() as u64,
                });
            }
        };

        tracing::info!(pid, backend = %info.backend, "broker ready");
        if let Some(on_ready) = &self.callbacks.on_ready {
            on_ready(&info);
        }

        let mut tasks = Vec::new();

        // Phase 2: background supervision.
        tasks.push(tokio::spawn(async move {
            // Drain remaining stdout (structured log lines).
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "broker", "{line}");
            }
        }));

        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "broker", "{line}");
            }
        }));

        let (exit_tx, exit_rx) = watch::channel(None);
        let callbacks = Arc::clone(&self.callbacks);
        tasks.push(tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(pid, %status, "broker exited");
                    let _ = exit_tx.send(Some(status));
                    // The watcher runs once per child, so the exit callback
                    // fires exactly once no matter how often stop() is called.
                    if let Some(on_exit) = &callbacks.on_exit {
                        on_exit(status.code());
                    }
                }
                Err(err) => {
                    tracing::error!(pid, error = %err, "failed to reap broker");
                    let _ = exit_tx.send(None);
                }
            }
        }));

        self.running = Some(RunningBroker {
            pid,
            info: info.clone(),
            exit_rx,
            tasks,
        });
        Ok(info)
    }

    /// Whether the process is up and the handshake was received.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| r.exit_rx.borrow().is_none())
    }

    /// The handshake record from the last successful start.
    #[must_use]
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.running.as_ref().map(|r| &r.info)
    }

    /// Graceful stop: SIGTERM, bounded wait, then SIGKILL. Safe to call
    /// repeatedly; only the first call acts.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        if running.exit_rx.borrow().is_some() {
            return;
        }

        let pid = Pid::from_raw(running.pid as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            tracing::debug!(error = %err, "SIGTERM failed; broker may already be gone");
        }

        let graceful =
            tokio::time::timeout(self.config.stop_timeout, wait_for_exit(&mut running.exit_rx))
                .await;
        if graceful.is_err() {
            tracing::warn!(
                pid = running.pid,
                "broker did not stop gracefully; sending SIGKILL"
            );
            let _ = kill(pid, Signal::SIGKILL);
            let _ = tokio::time::timeout(
                Duration::from_secs(2),
                wait_for_exit(&mut running.exit_rx),
            )
            .await;
        }
    }

    /// Probe `/_health` over the appropriate transport.
    pub async fn health_check(&self) -> bool {
        let Some(info) = self.connection_info() else {
            return false;
        };

        if let Some(socket_path) = &info.socket_path {
            let client = UnixHttpClient::new(PathBuf::from(socket_path));
            return client
                .request(
                    http::Method::GET,
                    "/_health",
                    &http::HeaderMap::new(),
                    bytes::Bytes::new(),
                )
                .await
                .map(|resp| resp.status.is_success())
                .unwrap_or(false);
        }

        let Some(base) = &info.base_url else {
            return false;
        };
        let Ok(url) = reqwest::Url::parse(base).and_then(|u| u.join("_health")) else {
            return false;
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build();
        match client {
            Ok(client) => client
                .get(url)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

async fn wait_for_exit(rx: &mut watch::Receiver<Option<std::process::ExitStatus>>) {
    while rx.borrow().is_none() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
