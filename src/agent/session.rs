//! One agent subprocess and its line-protocol client
//!
//! `AgentSession` spawns the agent, runs the `initialize`/`newSession`
//! handshake, and exposes `prompt()` which races the RPC response against
//! process death and an activity-idle watchdog. The watchdog keys on
//! *silence*: every server-initiated line of any kind resets it, so
//! long-running tool work never trips it.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::error::{GatewayError, Result};

use super::options::SessionOptions;
use super::reader;
use super::rpc;

/// Timeout for each handshake request
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the in-flight keep-alive reports activity to the pool
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// How often the activity watchdog checks for silence
const WATCHDOG_POLL: Duration = Duration::from_secs(1);

/// Grace period between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(5);

type RpcOutcome = std::result::Result<Value, rpc::RpcError>;

/// Events a session reports to its owner (the pool)
#[derive(Debug)]
pub enum SessionEvent {
    /// The session is alive and doing work
    Activity {
        /// Pool key of the reporting session
        key: String,
    },
    /// The agent reported its context window usage
    ContextUsage {
        /// Pool key of the reporting session
        key: String,
        /// Usage percentage, 0-100
        pct: f64,
    },
}

/// Event wiring handed to a session at spawn
#[derive(Clone)]
pub struct SessionEvents {
    /// Pool key this session serves
    pub key: String,
    /// Channel into the pool's event loop
    pub tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionEvents {
    fn activity(&self) {
        let _ = self.tx.send(SessionEvent::Activity {
            key: self.key.clone(),
        });
    }

    fn context_usage(&self, pct: f64) {
        let _ = self.tx.send(SessionEvent::ContextUsage {
            key: self.key.clone(),
            pct,
        });
    }
}

/// How the subprocess ended
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Terminating signal, if it was killed
    pub signal: Option<i32>,
}

/// State shared between the session handle and its reader task
pub(super) struct Shared {
    stdin: Arc<Mutex<ChildStdin>>,
    pending: StdMutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>,
    chunk_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    last_activity: StdMutex<Instant>,
    last_context_pct: StdMutex<Option<f64>>,
    consecutive_errors: AtomicU32,
    events: SessionEvents,
}

impl Shared {
    fn new(stdin: Arc<Mutex<ChildStdin>>, events: SessionEvents) -> Self {
        Self {
            stdin,
            pending: StdMutex::new(HashMap::new()),
            chunk_tx: StdMutex::new(None),
            last_activity: StdMutex::new(Instant::now()),
            last_context_pct: StdMutex::new(None),
            consecutive_errors: AtomicU32::new(0),
            events,
        }
    }

    pub(super) fn bump_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    fn register(&self, id: u64, tx: oneshot::Sender<RpcOutcome>) {
        self.pending.lock().unwrap().insert(id, tx);
    }

    fn remove_pending(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }

    pub(super) fn complete(&self, id: u64, outcome: RpcOutcome) {
        let tx = self.pending.lock().unwrap().remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => log::debug!("response for unknown request id {id}"),
        }
    }

    /// Drop every pending sender so waiters observe the process as gone
    pub(super) fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    pub(super) fn send_chunk(&self, text: String) {
        let guard = self.chunk_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(text);
        }
    }

    fn set_chunk_tx(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.chunk_tx.lock().unwrap() = tx;
    }

    pub(super) fn record_context(&self, pct: f64) {
        *self.last_context_pct.lock().unwrap() = Some(pct);
        self.events.context_usage(pct);
    }

    pub(super) async fn write_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// One spawned agent subprocess bound to its agent-assigned session id
pub struct AgentSession {
    agent_session_id: String,
    pid: u32,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    prompt_timeout: Duration,
    events: SessionEvents,
    reader_task: JoinHandle<()>,
}

impl AgentSession {
    /// Spawn the agent and complete the handshake
    ///
    /// # Errors
    /// Returns `SpawnFailure` if the process or its pipes cannot be set up,
    /// `HandshakeFailure` if the initialize/newSession exchange does not
    /// complete.
    pub async fn spawn(options: &SessionOptions, events: SessionEvents) -> Result<Self> {
        let mut cmd = Command::new(&options.kiro_bin);
        cmd.arg(&options.subcommand)
            .args(&options.extra_args)
            .current_dir(&options.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::spawn_failure(format!(
                "{} {}: {e}",
                options.kiro_bin.display(),
                options.subcommand
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| GatewayError::spawn_failure("agent exited during startup"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::spawn_failure("stdin pipe unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::spawn_failure("stdout pipe unavailable"))?;

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    log::warn!("wait for agent pid {pid} failed: {e}");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(Some(info));
        });

        let shared = Arc::new(Shared::new(Arc::new(Mutex::new(stdin)), events.clone()));
        let reader_task = tokio::spawn(reader::read_loop(
            BufReader::new(stdout),
            Arc::clone(&shared),
        ));

        let mut session = Self {
            agent_session_id: String::new(),
            pid,
            next_id: AtomicU64::new(1),
            shared,
            exit_rx,
            prompt_timeout: options.prompt_timeout,
            events,
            reader_task,
        };

        match session.handshake(options).await {
            Ok(session_id) => {
                log::info!(
                    "spawned agent pid {pid} (agent session {session_id}) in {}",
                    options.cwd.display()
                );
                session.agent_session_id = session_id;
                Ok(session)
            }
            Err(e) => {
                force_signal(pid, nix::sys::signal::Signal::SIGKILL);
                Err(e)
            }
        }
    }

    async fn handshake(&self, options: &SessionOptions) -> Result<String> {
        timeout(
            HANDSHAKE_TIMEOUT,
            self.call(rpc::METHOD_INITIALIZE, rpc::initialize_params()),
        )
        .await
        .map_err(|_| GatewayError::handshake("initialize timed out"))?
        .map_err(|e| GatewayError::handshake(format!("initialize failed: {e}")))?;

        let created = timeout(
            HANDSHAKE_TIMEOUT,
            self.call(rpc::METHOD_NEW_SESSION, rpc::new_session_params(&options.cwd)),
        )
        .await
        .map_err(|_| GatewayError::handshake("newSession timed out"))?
        .map_err(|e| GatewayError::handshake(format!("newSession failed: {e}")))?;

        created
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::handshake("newSession response missing sessionId"))
    }

    /// Send one prompt and stream reply chunks into `chunk_tx`
    ///
    /// Races the RPC response against process death and the activity-idle
    /// watchdog. The chunk callback and keep-alive are cleared however the
    /// race settles.
    ///
    /// # Errors
    /// `PromptTimeout` after total silence, `ProcessExited` if the agent
    /// died first, `Rpc` for an error response.
    pub async fn prompt(
        &self,
        text: &str,
        chunk_tx: mpsc::UnboundedSender<String>,
    ) -> Result<String> {
        self.shared.set_chunk_tx(Some(chunk_tx));
        self.shared.bump_activity();
        self.events.activity();

        // Coarse keep-alive so idle GC never reaps a busy session
        let keepalive = {
            let events = self.events.clone();
            tokio::spawn(async move {
                let mut ticker = interval(KEEPALIVE_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    events.activity();
                }
            })
        };

        let result = self.prompt_inner(text).await;

        keepalive.abort();
        self.shared.set_chunk_tx(None);
        result
    }

    async fn prompt_inner(&self, text: &str) -> Result<String> {
        let params = rpc::prompt_params(&self.agent_session_id, text);
        let (id, mut rx) = self.begin_call(rpc::METHOD_PROMPT, params).await?;

        let mut exit_rx = self.exit_rx.clone();
        let mut watchdog = interval(WATCHDOG_POLL);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut rx => {
                    return match outcome {
                        Ok(Ok(result)) => Ok(result
                            .get("stopReason")
                            .and_then(Value::as_str)
                            .unwrap_or("end_turn")
                            .to_string()),
                        Ok(Err(e)) => Err(GatewayError::rpc(e.message)),
                        Err(_) => Err(self.exit_error()),
                    };
                }
                changed = exit_rx.wait_for(|info| info.is_some()) => {
                    self.shared.remove_pending(id);
                    return match changed {
                        Ok(info) => {
                            let info = (*info).unwrap_or(ExitInfo { code: None, signal: None });
                            Err(GatewayError::process_exited(info.code, info.signal))
                        }
                        Err(_) => Err(GatewayError::process_exited(None, None)),
                    };
                }
                _ = watchdog.tick() => {
                    if self.shared.silent_for() >= self.prompt_timeout {
                        self.shared.remove_pending(id);
                        return Err(GatewayError::PromptTimeout(self.prompt_timeout.as_secs()));
                    }
                }
            }
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let (_, rx) = self.begin_call(method, params).await?;
        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(GatewayError::rpc(e.message)),
            Err(_) => Err(self.exit_error()),
        }
    }

    async fn begin_call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(u64, oneshot::Receiver<RpcOutcome>)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.register(id, tx);
        let line = rpc::request_line(id, method, params);
        if let Err(e) = self.shared.write_line(&line).await {
            self.shared.remove_pending(id);
            return Err(e);
        }
        Ok((id, rx))
    }

    fn exit_error(&self) -> GatewayError {
        match *self.exit_rx.borrow() {
            Some(info) => GatewayError::process_exited(info.code, info.signal),
            None => GatewayError::process_exited(None, None),
        }
    }

    /// Terminate the subprocess: SIGTERM, then SIGKILL after the grace
    /// period if it is still alive
    pub async fn kill(&self) {
        let rss = self.rss_kb();
        if let Some(info) = self.exit_info() {
            log::debug!(
                "agent pid {} already exited (code {:?}, signal {:?})",
                self.pid,
                info.code,
                info.signal
            );
            return;
        }

        log::debug!("terminating agent pid {}", self.pid);
        force_signal(self.pid, nix::sys::signal::Signal::SIGTERM);

        let mut exit_rx = self.exit_rx.clone();
        if timeout(KILL_GRACE, exit_rx.wait_for(|info| info.is_some()))
            .await
            .is_err()
        {
            log::warn!("agent pid {} ignored SIGTERM, sending SIGKILL", self.pid);
            force_signal(self.pid, nix::sys::signal::Signal::SIGKILL);
            let _ = timeout(
                Duration::from_secs(2),
                exit_rx.wait_for(|info| info.is_some()),
            )
            .await;
        }

        let info = self.exit_info().unwrap_or(ExitInfo {
            code: None,
            signal: None,
        });
        log::info!(
            "agent pid {} exited (code {:?}, signal {:?}, last rss {:?} kb)",
            self.pid,
            info.code,
            info.signal,
            rss
        );
    }

    /// Agent-assigned session id from the handshake
    #[must_use]
    pub fn agent_session_id(&self) -> &str {
        &self.agent_session_id
    }

    /// Subprocess pid
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the subprocess is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit details, once the subprocess has ended
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Most recent context usage percentage reported by the agent
    #[must_use]
    pub fn last_context_pct(&self) -> Option<f64> {
        *self.shared.last_context_pct.lock().unwrap()
    }

    /// Current consecutive prompt-failure count
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.shared.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Record one prompt failure; returns the new count
    pub fn record_error(&self) -> u32 {
        self.shared.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reset the consecutive failure count after a successful turn
    pub fn clear_errors(&self) {
        self.shared.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Resident set size in kilobytes, sampled from `/proc` (best-effort)
    #[must_use]
    pub fn rss_kb(&self) -> Option<u64> {
        read_rss_kb(self.pid)
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn force_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        log::debug!("signal {signal} to pid {pid} failed: {e}");
    }
}

fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            return rest.split_whitespace().next()?.parse().ok();
        }
    }
    None
}
