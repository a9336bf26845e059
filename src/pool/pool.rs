//! The session pool proper

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::agent::{AgentSession, SessionEvent, SessionEvents, SessionOptions};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::openai::ChatMessage;
use crate::routing::{detect_channel_id, RouteTable};

use super::managed::{ManagedSession, SessionDiagnostics};
use super::{key_prefix, latest_user_text, render_prompt};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One accepted turn: the session to prompt, the text to forward, and the
/// held prompt lock. Dropping the turn releases the lock.
pub struct Turn {
    /// The pool entry serving this turn
    pub managed: ManagedSession,
    /// Prompt text: the delta of new user messages (or the full window for
    /// a fresh session)
    pub delta_text: String,
    _guard: OwnedMutexGuard<()>,
}

impl Turn {
    /// The agent session to prompt
    #[must_use]
    pub fn session(&self) -> &Arc<AgentSession> {
        &self.managed.session
    }
}

/// Fingerprint-keyed pool of persistent agent sessions
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Arc<GatewayConfig>,
    routes: RouteTable,
    entries: StdMutex<HashMap<String, ManagedSession>>,
    reset_keys: StdMutex<HashSet<String>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SessionPool {
    /// Create the pool and start its background tasks (event loop, idle
    /// GC, heartbeat)
    #[must_use]
    pub fn new(config: Arc<GatewayConfig>, routes: RouteTable) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            routes,
            entries: StdMutex::new(HashMap::new()),
            reset_keys: StdMutex::new(HashSet::new()),
            event_tx,
            tasks: StdMutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(event_loop(Arc::downgrade(&inner), event_rx)),
            tokio::spawn(gc_loop(Arc::downgrade(&inner))),
            tokio::spawn(heartbeat_loop(Arc::downgrade(&inner))),
        ];
        *inner.tasks.lock().unwrap() = tasks;

        Self { inner }
    }

    /// Resolve the managed session for `key` and compute the turn's prompt
    /// text.
    ///
    /// Awaits the entry's prompt lock before reading the send count, so
    /// concurrent requests for one conversation serialize. A dead entry is
    /// reaped and replaced; a shrunk caller window (upstream reset)
    /// replaces the session and forwards the full window again.
    ///
    /// # Errors
    /// Propagates spawn/handshake failures when a fresh session is needed.
    pub async fn get_or_create(
        &self,
        key: &str,
        messages: &[ChatMessage],
        opaque_session_key: Option<&str>,
    ) -> Result<Turn> {
        loop {
            let existing = { self.inner.entries.lock().unwrap().get(key).cloned() };
            let Some(managed) = existing else {
                match self.create(key, messages, opaque_session_key).await? {
                    Some(turn) => return Ok(turn),
                    // lost a create race; take the existing-entry path
                    None => continue,
                }
            };

            let guard = managed.prompt_lock.clone().lock_owned().await;

            // The entry may have been reset or replaced while we waited
            let current = {
                self.inner
                    .entries
                    .lock()
                    .unwrap()
                    .get(key)
                    .map(|m| Arc::ptr_eq(&m.session, &managed.session))
                    .unwrap_or(false)
            };
            if !current {
                drop(guard);
                continue;
            }

            if !managed.session.is_alive() {
                log::info!("agent for {} is dead, respawning", key_prefix(key));
                self.remove_entry(key);
                drop(guard);
                managed.session.kill().await;
                continue;
            }

            let send_count = managed.send_count();
            if messages.len() < send_count {
                log::warn!(
                    "upstream reset for {} ({} < {}), replacing session",
                    key_prefix(key),
                    messages.len(),
                    send_count
                );
                self.remove_entry(key);
                drop(guard);
                managed.session.kill().await;
                continue;
            }

            let delta_text = render_prompt(&messages[send_count..]);
            managed.set_send_count(messages.len());
            managed.touch();
            return Ok(Turn {
                managed,
                delta_text,
                _guard: guard,
            });
        }
    }

    /// Spawn a fresh session for `key`. Returns `None` when another
    /// request installed an entry first.
    async fn create(
        &self,
        key: &str,
        messages: &[ChatMessage],
        opaque_session_key: Option<&str>,
    ) -> Result<Option<Turn>> {
        let was_reset = { self.inner.reset_keys.lock().unwrap().remove(key) };
        let options = self.session_options_for(opaque_session_key);
        let events = SessionEvents {
            key: key.to_string(),
            tx: self.inner.event_tx.clone(),
        };
        let session = Arc::new(AgentSession::spawn(&options, events).await?);

        let managed = ManagedSession::new(Arc::clone(&session));
        managed.set_send_count(messages.len());
        // Acquire before publishing so the first turn cannot be preempted
        let guard = managed.prompt_lock.clone().lock_owned().await;

        let inserted = {
            let mut entries = self.inner.entries.lock().unwrap();
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(key.to_string(), managed.clone());
                true
            }
        };
        if !inserted {
            log::debug!("lost create race for {}, discarding spawn", key_prefix(key));
            if was_reset {
                self.inner.reset_keys.lock().unwrap().insert(key.to_string());
            }
            drop(guard);
            session.kill().await;
            return Ok(None);
        }

        // After a forced reset only the latest user turn is forwarded; the
        // seeded send count makes the next delta come out right
        let delta_text = if was_reset {
            latest_user_text(messages)
        } else {
            render_prompt(messages)
        };

        Ok(Some(Turn {
            managed,
            delta_text,
            _guard: guard,
        }))
    }

    /// Kill and evict the session for `key`; the next lookup spawns fresh
    /// and forwards only the latest user turn
    pub async fn reset_session(&self, key: &str, reason: &str) {
        let removed = { self.inner.entries.lock().unwrap().remove(key) };
        let Some(managed) = removed else {
            return;
        };
        self.inner.reset_keys.lock().unwrap().insert(key.to_string());
        log::warn!("resetting session {}: {reason}", key_prefix(key));
        managed.session.kill().await;
    }

    /// Diagnostics snapshot of every entry
    #[must_use]
    pub fn diagnostics(&self) -> Vec<SessionDiagnostics> {
        let snapshot: Vec<(String, ManagedSession)> = {
            self.inner
                .entries
                .lock()
                .unwrap()
                .iter()
                .map(|(k, m)| (k.clone(), m.clone()))
                .collect()
        };
        snapshot.iter().map(|(k, m)| m.diagnostics(k)).collect()
    }

    /// Number of managed sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    /// Whether the pool has no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background tasks and kill every subprocess
    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let entries: Vec<ManagedSession> = {
            self.inner
                .entries
                .lock()
                .unwrap()
                .drain()
                .map(|(_, m)| m)
                .collect()
        };
        if !entries.is_empty() {
            log::info!("shutting down pool ({} session(s))", entries.len());
        }
        futures::future::join_all(entries.iter().map(|m| m.session.kill())).await;
    }

    fn remove_entry(&self, key: &str) {
        self.inner.entries.lock().unwrap().remove(key);
    }

    fn session_options_for(&self, opaque_session_key: Option<&str>) -> SessionOptions {
        let config = &self.inner.config;
        let mut options = SessionOptions {
            kiro_bin: config.kiro_bin.clone(),
            subcommand: config.kiro_subcommand.clone(),
            extra_args: config.kiro_args.clone(),
            cwd: config.cwd.clone(),
            prompt_timeout: config.prompt_timeout,
        };

        if let Some(raw) = opaque_session_key {
            if let Some(channel) = detect_channel_id(raw) {
                if let Some(route) = self.inner.routes.lookup(channel) {
                    log::info!("routing channel {channel} to {}", route.cwd.display());
                    options.cwd = route.cwd.clone();
                    if let Some(args) = &route.kiro_args {
                        options.extra_args = args.clone();
                    }
                }
            }
        }

        options
    }
}

async fn event_loop(weak: Weak<PoolInner>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event {
            SessionEvent::Activity { key } => {
                if let Some(managed) = inner.entries.lock().unwrap().get(&key) {
                    managed.touch();
                }
            }
            SessionEvent::ContextUsage { key, pct } => {
                if let Some(managed) = inner.entries.lock().unwrap().get(&key) {
                    managed.touch();
                }
                let config = &inner.config;
                if pct >= config.context_reset_pct {
                    log::warn!(
                        "context usage {pct:.1}% for {} crossed the reset threshold ({:.0}%)",
                        key_prefix(&key),
                        config.context_reset_pct
                    );
                    schedule_context_reset(&inner, &key);
                } else if pct >= config.context_critical_pct {
                    log::warn!("context usage {pct:.1}% for {}", key_prefix(&key));
                } else if pct >= config.context_warn_pct {
                    log::info!("context usage {pct:.1}% for {}", key_prefix(&key));
                } else {
                    log::debug!("context usage {pct:.1}% for {}", key_prefix(&key));
                }
            }
        }
    }
}

/// Evict immediately, kill once the in-flight prompt (if any) finishes,
/// so a context-critical reset never cuts off the reply that reported it
fn schedule_context_reset(inner: &Arc<PoolInner>, key: &str) {
    let removed = { inner.entries.lock().unwrap().remove(key) };
    let Some(managed) = removed else { return };
    inner.reset_keys.lock().unwrap().insert(key.to_string());
    let prefix = key_prefix(key).to_string();
    tokio::spawn(async move {
        let _guard = managed.prompt_lock.clone().lock_owned().await;
        log::warn!("context-critical reset for {prefix}");
        managed.session.kill().await;
    });
}

async fn gc_loop(weak: Weak<PoolInner>) {
    let period = match weak.upgrade() {
        Some(inner) => inner.config.effective_gc_interval(),
        None => return,
    };
    let mut ticker = interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        sweep(&inner).await;
    }
}

async fn sweep(inner: &Arc<PoolInner>) {
    let snapshot: Vec<(String, ManagedSession)> = {
        inner
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect()
    };
    let idle_timeout = inner.config.idle_timeout;

    for (key, managed) in snapshot {
        if !managed.session.is_alive() {
            if remove_if_same(inner, &key, &managed) {
                log::info!("reaped dead agent for {}", key_prefix(&key));
            }
            continue;
        }
        if managed.idle() <= idle_timeout {
            continue;
        }
        // An unresolved prompt lock means a turn is in flight; never evict those
        let Ok(_guard) = managed.prompt_lock.try_lock() else {
            continue;
        };
        if remove_if_same(inner, &key, &managed) {
            log::info!(
                "evicting idle session {} ({}s idle)",
                key_prefix(&key),
                managed.idle().as_secs()
            );
            managed.session.kill().await;
        }
    }
}

fn remove_if_same(inner: &PoolInner, key: &str, managed: &ManagedSession) -> bool {
    let mut entries = inner.entries.lock().unwrap();
    let same = entries
        .get(key)
        .map(|m| Arc::ptr_eq(&m.session, &managed.session))
        .unwrap_or(false);
    if same {
        entries.remove(key);
    }
    same
}

async fn heartbeat_loop(weak: Weak<PoolInner>) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { break };
        let snapshot: Vec<(String, ManagedSession)> = {
            inner
                .entries
                .lock()
                .unwrap()
                .iter()
                .map(|(k, m)| (k.clone(), m.clone()))
                .collect()
        };
        let diags: Vec<SessionDiagnostics> =
            snapshot.iter().map(|(k, m)| m.diagnostics(k)).collect();
        match serde_json::to_string(&diags) {
            Ok(json) => log::info!("pool heartbeat: {} session(s) {json}", diags.len()),
            Err(e) => log::warn!("heartbeat serialization failed: {e}"),
        }
    }
}
