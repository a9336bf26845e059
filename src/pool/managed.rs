//! Managed session record
//!
//! The pool's wrapper around a live agent session: the prompt lock that
//! serializes turns for one key, the send count the delta computation
//! reads, and the idle bookkeeping the GC sweeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::agent::AgentSession;

use super::key_prefix;

/// One pool entry: a live agent session plus its turn bookkeeping
#[derive(Clone)]
pub struct ManagedSession {
    /// The agent subprocess client
    pub session: Arc<AgentSession>,
    /// Held for the whole duration of a turn; the next turn for the same
    /// key awaits it before computing its delta
    pub prompt_lock: Arc<Mutex<()>>,
    send_count: Arc<AtomicUsize>,
    last_touched: Arc<StdMutex<Instant>>,
}

impl ManagedSession {
    /// Wrap a freshly spawned session with a released prompt lock
    #[must_use]
    pub fn new(session: Arc<AgentSession>) -> Self {
        Self {
            session,
            prompt_lock: Arc::new(Mutex::new(())),
            send_count: Arc::new(AtomicUsize::new(0)),
            last_touched: Arc::new(StdMutex::new(Instant::now())),
        }
    }

    /// Number of caller-visible messages already turned into prompts
    #[must_use]
    pub fn send_count(&self) -> usize {
        self.send_count.load(Ordering::SeqCst)
    }

    /// Advance the send count to the accepted request's message count
    pub fn set_send_count(&self, count: usize) {
        self.send_count.store(count, Ordering::SeqCst);
    }

    /// Mark the entry as recently active
    pub fn touch(&self) {
        *self.last_touched.lock().unwrap() = Instant::now();
    }

    /// Time since the entry was last touched
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_touched.lock().unwrap().elapsed()
    }

    /// Whether a turn currently holds the prompt lock
    #[must_use]
    pub fn is_prompting(&self) -> bool {
        self.prompt_lock.try_lock().is_err()
    }

    /// Diagnostics snapshot for the heartbeat and `GET /sessions`
    #[must_use]
    pub fn diagnostics(&self, key: &str) -> SessionDiagnostics {
        SessionDiagnostics {
            key: key_prefix(key).to_string(),
            session_id: self.session.agent_session_id().to_string(),
            pid: self.session.pid(),
            alive: self.session.is_alive(),
            send_count: self.send_count(),
            context_pct: self.session.last_context_pct(),
            idle_secs: self.idle().as_secs(),
            rss_kb: self.session.rss_kb(),
            consecutive_errors: self.session.consecutive_errors(),
            prompting: self.is_prompting(),
        }
    }
}

/// Per-entry diagnostics exposed over HTTP and logged by the heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    /// Key prefix identifying the conversation
    pub key: String,
    /// Agent-assigned session id
    pub session_id: String,
    /// Subprocess pid
    pub pid: u32,
    /// Whether the subprocess is still running
    pub alive: bool,
    /// Messages already forwarded as prompts
    pub send_count: usize,
    /// Most recent context usage percentage
    pub context_pct: Option<f64>,
    /// Seconds since the entry was last touched
    pub idle_secs: u64,
    /// Resident set size in kilobytes
    pub rss_kb: Option<u64>,
    /// Consecutive prompt failures
    pub consecutive_errors: u32,
    /// Whether a turn is in flight
    pub prompting: bool,
}
