//! Scripted Agent Stream
//!
//! Deterministic `AgentStream` that replays canned event scripts, one script
//! per `start` call. Used by the engine's tests and for offline demos where no
//! agent backend is configured.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::streaming::{AgentRequest, AgentSession, AgentStream, AgentStreamEvent, SessionEvent};

/// One scripted run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Emit these events, then close the channel
    Events(Vec<AgentStreamEvent>),
    /// Emit these events and keep the channel open for `push`
    Open(Vec<AgentStreamEvent>),
    /// Fail `start` as if the backend were unreachable
    Unavailable(String),
}

impl ScriptedRun {
    /// A run that streams `text` and completes with it as the outcome.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::Events(vec![
            AgentStreamEvent::Text {
                content: text.clone(),
            },
            AgentStreamEvent::Complete {
                outcome: serde_json::Value::String(text),
            },
        ])
    }

    /// A run that completes with the given structured outcome.
    pub fn outcome(outcome: serde_json::Value) -> Self {
        Self::Events(vec![AgentStreamEvent::Complete { outcome }])
    }

    /// A run that ends with an agent error.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Events(vec![AgentStreamEvent::Error {
            message: message.into(),
            code: None,
        }])
    }
}

#[derive(Default)]
struct ScriptState {
    runs: VecDeque<ScriptedRun>,
    requests: Vec<AgentRequest>,
    cancelled: Vec<String>,
    open: HashMap<String, mpsc::Sender<SessionEvent>>,
}

/// Replays queued `ScriptedRun`s in FIFO order.
#[derive(Default)]
pub struct ScriptedAgentStream {
    state: Mutex<ScriptState>,
}

impl ScriptedAgentStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stream with runs queued up front.
    pub fn with_runs(runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        let stream = Self::new();
        for run in runs {
            stream.enqueue(run);
        }
        stream
    }

    /// Queue another run for the next `start`.
    pub fn enqueue(&self, run: ScriptedRun) {
        self.lock().runs.push_back(run);
    }

    /// Push a late event into an open session. Returns false once the session
    /// is closed or cancelled.
    pub async fn push(&self, session_id: &str, event: AgentStreamEvent) -> bool {
        let sender = self.lock().open.get(session_id).cloned();
        match sender {
            Some(tx) => tx.send(SessionEvent::new(session_id, event)).await.is_ok(),
            None => false,
        }
    }

    /// Close an open session without cancelling it.
    pub fn close(&self, session_id: &str) {
        self.lock().open.remove(session_id);
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.lock().requests.clone()
    }

    /// Session ids passed to `cancel`, in order.
    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        // A poisoned lock only means another test thread panicked mid-script.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AgentStream for ScriptedAgentStream {
    async fn start(&self, request: AgentRequest) -> CoreResult<AgentSession> {
        let run = {
            let mut state = self.lock();
            state.requests.push(request);
            state.runs.pop_front()
        };

        let run = run.ok_or_else(|| CoreError::unavailable("no scripted run queued"))?;
        let session_id = Uuid::new_v4().to_string();

        let (events, keep_open) = match run {
            ScriptedRun::Events(events) => (events, false),
            ScriptedRun::Open(events) => (events, true),
            ScriptedRun::Unavailable(reason) => return Err(CoreError::unavailable(reason)),
        };

        let (tx, rx) = mpsc::channel(events.len().max(1) + 16);
        for event in events {
            tx.send(SessionEvent::new(&session_id, event))
                .await
                .map_err(|e| CoreError::internal(e.to_string()))?;
        }
        if keep_open {
            self.lock().open.insert(session_id.clone(), tx);
        }

        Ok(AgentSession {
            session_id,
            events: rx,
        })
    }

    async fn cancel(&self, session_id: &str) -> CoreResult<()> {
        let mut state = self.lock();
        state.cancelled.push(session_id.to_string());
        state.open.remove(session_id);
        Ok(())
    }
}
