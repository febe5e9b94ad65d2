//! Agent sessions and the async session manager.
//!
//! The manager owns every agent session and runs one cooperative processor
//! task per agent. A processor iteration honors the session state machine
//! (sleeping agents poll mail at a reduced cadence), turns incoming mail
//! into tasks, dequeues one task, drives the agent's AI loop, and lets the
//! continuation strategy schedule autonomous follow-up turns. Sessions
//! never self-stop on errors; operators inspect `error_count` instead.

use crate::ai_loop::LoopError;
use crate::capabilities::capabilities_for;
use crate::config::ContinuationConfig;
use crate::context::AgentContext;
use crate::continuation::{
    continuation_message, ContinuationStatus, ContinuationStrategy, TurnRecord,
};
use crate::loop_manager::{AgentAiConfig, AiLoopManager};
use crate::mailbox::{Mail, MailPriority, Mailbox};
use crate::persistence::{
    AgentStateRecord, SleepState, StatePersistence, TaskQueueState,
};
use crate::tools::{SessionOps, ToolContext, ToolRegistry};
use crate::types::{notify, FinishReason, NotificationSender, Task, TaskContext, TaskKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded task queue capacity per agent.
pub const TASK_QUEUE_CAP: usize = 100;

const TASK_POLL: Duration = Duration::from_secs(5);
const IDLE_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Active,
    Sleeping,
    Waiting,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Sleeping => "sleeping",
            Self::Waiting => "waiting",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("agent '{0}' not found")]
    NotFound(String),
    #[error("agent session '{0}' already exists")]
    AlreadyExists(String),
    #[error("task queue full for agent '{0}'")]
    QueueFull(String),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error("persistence error: {0}")]
    Persistence(#[from] crate::persistence::PersistenceError),
}

/// What it takes to create an agent: prompt systems live outside the core,
/// so the system prompt arrives fully formed.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub agent_id: String,
    pub description: String,
    pub system_prompt: String,
    pub ai_config: Option<AgentAiConfig>,
}

impl AgentDefinition {
    pub fn new(agent_id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            description: String::new(),
            system_prompt: system_prompt.into(),
            ai_config: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_ai_config(mut self, ai_config: AgentAiConfig) -> Self {
        self.ai_config = Some(ai_config);
        self
    }
}

/// Inspection view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStateView {
    pub state: AgentState,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<DateTime<Utc>>,
    pub wake_events: Vec<String>,
    pub error_count: u32,
    pub last_active: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task queue
// ---------------------------------------------------------------------------

/// Bounded FIFO with a snapshot view for persistence. Overflow is a
/// synchronous failure to the sender; single consumer per queue.
struct TaskQueue {
    items: Mutex<VecDeque<Task>>,
    notify: Notify,
    cap: usize,
}

impl TaskQueue {
    fn new(cap: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    fn push(&self, task: Task) -> Result<(), Task> {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.cap {
                return Err(task);
            }
            items.push_back(task);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn push_front(&self, task: Task) {
        self.items.lock().unwrap().push_front(task);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Task> {
        self.items.lock().unwrap().pop_front()
    }

    async fn pop_timeout(&self, wait: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Task> {
        self.items.lock().unwrap().iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionState {
    state: AgentState,
    current_task: Option<Task>,
    wake_events: HashSet<String>,
    sleep_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    error_count: u32,
    metadata: HashMap<String, serde_json::Value>,
}

/// One live agent: state, queue, context, and its AI loop (held through the
/// loop manager).
pub struct AgentSession {
    agent_id: String,
    definition: AgentDefinition,
    state: Mutex<SessionState>,
    queue: TaskQueue,
    context: tokio::sync::Mutex<AgentContext>,
    cancel: CancellationToken,
    processor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl AgentSession {
    fn new(definition: AgentDefinition) -> Self {
        let context = AgentContext::new(
            definition.agent_id.clone(),
            Some(definition.system_prompt.clone()),
        );
        Self {
            agent_id: definition.agent_id.clone(),
            definition,
            state: Mutex::new(SessionState {
                state: AgentState::Idle,
                current_task: None,
                wake_events: HashSet::new(),
                sleep_until: None,
                created_at: Utc::now(),
                last_active: Utc::now(),
                error_count: 0,
                metadata: HashMap::new(),
            }),
            queue: TaskQueue::new(TASK_QUEUE_CAP),
            context: tokio::sync::Mutex::new(context),
            cancel: CancellationToken::new(),
            processor: Mutex::new(None),
        }
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    fn current_state(&self) -> AgentState {
        self.state.lock().unwrap().state
    }

    fn touch(&self) {
        self.state.lock().unwrap().last_active = Utc::now();
    }

    /// `current_task` is non-null iff the state is Active.
    fn begin_task(&self, task: &Task) {
        let mut state = self.state.lock().unwrap();
        state.state = AgentState::Active;
        state.current_task = Some(task.clone());
    }

    fn finish_task(&self) {
        let mut state = self.state.lock().unwrap();
        state.current_task = None;
        // A task may have put the session to sleep or stopped it; only an
        // Active session returns to Idle.
        if state.state == AgentState::Active {
            state.state = AgentState::Idle;
        }
    }

    fn record_error(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.error_count += 1;
        state.error_count
    }

    fn view(&self) -> AgentStateView {
        let state = self.state.lock().unwrap();
        AgentStateView {
            state: state.state,
            queue_depth: self.queue.len(),
            current_task: state.current_task.as_ref().map(|t| t.kind.to_string()),
            sleep_until: state.sleep_until,
            wake_events: state.wake_events.iter().cloned().collect(),
            error_count: state.error_count,
            last_active: state.last_active,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct SessionManagerOptions {
    pub loop_manager: AiLoopManager,
    pub registry: Arc<ToolRegistry>,
    pub mailbox: Arc<Mailbox>,
    pub notifications: NotificationSender,
    pub persistence: Option<StatePersistence>,
    pub continuation: ContinuationConfig,
}

struct ManagerEvent {
    event: String,
    data: serde_json::Value,
    timestamp: DateTime<Utc>,
}

struct ManagerInner {
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
    loop_manager: AiLoopManager,
    registry: Arc<ToolRegistry>,
    mailbox: Arc<Mailbox>,
    notifications: NotificationSender,
    persistence: Option<StatePersistence>,
    continuation: ContinuationConfig,
    shutdown: CancellationToken,
    event_tx: tokio::sync::mpsc::UnboundedSender<ManagerEvent>,
    event_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<ManagerEvent>>>,
    event_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Owns all agent sessions and schedules their processors. Cloneable; all
/// clones share the same state.
#[derive(Clone)]
pub struct AsyncSessionManager {
    inner: Arc<ManagerInner>,
}

impl AsyncSessionManager {
    pub fn new(options: SessionManagerOptions) -> Self {
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                sessions: Mutex::new(HashMap::new()),
                loop_manager: options.loop_manager,
                registry: options.registry,
                mailbox: options.mailbox,
                notifications: options.notifications,
                persistence: options.persistence,
                continuation: options.continuation,
                shutdown: CancellationToken::new(),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                event_task: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.inner.registry.clone()
    }

    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.inner.mailbox.clone()
    }

    /// Start the background event processor.
    pub fn start(&self) {
        let Some(mut event_rx) = self.inner.event_rx.lock().unwrap().take() else {
            return;
        };
        let shutdown = self.inner.shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => {
                            debug!(event = %event.event, data = %event.data, at = %event.timestamp, "session event");
                        }
                        None => break,
                    }
                }
            }
        });
        *self.inner.event_task.lock().unwrap() = Some(task);
        info!("async session manager started");
    }

    /// Stop every agent and the event processor.
    pub async fn stop(&self) {
        let agent_ids: Vec<String> = self.inner.sessions.lock().unwrap().keys().cloned().collect();
        for agent_id in agent_ids {
            let _ = self.stop_agent(&agent_id).await;
        }
        self.inner.shutdown.cancel();
        let task = self.inner.event_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("async session manager stopped");
    }

    /// Create an agent session. With `auto_start`, its processor begins
    /// immediately.
    pub async fn create_agent(
        &self,
        definition: AgentDefinition,
        auto_start: bool,
    ) -> Result<(), SessionError> {
        let agent_id = definition.agent_id.clone();
        {
            let sessions = self.inner.sessions.lock().unwrap();
            if sessions.contains_key(&agent_id) {
                return Err(SessionError::AlreadyExists(agent_id));
            }
        }

        let ai_loop = self
            .inner
            .loop_manager
            .get_or_create(&agent_id, definition.ai_config.as_ref());
        {
            // Wire the sleep/wake interface into the loop's tool context.
            let ops: Arc<dyn SessionOps> = Arc::new(ManagerOps {
                inner: Arc::downgrade(&self.inner),
            });
            let mut ai_loop = ai_loop.lock().await;
            ai_loop.set_tool_context(ToolContext::for_agent(&agent_id).with_session(ops));
        }

        let session = Arc::new(AgentSession::new(definition));
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(agent_id.clone(), session.clone());

        if auto_start {
            self.spawn_processor(&session);
        }

        info!(agent_id = %agent_id, auto_start, "created agent session");
        notify(
            &self.inner.notifications,
            "agent.created",
            serde_json::json!({"agent_id": agent_id, "auto_started": auto_start}),
        );
        self.emit_event(
            "agent_created",
            serde_json::json!({"agent_id": session.agent_id}),
        );
        Ok(())
    }

    /// Start the processor of a session created with `auto_start=false`.
    pub fn start_agent(&self, agent_id: &str) -> Result<(), SessionError> {
        let session = self.session(agent_id)?;
        self.spawn_processor(&session);
        Ok(())
    }

    fn spawn_processor(&self, session: &Arc<AgentSession>) {
        let mut slot = session.processor.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let session = session.clone();
        let handle = tokio::spawn(async move {
            agent_processor(inner, session).await;
        });
        *slot = Some(handle);
    }

    /// Enqueue a `direct` task. Queue overflow fails synchronously.
    pub fn send_task(
        &self,
        agent_id: &str,
        prompt: impl Into<String>,
        context: Option<TaskContext>,
    ) -> Result<String, SessionError> {
        let mut task = Task::direct(prompt);
        if let Some(context) = context {
            task.context = context;
        }
        let task_id = task.id.clone();
        self.enqueue_task(agent_id, task)?;
        Ok(task_id)
    }

    pub fn enqueue_task(&self, agent_id: &str, task: Task) -> Result<(), SessionError> {
        let session = self.session(agent_id)?;
        session
            .queue
            .push(task)
            .map_err(|_| SessionError::QueueFull(agent_id.to_string()))?;
        debug!(agent_id, "queued task");
        Ok(())
    }

    /// Put an agent to sleep, optionally until a deadline and with wake
    /// events that end the sleep early.
    pub async fn sleep_agent(
        &self,
        agent_id: &str,
        duration: Option<Duration>,
        wake_events: Option<HashSet<String>>,
    ) -> Result<(), SessionError> {
        self.inner.sleep_agent(agent_id, duration, wake_events).await
    }

    pub async fn wake_agent(&self, agent_id: &str, reason: &str) -> Result<(), SessionError> {
        self.inner.wake_agent(agent_id, reason).await
    }

    /// Stop an agent and release its resources. Terminal.
    pub async fn stop_agent(&self, agent_id: &str) -> Result<(), SessionError> {
        let session = self.session(agent_id)?;
        session.state.lock().unwrap().state = AgentState::Stopped;
        session.cancel.cancel();
        self.inner.loop_manager.remove(agent_id);

        let processor = session.processor.lock().unwrap().take();
        if let Some(processor) = processor {
            let _ = processor.await;
        }
        self.inner.sessions.lock().unwrap().remove(agent_id);

        info!(agent_id, "stopped agent");
        notify(
            &self.inner.notifications,
            "agent.stopped",
            serde_json::json!({"agent_id": agent_id}),
        );
        self.emit_event("agent_stopped", serde_json::json!({"agent_id": agent_id}));
        Ok(())
    }

    /// Broadcast an event; sleeping agents subscribed to it wake.
    pub async fn broadcast_event(&self, event: &str, data: serde_json::Value) {
        self.emit_event(event, data);
        let to_wake: Vec<String> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|session| {
                    let state = session.state.lock().unwrap();
                    state.state == AgentState::Sleeping && state.wake_events.contains(event)
                })
                .map(|session| session.agent_id.clone())
                .collect()
        };
        for agent_id in to_wake {
            let _ = self
                .inner
                .wake_agent(&agent_id, &format!("Event: {event}"))
                .await;
        }
    }

    pub fn agent_states(&self) -> HashMap<String, AgentStateView> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(agent_id, session)| (agent_id.clone(), session.view()))
            .collect()
    }

    pub fn active_models(&self) -> HashMap<String, String> {
        self.inner.loop_manager.active_models()
    }

    // -- Persistence --

    /// Snapshot one session's state, queue, and sleep records.
    pub async fn save_session_state(&self, agent_id: &str) -> Result<(), SessionError> {
        let Some(store) = &self.inner.persistence else {
            return Ok(());
        };
        let session = self.session(agent_id)?;
        let (record, queue_state, sleep_state) = {
            let context = session.context.lock().await;
            let state = session.state.lock().unwrap();
            let record = AgentStateRecord {
                agent_id: agent_id.to_string(),
                status: state.state.as_str().to_string(),
                created_at: state.created_at,
                last_active: state.last_active,
                model: self
                    .inner
                    .loop_manager
                    .active_models()
                    .get(agent_id)
                    .cloned()
                    .unwrap_or_default(),
                system_prompt: context.system_prompt().map(str::to_string),
                message_count: context.message_count(),
                error_count: state.error_count,
                metadata: state.metadata.clone(),
            };
            let queue_state = TaskQueueState {
                agent_id: agent_id.to_string(),
                pending_tasks: session.queue.snapshot(),
                current_task: state.current_task.clone(),
            };
            let sleep_state = SleepState {
                agent_id: agent_id.to_string(),
                is_sleeping: state.state == AgentState::Sleeping,
                sleep_until: state.sleep_until,
                wake_events: state.wake_events.iter().cloned().collect(),
            };
            (record, queue_state, sleep_state)
        };
        store.save_agent_state(&record)?;
        store.save_task_queue_state(&queue_state)?;
        store.save_sleep_state(&sleep_state)?;
        Ok(())
    }

    /// Snapshot all sessions; persistence failures are logged, not fatal.
    pub async fn save_all_session_states(&self) -> usize {
        let agent_ids: Vec<String> = self.inner.sessions.lock().unwrap().keys().cloned().collect();
        let mut saved = 0;
        for agent_id in &agent_ids {
            match self.save_session_state(agent_id).await {
                Ok(()) => saved += 1,
                Err(err) => warn!(agent_id, error = %err, "failed to save session state"),
            }
        }
        info!(saved, total = agent_ids.len(), "saved session states");
        saved
    }

    /// Recreate one persisted session without auto-start: replay pending
    /// tasks and restore sleep state against the wall clock.
    pub async fn restore_session_state(&self, agent_id: &str) -> Result<bool, SessionError> {
        let Some(store) = &self.inner.persistence else {
            return Ok(false);
        };
        let Some(record) = store.load_agent_state(agent_id)? else {
            return Ok(false);
        };

        let mut definition =
            AgentDefinition::new(agent_id, record.system_prompt.clone().unwrap_or_default());
        if !record.model.is_empty() {
            definition = definition.with_ai_config(AgentAiConfig {
                model: Some(record.model.clone()),
                params: None,
            });
        }
        self.create_agent(definition, false).await?;

        let session = self.session(agent_id)?;
        {
            let mut state = session.state.lock().unwrap();
            state.last_active = record.last_active;
            state.created_at = record.created_at;
            state.error_count = record.error_count;
            state.metadata = record.metadata;
        }

        if let Some(sleep) = store.load_sleep_state(agent_id)? {
            if sleep.is_sleeping {
                let mut state = session.state.lock().unwrap();
                // A deadline already in the past means the agent wakes
                // immediately on restart.
                match sleep.sleep_until {
                    Some(until) if until > Utc::now() => {
                        state.state = AgentState::Sleeping;
                        state.sleep_until = Some(until);
                    }
                    Some(_) => state.state = AgentState::Idle,
                    None => state.state = AgentState::Sleeping,
                }
                state.wake_events = sleep.wake_events.into_iter().collect();
            }
        }

        if let Some(queue) = store.load_task_queue_state(agent_id)? {
            if let Some(current) = queue.current_task {
                session.queue.push_front(current);
            }
            for task in queue.pending_tasks {
                if session.queue.push(task).is_err() {
                    warn!(agent_id, "task queue full during restore, dropping task");
                }
            }
        }

        info!(agent_id, "restored session state");
        Ok(true)
    }

    /// Restore every persisted session. Returns the number restored.
    pub async fn restore_all_session_states(&self) -> usize {
        let Some(store) = &self.inner.persistence else {
            return 0;
        };
        let agent_ids = store.list_persisted_agents();
        let mut restored = 0;
        for agent_id in &agent_ids {
            match self.restore_session_state(agent_id).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(err) => warn!(agent_id, error = %err, "failed to restore session"),
            }
        }
        info!(restored, total = agent_ids.len(), "restored persisted sessions");
        restored
    }

    pub fn cleanup_old_states(&self, max_age_hours: u64) -> usize {
        self.inner
            .persistence
            .as_ref()
            .map(|store| store.cleanup(max_age_hours))
            .unwrap_or(0)
    }

    // -- Internals --

    fn session(&self, agent_id: &str) -> Result<Arc<AgentSession>, SessionError> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(agent_id.to_string()))
    }

    fn emit_event(&self, event: &str, data: serde_json::Value) {
        self.inner.emit_event(event, data);
    }
}

impl ManagerInner {
    fn emit_event(&self, event: &str, data: serde_json::Value) {
        let _ = self.event_tx.send(ManagerEvent {
            event: event.to_string(),
            data,
            timestamp: Utc::now(),
        });
    }

    fn get_session(&self, agent_id: &str) -> Result<Arc<AgentSession>, SessionError> {
        self.sessions
            .lock()
            .unwrap()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(agent_id.to_string()))
    }

    async fn sleep_agent(
        &self,
        agent_id: &str,
        duration: Option<Duration>,
        wake_events: Option<HashSet<String>>,
    ) -> Result<(), SessionError> {
        let session = self.get_session(agent_id)?;
        let until = {
            let mut state = session.state.lock().unwrap();
            state.state = AgentState::Sleeping;
            state.sleep_until = duration
                .map(|d| Utc::now() + ChronoDuration::milliseconds(d.as_millis() as i64));
            if let Some(events) = wake_events {
                state.wake_events = events;
            }
            state.sleep_until
        };
        info!(agent_id, until = ?until, "agent sleeping");
        notify(
            &self.notifications,
            "agent.sleeping",
            serde_json::json!({
                "agent_id": agent_id,
                "until": until,
                "wake_events": session.state.lock().unwrap().wake_events.iter().cloned().collect::<Vec<_>>(),
            }),
        );
        self.emit_event("agent_sleeping", serde_json::json!({"agent_id": agent_id}));
        Ok(())
    }

    async fn wake_agent(&self, agent_id: &str, reason: &str) -> Result<(), SessionError> {
        let session = self.get_session(agent_id)?;
        let woke = {
            let mut state = session.state.lock().unwrap();
            if state.state == AgentState::Sleeping {
                state.state = AgentState::Idle;
                state.sleep_until = None;
                state.wake_events.clear();
                true
            } else {
                false
            }
        };
        if woke {
            info!(agent_id, reason, "agent woke");
            notify(
                &self.notifications,
                "agent.woke",
                serde_json::json!({"agent_id": agent_id, "reason": reason}),
            );
            self.emit_event("agent_woke", serde_json::json!({"agent_id": agent_id}));
        }
        Ok(())
    }
}

/// Weak session interface injected into tool contexts, so tools never hold
/// the manager alive (or form a cycle with it).
struct ManagerOps {
    inner: Weak<ManagerInner>,
}

#[async_trait]
impl SessionOps for ManagerOps {
    async fn sleep_agent(
        &self,
        agent_id: &str,
        duration_secs: Option<u64>,
        wake_events: Option<HashSet<String>>,
    ) -> Result<(), String> {
        let inner = self.inner.upgrade().ok_or("session manager is gone")?;
        inner
            .sleep_agent(
                agent_id,
                duration_secs.map(Duration::from_secs),
                wake_events,
            )
            .await
            .map_err(|e| e.to_string())
    }

    async fn wake_agent(&self, agent_id: &str, reason: &str) -> Result<(), String> {
        let inner = self.inner.upgrade().ok_or("session manager is gone")?;
        inner
            .wake_agent(agent_id, reason)
            .await
            .map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Background processor for one agent.
async fn agent_processor(inner: Arc<ManagerInner>, session: Arc<AgentSession>) {
    let agent_id = session.agent_id.clone();
    info!(agent_id = %agent_id, "starting agent processor");

    let mut strategy = ContinuationStrategy::new(inner.continuation.clone());
    let mut continuation_depth: usize = 0;

    loop {
        if session.cancel.is_cancelled() || inner.shutdown.is_cancelled() {
            break;
        }
        let state = session.current_state();
        if state == AgentState::Stopped {
            break;
        }
        session.touch();

        if state == AgentState::Sleeping {
            handle_sleep_state(&inner, &session).await;
            continue;
        }

        check_mail(&inner, &session).await;

        let task = tokio::select! {
            _ = session.cancel.cancelled() => break,
            task = session.queue.pop_timeout(TASK_POLL) => task,
        };

        if let Some(task) = task {
            run_task(
                &inner,
                &session,
                &mut strategy,
                &mut continuation_depth,
                task,
            )
            .await;
        }

        tokio::time::sleep(IDLE_SLEEP).await;
    }

    {
        let mut state = session.state.lock().unwrap();
        state.state = AgentState::Stopped;
        state.current_task = None;
    }
    info!(agent_id = %agent_id, "agent processor stopped");
}

/// Sleeping branch: wake on timer expiry, otherwise poll mail at a reduced
/// cadence (1–5 s).
async fn handle_sleep_state(inner: &Arc<ManagerInner>, session: &Arc<AgentSession>) {
    let sleep_until = session.state.lock().unwrap().sleep_until;
    if let Some(until) = sleep_until {
        if Utc::now() >= until {
            let _ = inner.wake_agent(&session.agent_id, "scheduled").await;
            return;
        }
    }

    check_mail(inner, session).await;

    let wait = match session.state.lock().unwrap().sleep_until {
        Some(until) => {
            let remaining = (until - Utc::now()).num_milliseconds().max(0) as u64;
            Duration::from_millis(remaining.clamp(1000, 5000))
        }
        None => Duration::from_secs(5),
    };
    tokio::select! {
        _ = session.cancel.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }
}

/// Non-blocking mail check: each new message wakes a sleeping subscriber
/// and becomes a `mail` task with a pre-formatted prompt.
async fn check_mail(inner: &Arc<ManagerInner>, session: &Arc<AgentSession>) {
    let messages = inner.mailbox.check(&session.agent_id);
    for message in messages {
        maybe_wake_for_mail(inner, session, &message).await;

        let task = Task {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            kind: TaskKind::Mail,
            prompt: format!(
                "Process this mail:\nFrom: {}\nSubject: {}\n\n{}",
                message.from_agent, message.subject, message.body
            ),
            context: TaskContext {
                from_agent: Some(message.from_agent.clone()),
                priority: Some(
                    serde_json::to_value(message.priority)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default(),
                ),
                mail_id: Some(message.message_id.clone()),
                parent_task: None,
                continuation: false,
            },
        };
        if session.queue.push(task).is_err() {
            warn!(
                agent_id = %session.agent_id,
                mail_id = %message.message_id,
                "task queue full, dropping mail task"
            );
        }
    }
}

async fn maybe_wake_for_mail(inner: &Arc<ManagerInner>, session: &Arc<AgentSession>, mail: &Mail) {
    let (sleeping, wants_mail, wants_priority) = {
        let state = session.state.lock().unwrap();
        (
            state.state == AgentState::Sleeping,
            state.wake_events.contains("mail_received"),
            state.wake_events.contains("high_priority_mail"),
        )
    };
    if !sleeping {
        return;
    }
    if wants_mail {
        let reason = format!("Mail received from {}", mail.from_agent);
        let _ = inner.wake_agent(&session.agent_id, &reason).await;
    } else if wants_priority && mail.priority >= MailPriority::High {
        let reason = format!("High priority mail from {}", mail.from_agent);
        let _ = inner.wake_agent(&session.agent_id, &reason).await;
    }
}

/// Drive one task through the agent's AI loop, emit task notifications, and
/// schedule a continuation turn when the strategy calls for one.
async fn run_task(
    inner: &Arc<ManagerInner>,
    session: &Arc<AgentSession>,
    strategy: &mut ContinuationStrategy,
    continuation_depth: &mut usize,
    task: Task,
) {
    let agent_id = session.agent_id.clone();
    debug!(agent_id = %agent_id, task_id = %task.id, kind = %task.kind, "processing task");

    if task.kind == TaskKind::Continuation {
        *continuation_depth += 1;
    } else {
        *continuation_depth = 0;
        strategy.reset();
    }

    session.begin_task(&task);
    notify(
        &inner.notifications,
        "async.task.started",
        serde_json::json!({
            "agent_id": agent_id,
            "task_id": task.id,
            "task_type": task.kind.to_string(),
            "prompt": preview(&task.prompt),
        }),
    );

    let ai_loop = inner.loop_manager.get_or_create(&agent_id, None);
    let turn = {
        let mut context = session.context.lock().await;
        let mut ai_loop = ai_loop.lock().await;
        ai_loop.process_message(&mut context, task.prompt.as_str()).await
    };

    match turn {
        Ok(result) if result.finish_reason == FinishReason::Cancelled => {
            debug!(agent_id = %agent_id, "task cancelled by shutdown");
        }
        Ok(result) => {
            let record = TurnRecord {
                response_text: result.response.clone(),
                structured: result.structured.clone(),
                tool_calls_count: result.tool_calls_count,
            };

            if result.finish_reason == FinishReason::Error {
                strategy.record_iteration(&record);
                let error_count = session.record_error();
                notify(
                    &inner.notifications,
                    "async.task.error",
                    serde_json::json!({
                        "agent_id": agent_id,
                        "task_id": task.id,
                        "error": result.response,
                        "error_count": error_count,
                    }),
                );
                inner.emit_event(
                    "task_error",
                    serde_json::json!({"agent_id": agent_id, "task_id": task.id}),
                );
            } else {
                // Decide before recording: the strategy may CONTINUE at most
                // max_iterations times per operation.
                let run_again =
                    should_run_again(inner, strategy, &record, &ai_loop, *continuation_depth).await;
                strategy.record_iteration(&record);

                notify(
                    &inner.notifications,
                    "async.task.completed",
                    serde_json::json!({
                        "agent_id": agent_id,
                        "task_id": task.id,
                        "result": result.channel,
                        "raw_result": result.response,
                    }),
                );
                inner.emit_event(
                    "task_completed",
                    serde_json::json!({"agent_id": agent_id, "task_id": task.id}),
                );

                if run_again {
                    let continuation = Task {
                        prompt: continuation_message().to_string(),
                        ..Task::continuation(task.id.clone())
                    };
                    if session.queue.push(continuation).is_ok() {
                        notify(
                            &inner.notifications,
                            "async.task.continuation",
                            serde_json::json!({
                                "agent_id": agent_id,
                                "task_id": task.id,
                                "parent_task": task.id,
                            }),
                        );
                    }
                }
            }
        }
        Err(err) => {
            let error_count = session.record_error();
            error!(agent_id = %agent_id, error = %err, "task failed");
            notify(
                &inner.notifications,
                "async.task.error",
                serde_json::json!({
                    "agent_id": agent_id,
                    "task_id": task.id,
                    "error": err.to_string(),
                    "error_count": error_count,
                }),
            );
            inner.emit_event(
                "task_error",
                serde_json::json!({"agent_id": agent_id, "task_id": task.id}),
            );
        }
    }

    session.finish_task();
}

/// Continuation decision: the strategy's verdict, plus the single-tool-model
/// papering path — one tool call, no explicit terminate, bounded depth.
async fn should_run_again(
    inner: &Arc<ManagerInner>,
    strategy: &ContinuationStrategy,
    record: &TurnRecord,
    ai_loop: &Arc<tokio::sync::Mutex<crate::ai_loop::AiLoop>>,
    continuation_depth: usize,
) -> bool {
    if strategy.should_continue(record) {
        return true;
    }

    let explicit_terminate = strategy
        .extract_state(record)
        .map(|s| s.status == ContinuationStatus::Terminate)
        .unwrap_or(false);
    if explicit_terminate {
        return false;
    }
    if record.tool_calls_count != 1 {
        return false;
    }
    if continuation_depth >= inner.continuation.max_continuation_depth {
        return false;
    }
    let model = ai_loop.lock().await.model().to_string();
    !capabilities_for(&model).multi_tool
}

fn preview(prompt: &str) -> String {
    if prompt.chars().count() > 100 {
        let cut: String = prompt.chars().take(100).collect();
        format!("{cut}...")
    } else {
        prompt.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn task_queue_is_fifo_and_bounded() {
        let queue = TaskQueue::new(2);
        queue.push(Task::direct("one")).unwrap();
        queue.push(Task::direct("two")).unwrap();
        assert!(queue.push(Task::direct("three")).is_err());

        assert_eq!(queue.try_pop().unwrap().prompt, "one");
        assert_eq!(queue.try_pop().unwrap().prompt, "two");
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_timeout_returns_queued_task_promptly() {
        let queue = Arc::new(TaskQueue::new(10));
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.pop_timeout(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Task::direct("late")).unwrap();
        let task = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.unwrap().prompt, "late");
    }

    #[tokio::test]
    async fn pop_timeout_times_out_empty() {
        let queue = TaskQueue::new(10);
        let task = queue.pop_timeout(Duration::from_millis(50)).await;
        assert!(task.is_none());
    }

    #[test]
    fn queue_snapshot_preserves_order() {
        let queue = TaskQueue::new(10);
        queue.push(Task::direct("a")).unwrap();
        queue.push(Task::direct("b")).unwrap();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].prompt, "a");
        assert_eq!(queue.len(), 2, "snapshot does not consume");
    }

    #[test]
    fn session_state_invariants() {
        let session = AgentSession::new(AgentDefinition::new("a", "prompt"));
        assert_eq!(session.current_state(), AgentState::Idle);
        assert!(session.view().current_task.is_none());

        let task = Task::direct("work");
        session.begin_task(&task);
        assert_eq!(session.current_state(), AgentState::Active);
        assert!(session.view().current_task.is_some());

        session.finish_task();
        assert_eq!(session.current_state(), AgentState::Idle);
        assert!(session.view().current_task.is_none());
    }

    #[test]
    fn finish_task_preserves_sleep() {
        let session = AgentSession::new(AgentDefinition::new("a", "prompt"));
        session.begin_task(&Task::direct("work"));
        session.state.lock().unwrap().state = AgentState::Sleeping;
        session.finish_task();
        assert_eq!(session.current_state(), AgentState::Sleeping);
        assert!(session.view().current_task.is_none());
    }
}
