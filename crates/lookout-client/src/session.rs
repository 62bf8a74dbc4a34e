use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use lookout_core::session::SessionState;
use lookout_core::transcript::Transcript;

use crate::config::ClientConfig;
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::sse::{StreamConsumer, StreamEvent};

/// Broadcast capacity for live transcript line fan-out.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Tunables for session drivers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fixed delay between reconnect attempts after a stream failure.
    pub retry_delay: Duration,
    /// Transcript lines retained per session.
    pub transcript_max_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            transcript_max_lines: 2048,
        }
    }
}

impl SessionConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            retry_delay: config.retry_delay(),
            transcript_max_lines: config.session.transcript_max_lines,
        }
    }
}

/// Outcome of a connect request.
pub enum ConnectOutcome {
    /// A new session was started.
    Connected(SessionHandle),
    /// An active session already exists for this agent. Informational, the
    /// existing session is untouched.
    AlreadyActive,
}

impl std::fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected(h) => write!(f, "Connected({})", h.agent()),
            Self::AlreadyActive => write!(f, "AlreadyActive"),
        }
    }
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The gateway released the forwarder.
    Stopped,
    /// The gateway had already released it; same end state, informational.
    AlreadyReleased,
    /// No live session to stop.
    NotActive,
}

enum SessionCmd {
    Stop {
        reply: oneshot::Sender<Result<StopOutcome, GatewayError>>,
    },
}

/// Per-session control handle.
///
/// Returned by [`SessionManager::connect`] and held per session; cleanup runs
/// through it (or through the manager's registry), never through shared
/// mutable process state.
#[derive(Clone)]
pub struct SessionHandle {
    agent: String,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    state_rx: watch::Receiver<SessionState>,
    line_tx: broadcast::Sender<String>,
    transcript: Arc<Mutex<Transcript>>,
    attempts: Arc<AtomicU32>,
}

impl SessionHandle {
    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Reconnect attempts since the stream was last open; resets to zero
    /// when a reconnect succeeds.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Subscribe to transcript lines as they are appended.
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.line_tx.subscribe()
    }

    /// Snapshot of the transcript so far, in append order.
    pub fn transcript(&self) -> Vec<String> {
        lock(&self.transcript).to_vec()
    }

    /// Discard the transcript buffer. Clearing after close is the caller's
    /// choice; the driver never does it on its own.
    pub fn clear_transcript(&self) {
        lock(&self.transcript).clear();
    }

    /// Stop the session. The driver transitions to `Closing` immediately
    /// (cancelling any pending retry); the returned outcome reflects the
    /// teardown call. A teardown error still leaves the session `Closed`
    /// locally.
    pub async fn stop(&self) -> Result<StopOutcome, GatewayError> {
        if self.state().is_terminal() {
            return Ok(StopOutcome::NotActive);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCmd::Stop { reply: reply_tx })
            .is_err()
        {
            return Ok(StopOutcome::NotActive);
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Ok(StopOutcome::NotActive),
        }
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state_rx.clone();
        loop {
            let state = *rx.borrow();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

struct SessionEntry {
    handle: SessionHandle,
    task: Option<JoinHandle<()>>,
}

/// Owns all streaming sessions, at most one live per agent.
///
/// `connect` acquires a token, registers the session, and spawns its driver;
/// `stop` routes through the per-session handle. A shared [`Shutdown`] signal
/// reaches every driver for process-wide teardown.
pub struct SessionManager<G: Gateway> {
    gateway: G,
    config: SessionConfig,
    shutdown: Shutdown,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl<G: Gateway> SessionManager<G> {
    pub fn new(gateway: G, config: SessionConfig) -> Self {
        Self::with_shutdown(gateway, config, Shutdown::new())
    }

    /// Build with an externally owned shutdown signal (e.g. wired to ctrl-c).
    pub fn with_shutdown(gateway: G, config: SessionConfig, shutdown: Shutdown) -> Self {
        Self {
            gateway,
            config,
            shutdown,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Open a session to an agent. Rejects (informationally) when the agent
    /// already has a live session; fails terminally when the token request
    /// fails.
    pub async fn connect(&self, agent: &str) -> Result<ConnectOutcome, GatewayError> {
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (line_tx, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let transcript = Arc::new(Mutex::new(Transcript::with_capacity(
            self.config.transcript_max_lines,
        )));
        let attempts = Arc::new(AtomicU32::new(0));
        let handle = SessionHandle {
            agent: agent.to_string(),
            cmd_tx,
            state_rx,
            line_tx: line_tx.clone(),
            transcript: Arc::clone(&transcript),
            attempts: Arc::clone(&attempts),
        };

        {
            // Registered before the token request so a racing connect for the
            // same agent is rejected even while this one is still Requesting.
            let mut sessions = lock(&self.sessions);
            if let Some(entry) = sessions.get(agent)
                && !entry.handle.state().is_terminal()
            {
                tracing::info!(agent, "connection already active");
                return Ok(ConnectOutcome::AlreadyActive);
            }
            sessions.insert(
                agent.to_string(),
                SessionEntry {
                    handle: handle.clone(),
                    task: None,
                },
            );
        }

        let _ = state_tx.send(SessionState::Requesting);
        let forwarder_id = match self.gateway.connect_agent(agent).await {
            Ok(id) => id,
            Err(e) => {
                let _ = state_tx.send(SessionState::Failed);
                tracing::warn!(agent, error = %e, "session token request failed");
                return Err(e);
            },
        };
        tracing::info!(agent, forwarder_id = %forwarder_id, "session token issued");

        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let driver = SessionDriver {
            agent: agent.to_string(),
            forwarder_id,
            gateway: self.gateway.clone(),
            retry_delay: self.config.retry_delay,
            state_tx,
            line_tx,
            transcript,
            attempts,
            cmd_rx,
            shutdown: self.shutdown.listener(),
            retry_tx,
            retry_rx,
            stream_rx: None,
            consumer: None,
            epoch: 0,
        };
        let task = tokio::spawn(driver.run());
        if let Some(entry) = lock(&self.sessions).get_mut(agent) {
            entry.task = Some(task);
        }
        Ok(ConnectOutcome::Connected(handle))
    }

    /// Stop an agent's session, if it has a live one.
    pub async fn stop(&self, agent: &str) -> Result<StopOutcome, GatewayError> {
        let handle = lock(&self.sessions).get(agent).map(|e| e.handle.clone());
        match handle {
            Some(handle) => handle.stop().await,
            None => Ok(StopOutcome::NotActive),
        }
    }

    pub fn session(&self, agent: &str) -> Option<SessionHandle> {
        lock(&self.sessions).get(agent).map(|e| e.handle.clone())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        lock(&self.sessions)
            .values()
            .filter(|e| !e.handle.state().is_terminal())
            .map(|e| e.handle.agent.clone())
            .collect()
    }

    /// Trigger process-wide teardown and wait for every driver to finish.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = {
            let mut sessions = lock(&self.sessions);
            sessions.values_mut().filter_map(|e| e.task.take()).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

enum Incoming {
    Cmd(Option<SessionCmd>),
    Shutdown,
    Retry(u64),
    Stream(Option<StreamEvent>),
}

/// Drives one session's state machine. All transitions run on this task;
/// commands, consumer events, retry firings and the shutdown signal are
/// serialized through its select loop.
struct SessionDriver<G: Gateway> {
    agent: String,
    forwarder_id: String,
    gateway: G,
    retry_delay: Duration,
    state_tx: watch::Sender<SessionState>,
    line_tx: broadcast::Sender<String>,
    transcript: Arc<Mutex<Transcript>>,
    attempts: Arc<AtomicU32>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    shutdown: ShutdownListener,
    retry_tx: mpsc::UnboundedSender<u64>,
    retry_rx: mpsc::UnboundedReceiver<u64>,
    stream_rx: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    consumer: Option<StreamConsumer>,
    /// Bumped on every transition that invalidates a pending retry; a timer
    /// firing with a stale epoch is discarded.
    epoch: u64,
}

impl<G: Gateway> SessionDriver<G> {
    async fn run(mut self) {
        self.append(format!("connecting to {}...", self.agent));
        self.open_consumer().await;

        loop {
            let incoming = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => Incoming::Cmd(cmd),
                _ = self.shutdown.triggered() => Incoming::Shutdown,
                Some(epoch) = self.retry_rx.recv() => Incoming::Retry(epoch),
                ev = next_stream_event(&mut self.stream_rx) => Incoming::Stream(ev),
            };
            match incoming {
                Incoming::Cmd(Some(SessionCmd::Stop { reply })) => {
                    let result = self.teardown().await;
                    let _ = reply.send(result);
                    return;
                },
                Incoming::Cmd(None) => {
                    // every handle dropped: tear down as if stopped
                    let _ = self.teardown().await;
                    return;
                },
                Incoming::Shutdown => {
                    tracing::info!(agent = %self.agent, "shutdown signal, closing session");
                    let _ = self.teardown().await;
                    return;
                },
                Incoming::Retry(epoch) => self.handle_retry(epoch).await,
                Incoming::Stream(Some(ev)) => {
                    if self.handle_stream_event(ev).await {
                        return;
                    }
                },
                Incoming::Stream(None) => {
                    self.stream_rx = None;
                },
            }
        }
    }

    /// Returns true when the session reached a terminal state.
    async fn handle_stream_event(&mut self, ev: StreamEvent) -> bool {
        match ev {
            StreamEvent::Opened => {
                self.append("connection opened");
                false
            },
            StreamEvent::Line(line) => {
                self.append(line);
                false
            },
            StreamEvent::Ended => {
                // sentinel: normal termination initiated by the server
                self.append("stream ended by server");
                self.epoch += 1;
                self.drop_consumer();
                self.set_state(SessionState::Closed);
                self.release_quietly().await;
                true
            },
            StreamEvent::TransportError(msg) => {
                tracing::warn!(
                    agent = %self.agent,
                    error = %msg,
                    "stream failure, scheduling reconnect"
                );
                self.append("connection error");
                self.drop_consumer();
                self.set_state(SessionState::Retrying);
                self.schedule_retry();
                false
            },
        }
    }

    async fn handle_retry(&mut self, epoch: u64) {
        if epoch != self.epoch {
            tracing::debug!(agent = %self.agent, "discarding stale retry timer");
            return;
        }
        if *self.state_tx.borrow() != SessionState::Retrying {
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(agent = %self.agent, attempt, "attempting to reconnect");
        self.append("attempting to reconnect...");
        self.set_state(SessionState::Requesting);
        // Same token: the backend-side session is still addressable.
        self.open_consumer().await;
    }

    async fn open_consumer(&mut self) {
        match self.gateway.open_stream(&self.forwarder_id).await {
            Ok(stream) => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.consumer = Some(StreamConsumer::spawn(stream, events_tx));
                self.stream_rx = Some(events_rx);
                self.attempts.store(0, Ordering::SeqCst);
                self.set_state(SessionState::Open);
            },
            Err(e) => {
                tracing::warn!(
                    agent = %self.agent,
                    error = %e,
                    "failed to open stream, scheduling reconnect"
                );
                self.append("connection error");
                self.set_state(SessionState::Retrying);
                self.schedule_retry();
            },
        }
    }

    fn schedule_retry(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let tx = self.retry_tx.clone();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(epoch);
        });
    }

    /// Explicit stop / shutdown path. `Closing` is entered (and the retry
    /// epoch invalidated) before the release call goes out; the session ends
    /// `Closed` locally even when that call fails.
    async fn teardown(&mut self) -> Result<StopOutcome, GatewayError> {
        self.epoch += 1;
        self.drop_consumer();
        self.set_state(SessionState::Closing);
        self.append("connection closed");
        let result = match self.gateway.release_forwarder(&self.forwarder_id).await {
            Ok(()) => Ok(StopOutcome::Stopped),
            Err(e) if e.is_not_found() => {
                tracing::info!(agent = %self.agent, "forwarder not found or already stopped");
                Ok(StopOutcome::AlreadyReleased)
            },
            Err(e) => {
                tracing::warn!(agent = %self.agent, error = %e, "failed to release forwarder");
                Err(e)
            },
        };
        self.set_state(SessionState::Closed);
        result
    }

    /// Sentinel path: the forwarder is usually gone already, so not-found is
    /// the expected answer.
    async fn release_quietly(&self) {
        match self.gateway.release_forwarder(&self.forwarder_id).await {
            Ok(()) => {},
            Err(e) if e.is_not_found() => {},
            Err(e) => {
                tracing::warn!(
                    agent = %self.agent,
                    error = %e,
                    "failed to release forwarder after stream end"
                );
            },
        }
    }

    fn drop_consumer(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.close();
        }
        self.stream_rx = None;
    }

    fn append(&self, line: impl Into<String>) {
        let line = line.into();
        lock(&self.transcript).push(line.clone());
        let _ = self.line_tx.send(line);
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }
}

async fn next_stream_event(
    rx: &mut Option<mpsc::UnboundedReceiver<StreamEvent>>,
) -> Option<StreamEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
