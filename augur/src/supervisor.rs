//! Worker supervision - the parent-side state machine over the predictor
//! child process.
//!
//! The supervisor owns the child's process handle and the channel
//! endpoints. One reader task polls the channel with a 100ms deadline,
//! fans every event out to subscribers, synthesizes `Heartbeat`s while
//! work is pending, and resolves the waiter for the next `Done`.
//!
//! Failure split: a user error inside predict is non-fatal (`Done{error}`
//! comes back and the worker returns to READY); the child dying, or the
//! channel ending while work is in flight, is fatal - the supervisor goes
//! DEFUNCT, the in-flight waiter gets the error, and subscribers receive
//! a synthesized failure `Done` so the current prediction still
//! terminates.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::child::WORKER_ROLE_ENV;
use crate::ipc::channel::{
    ChannelListener, EventReader, IPC_SOCKET_ENV, RequestWriter, parent_endpoint,
};
use crate::ipc::protocol::{DoneEvent, WorkerEvent, WorkerRequest};

/// Supervisor view of the child's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    New,
    Starting,
    Ready,
    Processing,
    Defunct,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid operation: worker state is {actual:?} (must be {expected:?})")]
    InvalidState {
        expected: WorkerState,
        actual: WorkerState,
    },
    #[error("predictor errored during setup: {0}")]
    SetupFailed(String),
    #[error("worker setup timed out")]
    SetupTimeout,
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("{0}")]
    Fatal(String),
    #[error("worker channel error: {0}")]
    Channel(String),
}

/// Setup failure with whatever logs were captured before it.
#[derive(Debug)]
pub struct SetupFailure {
    pub error: WorkerError,
    pub logs: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Io(#[from] io::Error),
}

/// Everything a spawner needs to launch the child.
pub struct SpawnContext {
    /// Socket the child must connect back to.
    pub socket_path: PathBuf,
}

/// Extension point for worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, ctx: &SpawnContext) -> Result<Child, SpawnError>;
}

/// Default spawner: re-execute the current binary in the worker role.
///
/// The embedding binary routes itself into [`crate::child::run_child`]
/// when [`WORKER_ROLE_ENV`] is set.
pub struct CurrentExeSpawner;

impl WorkerSpawner for CurrentExeSpawner {
    fn spawn(&self, ctx: &SpawnContext) -> Result<Child, SpawnError> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .env(WORKER_ROLE_ENV, "1")
            .env(IPC_SOCKET_ENV, &ctx.socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Ceiling on connect + setup.
    pub setup_timeout: Duration,
    /// Channel poll granularity; bounds heartbeat and shutdown latency.
    pub poll_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(100),
        }
    }
}

type PendingDone = Option<oneshot::Sender<Result<DoneEvent, String>>>;

pub struct WorkerSupervisor {
    state: StdMutex<WorkerState>,
    options: SupervisorOptions,
    spawner: Option<Box<dyn WorkerSpawner>>,
    /// Pre-connected stream used instead of spawning (tests, embedders).
    preconnected: StdMutex<Option<UnixStream>>,
    writer: OnceLock<RequestWriter>,
    child: tokio::sync::Mutex<Option<Child>>,
    child_pid: AtomicI64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<WorkerEvent>>,
    next_subscriber: AtomicU64,
    pending_done: StdMutex<PendingDone>,
    allow_cancel: AtomicBool,
    current_id: StdMutex<Option<String>>,
    terminating: AtomicBool,
}

impl WorkerSupervisor {
    pub fn new(spawner: Box<dyn WorkerSpawner>, options: SupervisorOptions) -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(WorkerState::New),
            options,
            spawner: Some(spawner),
            preconnected: StdMutex::new(None),
            writer: OnceLock::new(),
            child: tokio::sync::Mutex::new(None),
            child_pid: AtomicI64::new(0),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(0),
            pending_done: StdMutex::new(None),
            allow_cancel: AtomicBool::new(false),
            current_id: StdMutex::new(None),
            terminating: AtomicBool::new(false),
        })
    }

    /// Supervise an already-connected channel with no child process.
    /// The cancel signal path is unavailable; only the `Cancel` message
    /// is sent.
    pub(crate) fn attached(stream: UnixStream, options: SupervisorOptions) -> Arc<Self> {
        let supervisor = Self::new(Box::new(CurrentExeSpawner), options);
        if let Ok(mut preconnected) = supervisor.preconnected.lock() {
            *preconnected = Some(stream);
        }
        supervisor
    }

    pub fn state(&self) -> WorkerState {
        self.state.lock().map(|s| *s).unwrap_or(WorkerState::Defunct)
    }

    fn set_state(&self, to: WorkerState) {
        if let Ok(mut state) = self.state.lock() {
            *state = to;
        }
    }

    fn transition(&self, expected: WorkerState, to: WorkerState) -> Result<(), WorkerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| WorkerError::Fatal("supervisor state poisoned".to_string()))?;
        if *state != expected {
            return Err(WorkerError::InvalidState {
                expected,
                actual: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// Register a fan-out subscription. Events arrive in emission order;
    /// the receiver is unbounded so subscribers can never block the
    /// channel reader.
    pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<WorkerEvent>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, tx);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    fn dispatch(&self, event: WorkerEvent) {
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn register_done_waiter(&self) -> oneshot::Receiver<Result<DoneEvent, String>> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending_done.lock() {
            *pending = Some(tx);
        }
        rx
    }

    fn work_pending(&self) -> bool {
        self.pending_done.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// Fail in-flight work: subscribers get a synthesized failure `Done`
    /// so the current prediction terminates, and the waiter gets the
    /// fatal message. No-op when nothing is pending.
    fn resolve_fatal(&self, message: &str) {
        let waiter = self.pending_done.lock().ok().and_then(|mut p| p.take());
        if let Some(waiter) = waiter {
            self.dispatch(WorkerEvent::Done(DoneEvent::failed(message.to_string())));
            let _ = waiter.send(Err(message.to_string()));
        }
    }

    /// Drive setup: spawn the child, wait for its `Done`, and return the
    /// logs captured along the way. Legal only from NEW.
    pub async fn setup(self: &Arc<Self>) -> Result<String, SetupFailure> {
        self.transition(WorkerState::New, WorkerState::Starting)
            .map_err(|error| SetupFailure {
                error,
                logs: String::new(),
            })?;

        let stream = match self.obtain_stream().await {
            Ok(stream) => stream,
            Err(error) => {
                self.set_state(WorkerState::Defunct);
                return Err(SetupFailure {
                    error,
                    logs: String::new(),
                });
            }
        };

        let (writer, reader) = parent_endpoint(stream);
        let _ = self.writer.set(writer);

        let (log_sub, mut log_rx) = self.subscribe();
        let done_rx = self.register_done_waiter();

        let supervisor = Arc::clone(self);
        tokio::spawn(supervisor.read_loop(reader));

        let outcome = tokio::time::timeout(self.options.setup_timeout, done_rx).await;

        let mut logs = String::new();
        while let Ok(event) = log_rx.try_recv() {
            if let WorkerEvent::Log { message, .. } = event {
                logs.push_str(&message);
            }
        }
        self.unsubscribe(log_sub);

        match outcome {
            Err(_) => {
                self.terminate().await;
                Err(SetupFailure {
                    error: WorkerError::SetupTimeout,
                    logs,
                })
            }
            Ok(Err(_)) => {
                self.set_state(WorkerState::Defunct);
                Err(SetupFailure {
                    error: WorkerError::Fatal("supervisor reader exited during setup".to_string()),
                    logs,
                })
            }
            Ok(Ok(Err(fatal))) => Err(SetupFailure {
                error: WorkerError::Fatal(fatal),
                logs,
            }),
            Ok(Ok(Ok(done))) if done.error => {
                self.set_state(WorkerState::Defunct);
                Err(SetupFailure {
                    error: WorkerError::SetupFailed(done.error_detail),
                    logs,
                })
            }
            Ok(Ok(Ok(_))) => {
                self.set_state(WorkerState::Ready);
                tracing::info!("Worker setup complete");
                Ok(logs)
            }
        }
    }

    async fn obtain_stream(&self) -> Result<UnixStream, WorkerError> {
        let preconnected = self.preconnected.lock().ok().and_then(|mut p| p.take());
        if let Some(stream) = preconnected {
            return Ok(stream);
        }

        let spawner = self
            .spawner
            .as_ref()
            .ok_or_else(|| WorkerError::Spawn("no spawner configured".to_string()))?;

        let listener = ChannelListener::bind()
            .map_err(|e| WorkerError::Spawn(format!("failed to bind channel socket: {e}")))?;
        let ctx = SpawnContext {
            socket_path: listener.socket_path().to_path_buf(),
        };

        tracing::info!("Spawning worker subprocess");
        let child = spawner
            .spawn(&ctx)
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        if let Some(pid) = child.id() {
            self.child_pid.store(i64::from(pid), Ordering::Release);
        }
        *self.child.lock().await = Some(child);

        tokio::time::timeout(self.options.setup_timeout, listener.accept())
            .await
            .map_err(|_| WorkerError::SetupTimeout)?
            .map_err(|e| WorkerError::Spawn(format!("failed to accept worker connection: {e}")))
    }

    /// Run one prediction to its `Done`. Legal only from READY; events
    /// stream to subscribers while this waits.
    pub async fn predict(
        &self,
        id: String,
        payload: serde_json::Value,
    ) -> Result<DoneEvent, WorkerError> {
        self.transition(WorkerState::Ready, WorkerState::Processing)?;

        if let Ok(mut current) = self.current_id.lock() {
            *current = Some(id.clone());
        }
        self.allow_cancel.store(true, Ordering::Release);
        let done_rx = self.register_done_waiter();

        let writer = self
            .writer
            .get()
            .ok_or_else(|| WorkerError::Channel("channel not connected".to_string()))?;
        if let Err(e) = writer
            .send(WorkerRequest::PredictionInput { id: id.clone(), payload })
            .await
        {
            self.set_state(WorkerState::Defunct);
            self.resolve_fatal(&format!("failed to send prediction request: {e}"));
            return Err(WorkerError::Channel(e.to_string()));
        }

        let outcome = done_rx.await;

        self.allow_cancel.store(false, Ordering::Release);
        if let Ok(mut current) = self.current_id.lock() {
            *current = None;
        }

        match outcome {
            Ok(Ok(done)) => {
                // User failures are non-fatal: back to READY either way,
                // unless something else already marked us DEFUNCT.
                let mut state = self
                    .state
                    .lock()
                    .map_err(|_| WorkerError::Fatal("supervisor state poisoned".to_string()))?;
                if *state == WorkerState::Processing {
                    *state = WorkerState::Ready;
                }
                Ok(done)
            }
            Ok(Err(fatal)) => Err(WorkerError::Fatal(fatal)),
            Err(_) => Err(WorkerError::Channel(
                "supervisor reader dropped the prediction".to_string(),
            )),
        }
    }

    /// Best-effort cancellation of the in-flight prediction.
    ///
    /// At-most-once-effective per prediction: the first call sends
    /// SIGUSR1 plus a `Cancel` message; repeats (and calls outside
    /// PROCESSING) are harmless no-ops. Non-blocking.
    pub fn cancel(&self) {
        if self.state() != WorkerState::Processing {
            return;
        }
        if !self.allow_cancel.swap(false, Ordering::AcqRel) {
            return;
        }

        let id = self.current_id.lock().ok().and_then(|current| current.clone());
        tracing::debug!(id = id.as_deref().unwrap_or("?"), "Cancelling prediction");

        #[cfg(unix)]
        {
            let pid = self.child_pid.load(Ordering::Acquire);
            if pid > 0
                && let Err(e) = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGUSR1,
                )
            {
                tracing::warn!(pid, error = %e, "Failed to signal worker for cancellation");
            }
        }

        if let (Some(writer), Some(id)) = (self.writer.get(), id) {
            let writer = writer.clone();
            tokio::spawn(async move {
                if let Err(e) = writer.send(WorkerRequest::Cancel { id }).await {
                    tracing::warn!(error = %e, "Failed to send cancel message");
                }
            });
        }
    }

    /// Graceful termination: ask the child to exit, let an in-flight
    /// prediction drain its `Done`, then close up, all bounded by
    /// `timeout`. The supervisor is single-use and ends DEFUNCT.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.state() == WorkerState::Defunct {
            return;
        }
        self.terminating.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + timeout;

        if let Some(writer) = self.writer.get() {
            if let Err(e) = writer.send(WorkerRequest::Shutdown).await {
                tracing::warn!(error = %e, "Failed to send shutdown request");
            }
        }

        // Shutdown waits for the in-flight prediction's Done (whether
        // cancellation-induced or not) before closing the channel.
        if self.state() == WorkerState::Processing {
            let (sub, mut rx) = self.subscribe();
            loop {
                let event = tokio::time::timeout_at(deadline, rx.recv()).await;
                match event {
                    Ok(Some(WorkerEvent::Done(_))) | Ok(None) => break,
                    Ok(Some(_)) => continue,
                    Err(_) => {
                        tracing::warn!("Shutdown timeout with prediction in flight");
                        break;
                    }
                }
            }
            self.unsubscribe(sub);
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => tracing::info!(?status, "Worker exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for worker"),
                Err(_) => {
                    tracing::warn!("Worker did not exit in time, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.set_state(WorkerState::Defunct);
        self.resolve_fatal("worker shut down before prediction completed");
    }

    /// Forcible termination: kill the child and go DEFUNCT. Any in-flight
    /// prediction is failed.
    pub async fn terminate(&self) {
        self.terminating.store(true, Ordering::Release);
        self.set_state(WorkerState::Defunct);

        if let Some(mut child) = self.child.lock().await.take() {
            tracing::warn!("Terminating worker subprocess");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        self.resolve_fatal("worker terminated");
    }

    async fn fatal_exit_message(&self) -> String {
        let exitcode = match self.child.lock().await.as_mut() {
            Some(child) => child.try_wait().ok().flatten().and_then(|s| s.code()),
            None => None,
        };
        match exitcode {
            Some(code) => format!(
                "Prediction failed for an unknown reason. It might have run out of memory? (exitcode {code})"
            ),
            None => "Prediction failed for an unknown reason. It might have run out of memory?"
                .to_string(),
        }
    }

    /// The one task reading the channel. Dispatches every event in
    /// emission order, beats the heart while work is pending, and turns
    /// unexpected end-of-stream into a fatal failure.
    async fn read_loop(self: Arc<Self>, mut reader: EventReader) {
        loop {
            match tokio::time::timeout(self.options.poll_interval, reader.next()).await {
                Err(_) => {
                    if self.work_pending() {
                        self.dispatch(WorkerEvent::Heartbeat);
                    }
                }
                Ok(Some(Ok(event))) => {
                    let done = match &event {
                        WorkerEvent::Done(done) => Some(done.clone()),
                        _ => None,
                    };
                    self.dispatch(event);
                    if let Some(done) = done {
                        let waiter = self.pending_done.lock().ok().and_then(|mut p| p.take());
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(Ok(done));
                            }
                            None => tracing::warn!("Done received with no waiter registered"),
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(error = %e, "Worker channel error");
                    self.set_state(WorkerState::Defunct);
                    self.resolve_fatal(&format!("worker channel error: {e}"));
                    return;
                }
                Ok(None) => {
                    if self.terminating.load(Ordering::Acquire) {
                        tracing::debug!("Worker channel closed during shutdown");
                        return;
                    }
                    tracing::error!("Worker channel closed unexpectedly (child crashed?)");
                    let message = self.fatal_exit_message().await;
                    self.set_state(WorkerState::Defunct);
                    self.resolve_fatal(&message);
                    return;
                }
            }
        }
    }
}
