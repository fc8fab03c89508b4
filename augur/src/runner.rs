//! The single-slot prediction gate.
//!
//! The runner owns the supervisor and admits at most one in-flight
//! prediction. A retry with the running id observes the existing
//! prediction (idempotent PUT); a different id is rejected while the
//! slot is occupied. Prediction N+1 is not admitted until prediction N's
//! handler has finished terminal processing and released the slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;

use crate::config::RuntimeConfig;
use crate::files;
use crate::handler::EventHandler;
use crate::health::{Health, SetupResult};
use crate::prediction::Prediction;
use crate::supervisor::{WorkerError, WorkerSupervisor};
use crate::webhook::{WebhookConfig, WebhookEventType, WebhookSender};

/// Grace window between a timeout-triggered cancel and the forcible
/// worker termination.
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct PredictionRequest {
    pub id: Option<String>,
    #[serde(default = "default_empty_input", deserialize_with = "deserialize_input")]
    pub input: serde_json::Value,
    pub webhook: Option<String>,
    #[serde(default = "default_webhook_events_filter")]
    pub webhook_events_filter: Vec<WebhookEventType>,
}

impl Default for PredictionRequest {
    fn default() -> Self {
        Self {
            id: None,
            input: default_empty_input(),
            webhook: None,
            webhook_events_filter: default_webhook_events_filter(),
        }
    }
}

fn default_empty_input() -> serde_json::Value {
    serde_json::json!({})
}

fn deserialize_input<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(if value.is_null() {
        serde_json::json!({})
    } else {
        value
    })
}

fn default_webhook_events_filter() -> Vec<WebhookEventType> {
    vec![
        WebhookEventType::Start,
        WebhookEventType::Output,
        WebhookEventType::Logs,
        WebhookEventType::Completed,
    ]
}

fn generate_prediction_id() -> String {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("pred_{timestamp:x}")
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("already running a prediction: {running_id}")]
    Busy { running_id: String },
    #[error("Setup has not finished yet")]
    NotReady,
    #[error("Setup failed; predictions are unavailable")]
    SetupFailed,
    #[error("Worker is defunct; the runtime must be restarted")]
    Defunct,
}

/// Handle to a submitted prediction for live snapshots and waiting.
#[derive(Clone, Debug)]
pub struct PredictionHandle {
    id: String,
    prediction: Arc<StdMutex<Prediction>>,
    finished: watch::Receiver<bool>,
}

impl PredictionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current response document.
    pub fn document(&self) -> serde_json::Value {
        self.prediction
            .lock()
            .map(|p| p.to_document())
            .unwrap_or(serde_json::Value::Null)
    }

    pub fn is_terminal(&self) -> bool {
        self.prediction
            .lock()
            .map(|p| p.is_terminal())
            .unwrap_or(true)
    }

    /// Wait until terminal processing (including webhook dispatch
    /// initiation) has completed.
    pub async fn wait(&self) {
        let mut finished = self.finished.clone();
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Snapshot of runner health for the HTTP surface.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: Health,
    pub setup: Option<SetupResult>,
}

pub struct Runner {
    supervisor: Arc<WorkerSupervisor>,
    config: RuntimeConfig,
    webhook_config: WebhookConfig,
    cancel_grace: Duration,
    slot: StdMutex<Option<PredictionHandle>>,
    health: StdMutex<Health>,
    setup_result: StdMutex<Option<SetupResult>>,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runner {
    pub fn new(supervisor: Arc<WorkerSupervisor>, config: RuntimeConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let webhook_config = WebhookConfig::from_runtime(&config);
        Arc::new(Self {
            supervisor,
            config,
            webhook_config,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            slot: StdMutex::new(None),
            health: StdMutex::new(Health::Starting),
            setup_result: StdMutex::new(None),
            accepting: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        })
    }

    #[cfg(test)]
    fn with_cancel_grace(self: Arc<Self>, grace: Duration) -> Arc<Self> {
        let mut runner = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("runner already shared"));
        runner.cancel_grace = grace;
        Arc::new(runner)
    }

    /// Drive worker setup and surface the result to health checks.
    pub async fn setup(self: &Arc<Self>) -> Result<(), WorkerError> {
        let started = SetupResult::starting();
        match self.supervisor.setup().await {
            Ok(logs) => {
                self.set_setup_result(started.succeeded(logs));
                self.set_health(Health::Ready);
                self.accepting.store(true, Ordering::Release);
                Ok(())
            }
            Err(failure) => {
                tracing::error!(error = %failure.error, "Worker setup failed");
                self.set_setup_result(
                    started.failed(failure.logs.clone(), failure.error.to_string()),
                );
                self.set_health(Health::SetupFailed);
                Err(failure.error)
            }
        }
    }

    fn set_health(&self, health: Health) {
        if let Ok(mut current) = self.health.lock() {
            *current = health;
        }
    }

    fn set_setup_result(&self, result: SetupResult) {
        if let Ok(mut current) = self.setup_result.lock() {
            *current = Some(result);
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        let base = self.health.lock().map(|h| *h).unwrap_or(Health::Defunct);
        let status = if base == Health::Ready && self.is_busy() {
            Health::Busy
        } else {
            base
        };
        HealthSnapshot {
            status,
            setup: self.setup_result.lock().ok().and_then(|s| s.clone()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn current_id(&self) -> Option<String> {
        self.slot
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|h| h.id().to_string()))
    }

    /// Admit a prediction, or return the handle to the identical one
    /// already running (idempotent retry).
    pub fn predict(
        self: &Arc<Self>,
        request: PredictionRequest,
    ) -> Result<PredictionHandle, RunnerError> {
        let base_health = self.health.lock().map(|h| *h).unwrap_or(Health::Defunct);
        match base_health {
            Health::SetupFailed => return Err(RunnerError::SetupFailed),
            Health::Defunct => return Err(RunnerError::Defunct),
            Health::Starting => return Err(RunnerError::NotReady),
            Health::Ready | Health::Busy => {}
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RunnerError::NotReady);
        }

        let id = request.id.unwrap_or_else(generate_prediction_id);

        let mut slot = self
            .slot
            .lock()
            .map_err(|_| RunnerError::Defunct)?;
        if let Some(existing) = slot.as_ref() {
            if existing.id() == id {
                return Ok(existing.clone());
            }
            return Err(RunnerError::Busy {
                running_id: existing.id().to_string(),
            });
        }

        // Data-URL inputs become temp files before crossing the channel;
        // the response still echoes the input exactly as submitted.
        let scratch = std::env::temp_dir().join(format!("augur-inputs-{id}"));
        let (payload, temp_files) = match files::materialize_data_urls(&request.input, &scratch) {
            Ok(materialized) => materialized,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to materialize file inputs, passing through");
                (request.input.clone(), Vec::new())
            }
        };

        let webhook = request.webhook.as_ref().and_then(|url| {
            let events = request.webhook_events_filter.iter().copied().collect();
            match WebhookSender::new(url.clone(), events, self.webhook_config.clone()) {
                Ok(sender) => Some(sender),
                Err(e) => {
                    tracing::error!(url = %url, error = %e, "Failed to create webhook sender");
                    None
                }
            }
        });

        let mut prediction = Prediction::new(id.clone(), request.input);
        prediction.set_processing();
        let prediction = Arc::new(StdMutex::new(prediction));

        let (finished_tx, finished_rx) = watch::channel(false);
        let handle = PredictionHandle {
            id: id.clone(),
            prediction: Arc::clone(&prediction),
            finished: finished_rx,
        };
        *slot = Some(handle.clone());
        drop(slot);

        tracing::info!(prediction_id = %id, "Starting prediction");

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner
                .drive_prediction(id, payload, prediction, webhook, temp_files, finished_tx)
                .await;
        });

        Ok(handle)
    }

    async fn drive_prediction(
        self: Arc<Self>,
        id: String,
        payload: serde_json::Value,
        prediction: Arc<StdMutex<Prediction>>,
        webhook: Option<WebhookSender>,
        temp_files: Vec<std::path::PathBuf>,
        finished_tx: watch::Sender<bool>,
    ) {
        let (subscription, events) = self.supervisor.subscribe();

        let timed_out = Arc::new(AtomicBool::new(false));
        let handler = EventHandler::new(
            Arc::clone(&prediction),
            webhook,
            crate::files::OutputEncoder::new(self.config.upload_url.clone()),
            temp_files,
            Arc::clone(&timed_out),
        );
        let handler_task = tokio::spawn(handler.run(events));

        let watchdog = self.config.predict_timeout.map(|timeout| {
            let supervisor = Arc::clone(&self.supervisor);
            let timed_out = Arc::clone(&timed_out);
            let grace = self.cancel_grace;
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(prediction_id = %id, "Prediction timed out, cancelling");
                timed_out.store(true, Ordering::Release);
                supervisor.cancel();
                tokio::time::sleep(grace).await;
                tracing::error!(prediction_id = %id, "Prediction ignored cancellation, terminating worker");
                supervisor.terminate().await;
            })
        });

        let result = self.supervisor.predict(id.clone(), payload).await;

        // Dropping the subscription closes the handler's stream, which
        // covers paths where no Done was ever dispatched.
        self.supervisor.unsubscribe(subscription);
        if let Err(e) = handler_task.await {
            tracing::error!(prediction_id = %id, error = %e, "Prediction handler panicked");
            if let Ok(mut prediction) = prediction.lock()
                && !prediction.is_terminal()
            {
                prediction.set_failed("Prediction failed for an unknown reason.".to_string());
            }
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        match result {
            Ok(done) => {
                tracing::info!(
                    prediction_id = %id,
                    canceled = done.canceled,
                    error = done.error,
                    "Prediction finished"
                );
            }
            Err(WorkerError::Fatal(ref message)) | Err(WorkerError::Channel(ref message)) => {
                tracing::error!(prediction_id = %id, error = %message, "Worker failure during prediction");
                self.set_health(Health::Defunct);
                self.accepting.store(false, Ordering::Release);
            }
            Err(ref e) => {
                tracing::error!(prediction_id = %id, error = %e, "Prediction could not run");
            }
        }

        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
        let _ = finished_tx.send(true);
    }

    /// Cancel the current prediction iff its id matches. Non-blocking;
    /// cancellation is best-effort.
    pub fn cancel(&self, id: &str) -> bool {
        let matches = self
            .slot
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| h.id() == id))
            .unwrap_or(false);
        if matches {
            self.supervisor.cancel();
        }
        matches
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Cooperative shutdown: refuse new predictions, drain the slot, then
    /// shut the supervisor down.
    pub async fn shutdown(&self, timeout: Duration) {
        self.accepting.store(false, Ordering::Release);

        let handle = self.slot.lock().ok().and_then(|slot| slot.clone());
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle.wait()).await.is_err() {
                tracing::warn!("Prediction still in flight at shutdown deadline");
            }
        }

        self.supervisor.shutdown(timeout).await;
        self.set_health(Health::Defunct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::child_endpoint;
    use crate::ipc::protocol::{DoneEvent, LogSource, WorkerEvent, WorkerRequest};
    use crate::supervisor::SupervisorOptions;
    use serde_json::json;
    use tokio::net::UnixStream;

    fn fast_options() -> SupervisorOptions {
        SupervisorOptions {
            setup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }

    struct ChildScript {
        /// Delay before answering a prediction.
        delay: Duration,
        /// Whether Cancel messages finish the prediction as canceled.
        honor_cancel: bool,
        /// Whether to die (close the socket) instead of answering.
        die_on_predict: bool,
    }

    impl Default for ChildScript {
        fn default() -> Self {
            Self {
                delay: Duration::ZERO,
                honor_cancel: true,
                die_on_predict: false,
            }
        }
    }

    /// Scripted echo child for runner tests. Replies are spawned so a
    /// `Cancel` arriving mid-delay can settle the prediction first; the
    /// settled flag keeps exactly one `Done` per prediction.
    fn spawn_scripted_child(stream: UnixStream, script: ChildScript) {
        tokio::spawn(async move {
            let (writer, mut reader) = child_endpoint(stream);
            writer
                .send(WorkerEvent::Done(DoneEvent::ok()))
                .await
                .unwrap();

            let mut settled: Option<Arc<AtomicBool>> = None;
            loop {
                let request = match reader.next().await {
                    Some(Ok(request)) => request,
                    _ => return,
                };
                match request {
                    WorkerRequest::PredictionInput { id: _, payload } => {
                        if script.die_on_predict {
                            return;
                        }
                        let flag = Arc::new(AtomicBool::new(false));
                        settled = Some(Arc::clone(&flag));
                        let writer = writer.clone();
                        let delay = script.delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if !flag.swap(true, Ordering::AcqRel) {
                                let text = payload["text"].as_str().unwrap_or_default();
                                let _ = writer.send(WorkerEvent::OutputType { multi: false }).await;
                                let _ = writer
                                    .send(WorkerEvent::Output {
                                        payload: json!(format!("hello {text}")),
                                    })
                                    .await;
                                let _ = writer.send(WorkerEvent::Done(DoneEvent::ok())).await;
                            }
                        });
                    }
                    WorkerRequest::Cancel { .. } => {
                        if script.honor_cancel
                            && let Some(flag) = settled.as_ref()
                            && !flag.swap(true, Ordering::AcqRel)
                        {
                            let _ = writer
                                .send(WorkerEvent::Done(DoneEvent::canceled()))
                                .await;
                        }
                    }
                    WorkerRequest::Shutdown => return,
                }
            }
        });
    }

    async fn ready_runner(script: ChildScript) -> Arc<Runner> {
        let (parent, child) = UnixStream::pair().unwrap();
        spawn_scripted_child(child, script);
        let supervisor = crate::supervisor::WorkerSupervisor::attached(parent, fast_options());
        let runner = Runner::new(supervisor, RuntimeConfig::default());
        runner.setup().await.unwrap();
        runner
    }

    fn request_with_id(id: &str, input: serde_json::Value) -> PredictionRequest {
        PredictionRequest {
            id: Some(id.to_string()),
            input,
            ..PredictionRequest::default()
        }
    }

    #[tokio::test]
    async fn predict_runs_to_success() {
        let runner = ready_runner(ChildScript::default()).await;

        let handle = runner
            .predict(request_with_id("p1", json!({"text": "baz"})))
            .unwrap();
        handle.wait().await;

        let doc = handle.document();
        assert_eq!(doc["status"], "succeeded");
        assert_eq!(doc["output"], "hello baz");
        assert_eq!(doc["logs"], "");
        assert!(!runner.is_busy());
        assert_eq!(runner.health().status, Health::Ready);
    }

    #[tokio::test]
    async fn predict_not_ready_before_setup() {
        let (parent, _child) = UnixStream::pair().unwrap();
        let supervisor = crate::supervisor::WorkerSupervisor::attached(parent, fast_options());
        let runner = Runner::new(supervisor, RuntimeConfig::default());

        let err = runner
            .predict(request_with_id("p1", json!({})))
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotReady));
    }

    #[tokio::test]
    async fn slot_rejects_different_id_while_busy() {
        let runner = ready_runner(ChildScript {
            delay: Duration::from_millis(300),
            ..ChildScript::default()
        })
        .await;

        let first = runner.predict(request_with_id("x", json!({}))).unwrap();
        assert!(runner.is_busy());
        assert_eq!(runner.current_id().as_deref(), Some("x"));
        assert_eq!(runner.health().status, Health::Busy);

        let err = runner.predict(request_with_id("y", json!({}))).unwrap_err();
        match err {
            RunnerError::Busy { running_id } => assert_eq!(running_id, "x"),
            other => panic!("expected Busy, got {other:?}"),
        }

        first.wait().await;
        assert!(!runner.is_busy());
    }

    #[tokio::test]
    async fn same_id_retry_observes_existing_prediction() {
        let runner = ready_runner(ChildScript {
            delay: Duration::from_millis(300),
            ..ChildScript::default()
        })
        .await;

        let first = runner.predict(request_with_id("x", json!({}))).unwrap();
        let second = runner.predict(request_with_id("x", json!({}))).unwrap();

        // One prediction, not two.
        assert_eq!(first.id(), second.id());
        assert_eq!(second.document()["status"], "processing");

        first.wait().await;
        second.wait().await;
        assert_eq!(first.document(), second.document());
    }

    #[tokio::test]
    async fn serialized_predictions_run_back_to_back() {
        let runner = ready_runner(ChildScript::default()).await;

        for i in 0..3 {
            let handle = runner
                .predict(request_with_id(&format!("p{i}"), json!({"text": "t"})))
                .unwrap();
            handle.wait().await;
            assert_eq!(handle.document()["status"], "succeeded");
        }
    }

    #[tokio::test]
    async fn cancel_matches_current_id_only() {
        let runner = ready_runner(ChildScript {
            delay: Duration::from_millis(500),
            ..ChildScript::default()
        })
        .await;

        let handle = runner.predict(request_with_id("abc", json!({}))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!runner.cancel("other"));
        assert!(runner.cancel("abc"));

        handle.wait().await;
        assert_eq!(handle.document()["status"], "canceled");
        assert_eq!(runner.health().status, Health::Ready);
    }

    #[tokio::test]
    async fn worker_death_fails_prediction_and_goes_defunct() {
        let runner = ready_runner(ChildScript {
            die_on_predict: true,
            ..ChildScript::default()
        })
        .await;

        let handle = runner.predict(request_with_id("p1", json!({}))).unwrap();
        handle.wait().await;

        let doc = handle.document();
        assert_eq!(doc["status"], "failed");
        assert!(doc["error"].as_str().unwrap().contains("unknown reason"));

        assert_eq!(runner.health().status, Health::Defunct);
        let err = runner.predict(request_with_id("p2", json!({}))).unwrap_err();
        assert!(matches!(err, RunnerError::Defunct));
    }

    #[tokio::test]
    async fn timeout_cancels_then_fails_as_timed_out() {
        let (parent, child) = UnixStream::pair().unwrap();
        spawn_scripted_child(
            child,
            ChildScript {
                delay: Duration::from_secs(30),
                honor_cancel: false,
                ..ChildScript::default()
            },
        );
        let supervisor = crate::supervisor::WorkerSupervisor::attached(parent, fast_options());
        let config = RuntimeConfig {
            predict_timeout: Some(Duration::from_millis(100)),
            ..RuntimeConfig::default()
        };
        let runner = Runner::new(supervisor, config).with_cancel_grace(Duration::from_millis(100));
        runner.setup().await.unwrap();

        let handle = runner.predict(request_with_id("slow", json!({}))).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("timed-out prediction must still terminate");

        let doc = handle.document();
        assert_eq!(doc["status"], "failed");
        assert_eq!(doc["error"], "Prediction timed out");
        assert_eq!(runner.health().status, Health::Defunct);
    }

    #[tokio::test]
    async fn setup_failure_reported_in_health() {
        let (parent, child) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let (writer, _reader) = child_endpoint(child);
            writer
                .send(WorkerEvent::Log {
                    source: LogSource::Stderr,
                    message: "RuntimeError: boom\n".to_string(),
                })
                .await
                .unwrap();
            writer
                .send(WorkerEvent::Done(DoneEvent::failed("RuntimeError: boom")))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });
        let supervisor = crate::supervisor::WorkerSupervisor::attached(parent, fast_options());
        let runner = Runner::new(supervisor, RuntimeConfig::default());

        runner.setup().await.unwrap_err();

        let health = runner.health();
        assert_eq!(health.status, Health::SetupFailed);
        let setup = health.setup.unwrap();
        assert_eq!(setup.status, crate::health::SetupStatus::Failed);
        assert!(setup.error.unwrap().contains("boom"));
        assert!(setup.logs.contains("boom"));

        let err = runner.predict(request_with_id("p1", json!({}))).unwrap_err();
        assert!(matches!(err, RunnerError::SetupFailed));
    }

    #[tokio::test]
    async fn shutdown_waits_for_slot_then_goes_defunct() {
        let runner = ready_runner(ChildScript {
            delay: Duration::from_millis(200),
            ..ChildScript::default()
        })
        .await;

        let handle = runner.predict(request_with_id("p1", json!({}))).unwrap();
        runner.shutdown(Duration::from_secs(2)).await;

        assert!(handle.is_terminal());
        assert_eq!(handle.document()["status"], "succeeded");
        assert_eq!(runner.health().status, Health::Defunct);
        assert!(matches!(
            runner.predict(request_with_id("p2", json!({}))).unwrap_err(),
            RunnerError::Defunct
        ));
    }

    #[tokio::test]
    async fn generated_ids_are_prefixed() {
        let runner = ready_runner(ChildScript::default()).await;
        let handle = runner
            .predict(PredictionRequest {
                input: json!({"text": "x"}),
                ..PredictionRequest::default()
            })
            .unwrap();
        assert!(handle.id().starts_with("pred_"));
        handle.wait().await;
    }
}
