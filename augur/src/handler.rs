//! Per-prediction event handling.
//!
//! One `EventHandler` per prediction consumes the supervisor's event
//! stream, maintains the live response document, encodes outputs (file
//! leaves become uploads or data URLs), and offers every state change to
//! the webhook sender. Terminal processing sets the final status, starts
//! the terminal webhook dispatch, and unlinks temp files.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use crate::files::OutputEncoder;
use crate::ipc::protocol::{DoneEvent, WorkerEvent};
use crate::prediction::Prediction;
use crate::webhook::{WebhookEventType, WebhookSender};

pub struct EventHandler {
    prediction: Arc<StdMutex<Prediction>>,
    webhook: Option<Arc<WebhookSender>>,
    encoder: OutputEncoder,
    /// Temp files from input materialization, unlinked after terminal.
    cleanup_files: Vec<PathBuf>,
    /// Set by the runner's watchdog; overrides the terminal status with
    /// a timeout failure.
    timed_out: Arc<AtomicBool>,
}

impl EventHandler {
    pub fn new(
        prediction: Arc<StdMutex<Prediction>>,
        webhook: Option<WebhookSender>,
        encoder: OutputEncoder,
        cleanup_files: Vec<PathBuf>,
        timed_out: Arc<AtomicBool>,
    ) -> Self {
        Self {
            prediction,
            webhook: webhook.map(Arc::new),
            encoder,
            cleanup_files,
            timed_out,
        }
    }

    /// Consume events until the terminal `Done` has been processed.
    ///
    /// The supervisor synthesizes a failure `Done` on fatal errors, so
    /// this normally ends through `Done`; a closed stream without one is
    /// handled as a failure anyway.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        self.offer(WebhookEventType::Start);

        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Log { message, .. } => {
                    if let Ok(mut prediction) = self.prediction.lock() {
                        prediction.append_log(&message);
                    }
                    self.offer(WebhookEventType::Logs);
                }
                WorkerEvent::OutputType { multi } => {
                    if let Ok(mut prediction) = self.prediction.lock() {
                        prediction.init_output(multi);
                    }
                }
                WorkerEvent::Output { payload } => {
                    let encoded = self.encoder.encode(&payload).await;
                    if let Ok(mut prediction) = self.prediction.lock() {
                        prediction.push_output(encoded);
                    }
                    self.offer(WebhookEventType::Output);
                }
                WorkerEvent::Heartbeat => {
                    // No state change; may flush a throttled update.
                    self.offer(WebhookEventType::Logs);
                }
                WorkerEvent::Done(done) => {
                    self.finish(done).await;
                    return;
                }
            }
        }

        tracing::warn!("Prediction event stream ended without Done");
        self.finish(DoneEvent::failed(
            "Prediction failed for an unknown reason.".to_string(),
        ))
        .await;
    }

    fn offer(&self, event: WebhookEventType) {
        if let Some(ref webhook) = self.webhook {
            let document = match self.prediction.lock() {
                Ok(prediction) => prediction.to_document(),
                Err(_) => return,
            };
            webhook.send(event, &document);
        }
    }

    async fn finish(mut self, done: DoneEvent) {
        if let Ok(mut prediction) = self.prediction.lock() {
            if self.timed_out.load(Ordering::Acquire) {
                prediction.set_failed("Prediction timed out".to_string());
            } else if done.canceled {
                prediction.set_canceled();
            } else if done.error {
                prediction.set_failed(done.error_detail);
            } else {
                prediction.set_succeeded();
            }
        }

        // Dispatch initiation happens here; delivery may keep retrying in
        // the background while the slot is released.
        if let Some(webhook) = self.webhook.take() {
            let document = self
                .prediction
                .lock()
                .map(|p| p.to_document())
                .unwrap_or(serde_json::Value::Null);
            tokio::spawn(async move {
                webhook.send_terminal(&document).await;
            });
        }

        let mut files = std::mem::take(&mut self.cleanup_files);
        files.extend(self.encoder.take_encountered());
        cleanup_temp_files(&files);
    }
}

/// Unlink temp files owned by this prediction. Only paths under the
/// system temp dir are touched; anything else belongs to the user.
fn cleanup_temp_files(paths: &[PathBuf]) {
    let temp_root = std::env::temp_dir();
    for path in paths {
        if !path.starts_with(&temp_root) {
            continue;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::trace!(path = %path.display(), "Removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
        }
    }
}
