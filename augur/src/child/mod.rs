//! The predictor child process.
//!
//! Runs setup once, then a request loop that services one prediction at a
//! time: exactly one `OutputType`, the `Output`s, an interceptor drain,
//! then exactly one `Done` per prediction. Cancellation arrives either as
//! SIGUSR1 or as a `Cancel` message; both fire the in-flight prediction's
//! token, and the token is armed only while a prediction is running so a
//! stale cancel can never touch the next one.

pub mod interceptor;

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::ipc::channel::{self, EventWriter, IPC_SOCKET_ENV, child_endpoint};
use crate::ipc::protocol::{DoneEvent, WorkerEvent, WorkerRequest};
use crate::predictor::{
    PredictionContext, PredictionFailure, Predictor, PredictorOutput, SetupContext, SetupError,
};
use interceptor::{LogInterceptor, LogMessage};

/// Environment variable marking a process as the worker role.
pub const WORKER_ROLE_ENV: &str = "AUGUR_WORKER";

/// True when this process was spawned as the predictor child.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ROLE_ENV).is_some()
}

pub struct WorkerOptions {
    /// Capture stdout/stderr into `Log` events. Disabled only by embedders
    /// that run the loop inside an existing process (tests do this).
    pub capture_output: bool,
    /// Tee captured output through to the original descriptors.
    pub tee_output: bool,
    /// Weights reference handed to setup.
    pub weights: Option<String>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            capture_output: true,
            tee_output: true,
            weights: None,
        }
    }
}

type CancelSlot = Arc<StdMutex<Option<(String, CancellationToken)>>>;

/// Process entry for the worker role: connect back to the runtime and run
/// the loop until shutdown. Exits the process non-zero when the predictor
/// cannot even be constructed.
pub fn run_child<P, F>(factory: F, config: &RuntimeConfig) -> io::Result<()>
where
    P: Predictor,
    F: FnOnce() -> Result<P, SetupError>,
{
    // At a shell, SIGINT goes to the whole process group; shutdown is
    // coordinated by the runtime, so the child ignores it.
    #[cfg(unix)]
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGINT,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }

    let socket = std::env::var(IPC_SOCKET_ENV)
        .map_err(|_| io::Error::other(format!("{IPC_SOCKET_ENV} not set")))?;

    let predictor = match factory() {
        Ok(predictor) => predictor,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let options = WorkerOptions {
        capture_output: true,
        tee_output: config.tee_logs,
        weights: config.weights.clone(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let stream = channel::connect(Path::new(&socket)).await?;
        run_worker(predictor, stream, options).await
    })
}

/// Run the worker loop over an already-connected channel.
pub async fn run_worker<P: Predictor>(
    mut predictor: P,
    stream: UnixStream,
    options: WorkerOptions,
) -> io::Result<()> {
    let (event_writer, mut request_reader) = child_endpoint(stream);

    let (log_tx, mut log_rx) = mpsc::channel::<LogMessage>(5000);

    // Single writer task for captured logs; Done/Output go out directly
    // through the (mutex-guarded) shared writer.
    let log_writer = event_writer.clone();
    let log_forwarder = tokio::spawn(async move {
        while let Some(msg) = log_rx.recv().await {
            match msg {
                LogMessage::Event(event) => {
                    if log_writer.send(event).await.is_err() {
                        break;
                    }
                }
                LogMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    });

    let interceptor = if options.capture_output {
        Some(Arc::new(LogInterceptor::install(
            log_tx.clone(),
            options.tee_output,
        )?))
    } else {
        None
    };

    let cancel_slot: CancelSlot = Arc::new(StdMutex::new(None));
    let signal_task = spawn_cancel_signal_task(Arc::clone(&cancel_slot));

    // SETTING_UP
    tracing::info!("Worker starting setup");
    let setup_ctx = SetupContext {
        weights: options.weights.clone(),
    };
    let setup_result = tokio::task::spawn_blocking(move || {
        let result = predictor.setup(&setup_ctx);
        (predictor, result)
    })
    .await;

    let (predictor, setup_ok) = match setup_result {
        Ok((predictor, Ok(()))) => (Some(Arc::new(predictor)), true),
        Ok((predictor, Err(e))) => {
            tracing::error!(error = %e, "Setup failed");
            drain_quiet(&interceptor).await;
            event_writer
                .send(WorkerEvent::Done(DoneEvent::failed(e.to_string())))
                .await?;
            (Some(Arc::new(predictor)), false)
        }
        Err(join_err) => {
            tracing::error!(error = %join_err, "Setup panicked");
            drain_quiet(&interceptor).await;
            event_writer
                .send(WorkerEvent::Done(DoneEvent::failed(format!(
                    "setup panicked: {join_err}"
                ))))
                .await?;
            (None, false)
        }
    };

    if setup_ok {
        drain_quiet(&interceptor).await;
        event_writer
            .send(WorkerEvent::Done(DoneEvent::ok()))
            .await?;
        tracing::info!("Worker ready");
    }

    // WAITING / PREDICTING
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let mut busy = false;

    loop {
        tokio::select! {
            biased;

            // Completions drain first so a back-to-back prediction from
            // the runtime never races a stale busy flag.
            Some(()) = done_rx.recv() => {
                busy = false;
                if let Ok(mut slot) = cancel_slot.lock() {
                    *slot = None;
                }
            }

            request = request_reader.next() => {
                match request {
                    Some(Ok(WorkerRequest::PredictionInput { id, payload })) => {
                        if busy {
                            tracing::warn!(%id, "Prediction request while busy, ignoring");
                            continue;
                        }
                        let Some(predictor) = predictor.as_ref() else {
                            let _ = event_writer
                                .send(WorkerEvent::Done(DoneEvent::failed(
                                    "predictor is not available".to_string(),
                                )))
                                .await;
                            continue;
                        };
                        if !setup_ok {
                            let _ = event_writer
                                .send(WorkerEvent::Done(DoneEvent::failed(
                                    "predictor setup failed".to_string(),
                                )))
                                .await;
                            continue;
                        }

                        busy = true;
                        let token = CancellationToken::new();
                        if let Ok(mut slot) = cancel_slot.lock() {
                            *slot = Some((id.clone(), token.clone()));
                        }

                        tracing::debug!(%id, "Prediction starting");
                        tokio::spawn(run_prediction(
                            Arc::clone(predictor),
                            id,
                            payload,
                            token,
                            event_writer.clone(),
                            interceptor.clone(),
                            done_tx.clone(),
                        ));
                    }
                    Some(Ok(WorkerRequest::Cancel { id })) => {
                        match cancel_slot.lock() {
                            Ok(slot) => match slot.as_ref() {
                                Some((current, token)) if *current == id => token.cancel(),
                                _ => tracing::trace!(%id, "Cancel for inactive prediction, dropping"),
                            },
                            Err(_) => tracing::warn!("Cancel slot poisoned"),
                        }
                    }
                    Some(Ok(WorkerRequest::Shutdown)) => {
                        tracing::info!("Shutdown requested");
                        if busy {
                            // Let the in-flight prediction finish its Done.
                            let _ = done_rx.recv().await;
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Worker channel error");
                        break;
                    }
                    None => {
                        tracing::error!("Worker channel closed (runtime died?), exiting");
                        break;
                    }
                }
            }
        }
    }

    signal_task.abort();
    drain_quiet(&interceptor).await;
    if let Some(interceptor) = interceptor
        && let Ok(interceptor) = Arc::try_unwrap(interceptor)
    {
        interceptor.shutdown();
    }
    log_forwarder.abort();

    tracing::info!("Worker exiting");
    Ok(())
}

async fn drain_quiet(interceptor: &Option<Arc<LogInterceptor>>) {
    if let Some(interceptor) = interceptor {
        if let Err(e) = interceptor.drain().await {
            tracing::warn!(error = %e, "Failed to drain captured output");
        }
    }
}

#[cfg(unix)]
fn spawn_cancel_signal_task(cancel_slot: CancelSlot) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sig = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install cancellation signal handler");
                return;
            }
        };
        while sig.recv().await.is_some() {
            match cancel_slot.lock() {
                Ok(slot) => match slot.as_ref() {
                    Some((id, token)) => {
                        tracing::debug!(%id, "Cancellation signal received");
                        token.cancel();
                    }
                    // Between predictions: the signal is silently dropped.
                    None => tracing::trace!("Cancellation signal outside prediction, dropping"),
                },
                Err(_) => tracing::warn!("Cancel slot poisoned"),
            }
        }
    })
}

#[cfg(not(unix))]
fn spawn_cancel_signal_task(_cancel_slot: CancelSlot) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}

async fn run_prediction<P: Predictor>(
    predictor: Arc<P>,
    id: String,
    payload: serde_json::Value,
    token: CancellationToken,
    writer: EventWriter,
    interceptor: Option<Arc<LogInterceptor>>,
    done_tx: mpsc::Sender<()>,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let ctx = PredictionContext::new(token.clone());

    let blocking = tokio::task::spawn_blocking(move || {
        execute_prediction(predictor.as_ref(), payload, &ctx, &out_tx)
    });

    // Stream OutputType/Output to the socket as the predictor produces
    // them; the sender side closes when the blocking call returns.
    let forward_writer = writer.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            if forward_writer.send(event).await.is_err() {
                break;
            }
        }
    });

    let done = match blocking.await {
        Ok(done) => done,
        Err(join_err) => {
            tracing::error!(%id, error = %join_err, "Predictor panicked");
            if token.is_cancelled() {
                DoneEvent::canceled()
            } else {
                DoneEvent::failed(format!("prediction panicked: {join_err}"))
            }
        }
    };
    let _ = forwarder.await;

    // Logs written during the prediction reach the socket before Done.
    drain_quiet(&interceptor).await;

    tracing::debug!(%id, canceled = done.canceled, error = done.error, "Prediction finished");
    if let Err(e) = writer.send(WorkerEvent::Done(done)).await {
        tracing::error!(%id, error = %e, "Failed to send Done");
    }
    let _ = done_tx.send(()).await;
}

/// Runs on a blocking thread: calls user code and pushes output events.
///
/// Cancellation has priority over user errors: when the token fired, the
/// outcome is `canceled` even if user code surfaced an error while
/// unwinding.
fn execute_prediction<P: Predictor>(
    predictor: &P,
    payload: serde_json::Value,
    ctx: &PredictionContext,
    out_tx: &mpsc::UnboundedSender<WorkerEvent>,
) -> DoneEvent {
    match predictor.predict(payload, ctx) {
        Err(PredictionFailure::Canceled) => DoneEvent::canceled(),
        Err(PredictionFailure::Failed(message)) => {
            if ctx.is_canceled() {
                DoneEvent::canceled()
            } else {
                DoneEvent::failed(message)
            }
        }
        Ok(PredictorOutput::Value(value)) => {
            let _ = out_tx.send(WorkerEvent::OutputType { multi: false });
            let _ = out_tx.send(WorkerEvent::Output { payload: value });
            DoneEvent::ok()
        }
        Ok(PredictorOutput::Stream(iter)) => {
            let _ = out_tx.send(WorkerEvent::OutputType { multi: true });
            for item in iter {
                if ctx.is_canceled() {
                    return DoneEvent::canceled();
                }
                match item {
                    Ok(value) => {
                        let _ = out_tx.send(WorkerEvent::Output { payload: value });
                    }
                    Err(PredictionFailure::Canceled) => return DoneEvent::canceled(),
                    Err(PredictionFailure::Failed(message)) => {
                        if ctx.is_canceled() {
                            return DoneEvent::canceled();
                        }
                        return DoneEvent::failed(message);
                    }
                }
            }
            DoneEvent::ok()
        }
    }
}
