//! augur: a single-slot prediction worker runtime for ML model serving.
//!
//! An embedding binary supplies a [`Predictor`] and calls [`main_with`].
//! The process then runs in one of two roles:
//!
//! - **runtime** (default): serves the prediction HTTP API, supervises
//!   the worker subprocess, and delivers webhooks;
//! - **worker**: spawned by the runtime (current binary re-executed with
//!   the worker environment set), runs predictor setup and the
//!   prediction loop in isolation.
//!
//! ```no_run
//! use augur::{PredictionContext, PredictionFailure, Predictor, PredictorOutput,
//!             SetupContext, SetupError};
//!
//! struct Echo;
//!
//! impl Predictor for Echo {
//!     fn setup(&mut self, _ctx: &SetupContext) -> Result<(), SetupError> {
//!         Ok(())
//!     }
//!
//!     fn predict(
//!         &self,
//!         input: serde_json::Value,
//!         _ctx: &PredictionContext,
//!     ) -> Result<PredictorOutput, PredictionFailure> {
//!         let text = input["text"].as_str().unwrap_or_default();
//!         Ok(PredictorOutput::Value(serde_json::json!(format!("hello {text}"))))
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     augur::main_with(|| Ok(Echo))
//! }
//! ```

pub mod child;
pub mod config;
pub mod files;
pub mod handler;
pub mod health;
pub mod http;
pub mod ipc;
pub mod prediction;
pub mod predictor;
pub mod probes;
pub mod runner;
pub mod supervisor;
pub mod validation;
pub mod webhook;

use std::sync::Arc;

pub use config::RuntimeConfig;
pub use health::{Health, SetupResult, SetupStatus};
pub use prediction::{Prediction, PredictionOutput, PredictionStatus};
pub use predictor::{
    PredictionContext, PredictionFailure, Predictor, PredictorOutput, SetupContext, SetupError,
};
pub use runner::{PredictionHandle, PredictionRequest, Runner, RunnerError};
pub use supervisor::{
    CurrentExeSpawner, SupervisorOptions, WorkerError, WorkerSpawner, WorkerState, WorkerSupervisor,
};
pub use webhook::{WebhookConfig, WebhookEventType, WebhookSender};

/// Options for [`main_with_options`].
#[derive(Default)]
pub struct ServeOptions {
    pub server: http::ServerConfig,
    /// JSON Schema for the input payload; enables request validation.
    pub input_schema: Option<serde_json::Value>,
}

/// Run the runtime (or the worker role) with default options.
pub fn main_with<P, F>(factory: F) -> anyhow::Result<()>
where
    P: Predictor,
    F: FnOnce() -> Result<P, SetupError>,
{
    main_with_options(factory, ServeOptions::default())
}

/// Run the runtime (or the worker role).
///
/// Configuration is captured from the environment exactly once, here.
pub fn main_with_options<P, F>(factory: F, options: ServeOptions) -> anyhow::Result<()>
where
    P: Predictor,
    F: FnOnce() -> Result<P, SetupError>,
{
    let config = RuntimeConfig::from_env();

    if child::is_worker_process() {
        child::run_child(factory, &config)?;
        return Ok(());
    }

    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let probes = probes::ProbeHelper::new(&config);
        let validator = options
            .input_schema
            .as_ref()
            .and_then(validation::InputValidator::from_schema);

        let supervisor = WorkerSupervisor::new(
            Box::new(CurrentExeSpawner),
            SupervisorOptions::default(),
        );
        let runner = Runner::new(supervisor, config);
        let state = http::AppState::new(Arc::clone(&runner), validator, probes);

        // The HTTP surface comes up immediately and reports STARTING
        // until setup completes; setup failure leaves it serving
        // SETUP_FAILED so orchestration can observe and replace us.
        let setup_runner = Arc::clone(&runner);
        tokio::spawn(async move {
            if let Err(e) = setup_runner.setup().await {
                tracing::error!(error = %e, "Worker setup failed; serving unhealthy");
            }
        });

        http::serve(options.server, state).await
    })
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
