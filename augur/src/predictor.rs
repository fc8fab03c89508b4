//! The user-code contract: what a predictor implements and what the
//! worker hands it.

use tokio_util::sync::CancellationToken;

/// Setup phase errors.
///
/// These occur while loading or setting up the predictor, before any
/// prediction runs. They surface as SETUP_FAILED health, not as a
/// prediction failure.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Failed to construct the predictor at all.
    #[error("failed to load predictor: {message}")]
    Load { message: String },

    /// The setup routine failed.
    #[error("setup failed: {message}")]
    Setup { message: String },
}

impl SetupError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup {
            message: message.into(),
        }
    }
}

/// Why a prediction did not produce a normal output.
#[derive(Debug, thiserror::Error)]
pub enum PredictionFailure {
    /// The prediction observed its cancellation token.
    #[error("prediction canceled")]
    Canceled,

    /// The user function failed.
    #[error("{0}")]
    Failed(String),
}

/// Context handed to setup.
pub struct SetupContext {
    /// URL or path of the weights artifact, when configured.
    pub weights: Option<String>,
}

/// Context handed to each predict call.
///
/// User code is expected to watch the cancellation token at convenient
/// points; the worker also checks it between stream elements.
#[derive(Clone)]
pub struct PredictionContext {
    cancel: CancellationToken,
}

impl PredictionContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out with [`PredictionFailure::Canceled`] if cancellation has
    /// been requested. Intended for use with `?` inside loops.
    pub fn checkpoint(&self) -> Result<(), PredictionFailure> {
        if self.cancel.is_cancelled() {
            Err(PredictionFailure::Canceled)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// What a predict call produced.
pub enum PredictorOutput {
    /// One value, delivered whole.
    Value(serde_json::Value),
    /// A lazy stream of values, delivered one element at a time as the
    /// iterator yields them.
    Stream(Box<dyn Iterator<Item = Result<serde_json::Value, PredictionFailure>> + Send>),
}

impl PredictorOutput {
    /// Convenience constructor for an eager stream.
    pub fn stream_of(values: Vec<serde_json::Value>) -> Self {
        Self::Stream(Box::new(values.into_iter().map(Ok)))
    }
}

/// A user-defined predictor.
///
/// `setup` runs once in the child process before any prediction; `predict`
/// runs on a blocking thread, one call at a time.
pub trait Predictor: Send + Sync + 'static {
    fn setup(&mut self, ctx: &SetupContext) -> Result<(), SetupError>;

    fn predict(
        &self,
        input: serde_json::Value,
        ctx: &PredictionContext,
    ) -> Result<PredictorOutput, PredictionFailure>;

    /// JSON Schema for the input payload, used by the HTTP surface for
    /// request validation when provided.
    fn input_schema(&self) -> Option<serde_json::Value> {
        None
    }
}
