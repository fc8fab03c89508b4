//! Wire protocol for runtime-worker communication.
//!
//! A single full-duplex channel carries `WorkerRequest` (parent to child)
//! and `WorkerEvent` (child to parent). One prediction produces the event
//! sequence `OutputType, Output*, Done`, interleaved with `Log`s.

use serde::{Deserialize, Serialize};

/// Messages from the runtime to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Run a prediction.
    PredictionInput {
        /// Unique prediction ID.
        id: String,
        /// Input payload (validated JSON object).
        payload: serde_json::Value,
    },

    /// Cancel the prediction with this ID, if it is the one in flight.
    Cancel {
        /// ID of the prediction to cancel.
        id: String,
    },

    /// Graceful shutdown - finish current work, drain logs, and exit.
    Shutdown,
}

/// Messages from the worker to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A captured line of predictor output.
    Log {
        /// Which stream the line was written to.
        source: LogSource,
        /// Log data, newline-terminated except for drained partial lines.
        message: String,
    },

    /// Declares the output shape for the current prediction.
    ///
    /// Sent exactly once per prediction, before any `Output`.
    /// `multi` is true iff the predictor returned a lazy sequence.
    OutputType {
        /// Whether output arrives as a stream of elements.
        multi: bool,
    },

    /// One output value: the whole output when `multi` is false, one
    /// element of the stream when it is true.
    Output {
        /// The output value. File leaves travel as `file://` URL strings.
        payload: serde_json::Value,
    },

    /// Terminal event for setup or a prediction.
    Done(DoneEvent),

    /// Synthesized by the supervisor during idle polling; never sent by
    /// the worker itself.
    Heartbeat,
}

/// Completion record carried by [`WorkerEvent::Done`].
///
/// `canceled` wins over `error`: a prediction interrupted by cancellation
/// reports `canceled: true` even if user code surfaced an error while
/// unwinding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEvent {
    /// A cancellation signal interrupted the work.
    #[serde(default)]
    pub canceled: bool,
    /// The user function failed (and was not canceled).
    #[serde(default)]
    pub error: bool,
    /// Error message when `error` is true.
    #[serde(default)]
    pub error_detail: String,
}

impl DoneEvent {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn canceled() -> Self {
        Self {
            canceled: true,
            ..Self::default()
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            error: true,
            error_detail: detail.into(),
            ..Self::default()
        }
    }
}

/// Stream a captured log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
}
