//! Prediction state tracking.
//!
//! One `Prediction` is the live response document for one unit of work.
//! Terminal transitions are one-shot: once the status is terminal every
//! further mutation is a no-op, and `started_at`/`completed_at` are each
//! set exactly once.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Prediction output - a single value, or an append-only stream of values.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(serde_json::Value),
    Stream(Vec<serde_json::Value>),
}

/// The live response document for one prediction.
#[derive(Debug)]
pub struct Prediction {
    id: String,
    input: serde_json::Value,
    status: PredictionStatus,
    output: Option<PredictionOutput>,
    logs: String,
    error: Option<String>,
    metrics: HashMap<String, serde_json::Value>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Prediction {
    pub fn new(id: String, input: serde_json::Value) -> Self {
        Self {
            id,
            input,
            status: PredictionStatus::Starting,
            output: None,
            logs: String::new(),
            error: None,
            metrics: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> PredictionStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn logs(&self) -> &str {
        &self.logs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn output(&self) -> Option<&PredictionOutput> {
        self.output.as_ref()
    }

    pub fn set_processing(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = PredictionStatus::Processing;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn append_log(&mut self, data: &str) {
        if self.is_terminal() {
            return;
        }
        self.logs.push_str(data);
    }

    /// Initialize the output shape, from the `OutputType` event.
    ///
    /// Stream outputs start as an empty list so that a zero-element stream
    /// still yields `output = []`; single outputs stay unset until the one
    /// `Output` arrives.
    pub fn init_output(&mut self, multi: bool) {
        if self.is_terminal() || self.output.is_some() {
            return;
        }
        if multi {
            self.output = Some(PredictionOutput::Stream(Vec::new()));
        }
    }

    /// Record one output value: appends for streams, sets for singles.
    pub fn push_output(&mut self, value: serde_json::Value) {
        if self.is_terminal() {
            return;
        }
        match &mut self.output {
            Some(PredictionOutput::Stream(values)) => values.push(value),
            _ => self.output = Some(PredictionOutput::Single(value)),
        }
    }

    pub fn set_metric(&mut self, name: String, value: serde_json::Value) {
        if self.is_terminal() {
            return;
        }
        self.metrics.insert(name, value);
    }

    pub fn set_succeeded(&mut self) {
        self.complete(PredictionStatus::Succeeded);
    }

    pub fn set_failed(&mut self, error: String) {
        if self.is_terminal() {
            tracing::debug!(id = %self.id, "Ignoring failure for terminal prediction");
            return;
        }
        self.error = Some(error);
        self.complete(PredictionStatus::Failed);
    }

    /// Cancellation preserves any output emitted before the signal landed.
    pub fn set_canceled(&mut self) {
        self.complete(PredictionStatus::Canceled);
    }

    fn complete(&mut self, status: PredictionStatus) {
        if self.is_terminal() {
            tracing::debug!(
                id = %self.id,
                current = self.status.as_str(),
                attempted = status.as_str(),
                "Ignoring status change on terminal prediction"
            );
            return;
        }
        self.status = status;
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Seconds spent predicting, available once terminal.
    pub fn predict_time(&self) -> Option<f64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_microseconds().unwrap_or(0) as f64 / 1e6)
    }

    /// Render the response document shared by the HTTP surface and the
    /// webhook payloads.
    pub fn to_document(&self) -> serde_json::Value {
        let mut doc = serde_json::json!({
            "id": self.id,
            "status": self.status.as_str(),
            "input": self.input,
            "logs": self.logs,
            "created_at": self.created_at.to_rfc3339(),
        });

        if let Some(started_at) = self.started_at {
            doc["started_at"] = serde_json::json!(started_at.to_rfc3339());
        }
        if let Some(completed_at) = self.completed_at {
            doc["completed_at"] = serde_json::json!(completed_at.to_rfc3339());
        }
        if let Some(ref output) = self.output {
            doc["output"] = serde_json::to_value(output).unwrap_or(serde_json::Value::Null);
        }
        if let Some(ref error) = self.error {
            doc["error"] = serde_json::json!(error);
        }

        // User metrics plus predict_time on terminal documents;
        // predict_time is authoritative on conflict.
        if !self.metrics.is_empty() || self.is_terminal() {
            let mut metrics = serde_json::Map::new();
            for (k, v) in &self.metrics {
                metrics.insert(k.clone(), v.clone());
            }
            if let Some(predict_time) = self.predict_time() {
                metrics.insert("predict_time".to_string(), serde_json::json!(predict_time));
            }
            doc["metrics"] = serde_json::Value::Object(metrics);
        }

        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_is_terminal() {
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
        assert!(PredictionStatus::Succeeded.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
        assert!(PredictionStatus::Canceled.is_terminal());
    }

    #[test]
    fn new_prediction_is_starting() {
        let pred = Prediction::new("p1".to_string(), json!({"text": "hi"}));
        assert_eq!(pred.status(), PredictionStatus::Starting);
        assert_eq!(pred.id(), "p1");
        assert!(pred.output().is_none());
    }

    #[test]
    fn set_processing_stamps_started_at_once() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.set_processing();
        let first = pred.started_at;
        assert!(first.is_some());

        pred.set_processing();
        assert_eq!(pred.started_at, first);
    }

    #[test]
    fn terminal_status_is_monotone() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.set_processing();
        pred.set_canceled();
        assert_eq!(pred.status(), PredictionStatus::Canceled);
        let completed = pred.completed_at;

        // Late mutations after terminal are defensive no-ops.
        pred.set_failed("late error".to_string());
        pred.set_succeeded();
        pred.append_log("late log\n");
        pred.push_output(json!("late"));

        assert_eq!(pred.status(), PredictionStatus::Canceled);
        assert_eq!(pred.completed_at, completed);
        assert!(pred.error().is_none());
        assert_eq!(pred.logs(), "");
        assert!(pred.output().is_none());
    }

    #[test]
    fn single_output() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.init_output(false);
        assert!(pred.output().is_none());

        pred.push_output(json!("hello baz"));
        match pred.output().unwrap() {
            PredictionOutput::Single(v) => assert_eq!(v, &json!("hello baz")),
            other => panic!("wrong shape: {other:?}"),
        }
    }

    #[test]
    fn stream_output_is_prefix_monotone() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.init_output(true);

        let mut observed: Vec<Vec<i64>> = Vec::new();
        for i in 0..5 {
            pred.push_output(json!(i));
            match pred.output().unwrap() {
                PredictionOutput::Stream(values) => {
                    observed.push(values.iter().map(|v| v.as_i64().unwrap()).collect());
                }
                other => panic!("wrong shape: {other:?}"),
            }
        }

        for pair in observed.windows(2) {
            assert!(pair[1].starts_with(&pair[0]), "not prefix-monotone: {observed:?}");
        }
        assert_eq!(observed.last().unwrap(), &vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_stream_renders_empty_list() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.set_processing();
        pred.init_output(true);
        pred.set_succeeded();

        let doc = pred.to_document();
        assert_eq!(doc["output"], json!([]));
    }

    #[test]
    fn empty_single_output_stays_unset() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.set_processing();
        pred.init_output(false);
        pred.set_succeeded();

        let doc = pred.to_document();
        assert!(doc.get("output").is_none());
    }

    #[test]
    fn cancellation_preserves_emitted_output() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.set_processing();
        pred.init_output(true);
        pred.push_output(json!(0));
        pred.push_output(json!(1));
        pred.set_canceled();

        let doc = pred.to_document();
        assert_eq!(doc["status"], "canceled");
        assert_eq!(doc["output"], json!([0, 1]));
    }

    #[test]
    fn document_includes_metrics_with_predict_time() {
        let mut pred = Prediction::new("p1".to_string(), json!({"x": 1}));
        pred.set_processing();
        pred.set_metric("tokens".to_string(), json!(42));
        // A user metric named predict_time loses to the measured value.
        pred.set_metric("predict_time".to_string(), json!(999.0));
        pred.set_succeeded();

        let doc = pred.to_document();
        assert_eq!(doc["metrics"]["tokens"], json!(42));
        let predict_time = doc["metrics"]["predict_time"].as_f64().unwrap();
        assert!(predict_time < 10.0, "measured predict_time expected, got {predict_time}");
        assert!(doc["completed_at"].is_string());
    }

    #[test]
    fn failed_document_carries_error() {
        let mut pred = Prediction::new("p1".to_string(), json!({}));
        pred.set_processing();
        pred.append_log("step 1\n");
        pred.set_failed("ValueError: boom".to_string());

        let doc = pred.to_document();
        assert_eq!(doc["status"], "failed");
        assert_eq!(doc["error"], "ValueError: boom");
        assert_eq!(doc["logs"], "step 1\n");
        assert_eq!(doc["input"], json!({}));
    }
}
