//! Runtime configuration.
//!
//! The environment is read exactly once, at construction; nothing else in
//! the runtime consults env vars at request time.

use std::path::PathBuf;
use std::time::Duration;

/// Default minimum gap between non-terminal webhook sends.
const DEFAULT_WEBHOOK_INTERVAL: Duration = Duration::from_millis(500);

/// Throttle intervals under this suppress the `start` webhook so output
/// reaches latency-sensitive callers sooner.
const SKIP_START_THRESHOLD: Duration = Duration::from_millis(100);

/// Immutable runtime configuration, captured from the environment once at
/// startup and passed down by reference.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Minimum gap between non-terminal webhook sends
    /// (`COG_THROTTLE_RESPONSE_INTERVAL`, seconds).
    pub webhook_interval: Duration,
    /// Suppress the `start` webhook event (interval tuned below 100ms).
    pub skip_start_event: bool,
    /// Bearer token attached to every webhook request (`WEBHOOK_AUTH_TOKEN`).
    pub webhook_auth_token: Option<String>,
    /// URL or path handed to the predictor's setup (`COG_WEIGHTS`).
    pub weights: Option<String>,
    /// Upload URL prefix for file-typed outputs (`AUGUR_UPLOAD_URL`).
    /// When unset, file outputs are inlined as data URLs.
    pub upload_url: Option<String>,
    /// Wall-clock bound on a single prediction (`AUGUR_PREDICT_TIMEOUT`,
    /// seconds). Exceeding it cancels, then force-terminates the worker.
    pub predict_timeout: Option<Duration>,
    /// Runtime state directory for orchestration probes (`AUGUR_STATE_DIR`).
    pub state_dir: PathBuf,
    /// Whether captured predictor output is also written through to the
    /// original stdout/stderr (`AUGUR_TEE_LOGS`, default true).
    pub tee_logs: bool,
    /// Running under an orchestrator (`KUBERNETES_SERVICE_HOST` present).
    pub under_orchestrator: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            webhook_interval: DEFAULT_WEBHOOK_INTERVAL,
            skip_start_event: false,
            webhook_auth_token: None,
            weights: None,
            upload_url: None,
            predict_timeout: None,
            state_dir: PathBuf::from("/var/run/augur"),
            tee_logs: true,
            under_orchestrator: false,
        }
    }
}

impl RuntimeConfig {
    /// Capture configuration from the environment.
    pub fn from_env() -> Self {
        let webhook_interval = std::env::var("COG_THROTTLE_RESPONSE_INTERVAL")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_WEBHOOK_INTERVAL);

        let predict_timeout = std::env::var("AUGUR_PREDICT_TIMEOUT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs);

        let state_dir = std::env::var("AUGUR_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/run/augur"));

        let tee_logs = std::env::var("AUGUR_TEE_LOGS")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        Self {
            skip_start_event: webhook_interval < SKIP_START_THRESHOLD,
            webhook_interval,
            webhook_auth_token: std::env::var("WEBHOOK_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            weights: std::env::var("COG_WEIGHTS").ok().filter(|w| !w.is_empty()),
            upload_url: std::env::var("AUGUR_UPLOAD_URL").ok().filter(|u| !u.is_empty()),
            predict_timeout,
            state_dir,
            tee_logs,
            under_orchestrator: std::env::var("KUBERNETES_SERVICE_HOST").is_ok(),
        }
    }
}
