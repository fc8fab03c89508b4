//! Webhook sender for prediction state updates.
//!
//! - Event filtering (start, output, logs, completed)
//! - Throttling between non-terminal sends (default 500ms)
//! - Terminal sends retried with exponential backoff, honoring Retry-After
//! - Bearer authentication and a runtime user-agent on every request

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;

const USER_AGENT: &str = concat!("augur/", env!("CARGO_PKG_VERSION"));

/// Per-attempt timeout for fire-and-forget non-terminal sends.
const NON_TERMINAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-attempt timeout for terminal sends, which retry persistently.
const TERMINAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEventType {
    Start,
    Output,
    Logs,
    #[default]
    Completed,
}

impl WebhookEventType {
    /// Only `completed` offers carry a terminal status; the handler never
    /// classifies a non-terminal document as completed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn all() -> HashSet<WebhookEventType> {
        [Self::Start, Self::Output, Self::Logs, Self::Completed]
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub response_interval: Duration,
    pub skip_start_event: bool,
    pub auth_token: Option<String>,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            response_interval: Duration::from_millis(500),
            skip_start_event: false,
            auth_token: None,
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

impl WebhookConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            response_interval: config.webhook_interval,
            skip_start_event: config.skip_start_event,
            auth_token: config.webhook_auth_token.clone(),
            ..Self::default()
        }
    }
}

/// One sender per prediction; throttle state is local to the instance.
pub struct WebhookSender {
    url: String,
    events_filter: HashSet<WebhookEventType>,
    config: WebhookConfig,
    client: reqwest::Client,
    retry_client: reqwest::Client,
    last_sent: Mutex<Instant>,
}

impl WebhookSender {
    pub fn new(
        url: String,
        events_filter: HashSet<WebhookEventType>,
        config: WebhookConfig,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Some(ref token) = config.auth_token
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        if let Ok(value) = reqwest::header::HeaderValue::from_str(USER_AGENT) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers.clone())
            .timeout(NON_TERMINAL_TIMEOUT)
            .build()?;
        let retry_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(TERMINAL_ATTEMPT_TIMEOUT)
            .build()?;

        Ok(Self {
            url,
            events_filter,
            config,
            client,
            retry_client,
            // Allow an immediate first send.
            last_sent: Mutex::new(Instant::now() - Duration::from_secs(10)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn should_send(&self, event: WebhookEventType) -> bool {
        if !self.events_filter.contains(&event) {
            return false;
        }
        if event == WebhookEventType::Start && self.config.skip_start_event {
            return false;
        }
        if event.is_terminal() {
            return true;
        }

        match self.last_sent.lock() {
            Ok(last) => last.elapsed() >= self.config.response_interval,
            Err(_) => false,
        }
    }

    fn update_last_sent(&self) {
        if let Ok(mut last) = self.last_sent.lock() {
            *last = Instant::now();
        }
    }

    /// Offer a non-terminal update: filtered, throttled, fire-and-forget.
    /// Transport errors are logged and dropped.
    pub fn send(&self, event: WebhookEventType, payload: &serde_json::Value) {
        if !self.should_send(event) {
            return;
        }

        let request = self.client.post(&self.url).json(payload);
        self.update_last_sent();

        tokio::spawn(async move {
            if let Err(e) = request.send().await {
                tracing::warn!(error = %e, "Failed to send webhook (non-terminal)");
            }
        });
    }

    /// Send the terminal update with persistent retry.
    ///
    /// Bypasses the throttle, retries transient statuses with exponential
    /// backoff (honoring `Retry-After` when present), and gives up after
    /// the configured attempt budget.
    pub async fn send_terminal(&self, payload: &serde_json::Value) {
        if !self.events_filter.contains(&WebhookEventType::Completed) {
            return;
        }

        let mut attempt = 0u32;
        loop {
            match self.retry_client.post(&self.url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if response.status().is_success() {
                        tracing::debug!(status, "Terminal webhook sent");
                        return;
                    }

                    if !self.config.retry_status_codes.contains(&status) {
                        tracing::error!(status, "Terminal webhook failed with non-retryable status");
                        return;
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(status, attempts = attempt, "Terminal webhook failed after max retries");
                        return;
                    }

                    let backoff = self.backoff_for(attempt, retry_after(&response));
                    tracing::warn!(
                        status,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "Terminal webhook failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(error = %e, attempts = attempt, "Terminal webhook failed after max retries");
                        return;
                    }

                    let backoff = self.backoff_for(attempt, None);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "Terminal webhook request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Send the terminal update from a context without an async runtime
    /// (process teardown). Same filter and retry policy, blocking HTTP.
    pub fn send_terminal_sync(&self, payload: &serde_json::Value) {
        if !self.events_filter.contains(&WebhookEventType::Completed) {
            return;
        }

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(TERMINAL_ATTEMPT_TIMEOUT))
            .build()
            .new_agent();

        let auth_header = self
            .config
            .auth_token
            .as_ref()
            .map(|token| format!("Bearer {token}"));

        let mut attempt = 0u32;
        loop {
            let mut request = agent
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("User-Agent", USER_AGENT);
            if let Some(ref auth) = auth_header {
                request = request.header("Authorization", auth);
            }

            match request.send_json(payload) {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        return;
                    }

                    if !self.config.retry_status_codes.contains(&status) {
                        tracing::error!(status, "Terminal webhook (sync) failed with non-retryable status");
                        return;
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(status, attempts = attempt, "Terminal webhook (sync) failed after max retries");
                        return;
                    }
                    std::thread::sleep(self.backoff_for(attempt, None));
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(error = %e, attempts = attempt, "Terminal webhook (sync) failed after max retries");
                        return;
                    }
                    std::thread::sleep(self.backoff_for(attempt, None));
                }
            }
        }
    }

    fn backoff_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.config.backoff_base * (1 << attempt.min(10));
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> WebhookConfig {
        WebhookConfig {
            response_interval: Duration::ZERO,
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn sender(url: String, config: WebhookConfig) -> WebhookSender {
        WebhookSender::new(url, WebhookEventType::all(), config).unwrap()
    }

    #[test]
    fn config_defaults() {
        let config = WebhookConfig::default();
        assert_eq!(config.response_interval, Duration::from_millis(500));
        assert_eq!(config.max_retries, 12);
        assert_eq!(config.retry_status_codes, vec![429, 500, 502, 503, 504]);
        assert!(!config.skip_start_event);
    }

    #[test]
    fn config_from_runtime_captures_interval_and_token() {
        let runtime = RuntimeConfig {
            webhook_interval: Duration::from_millis(50),
            skip_start_event: true,
            webhook_auth_token: Some("secret".to_string()),
            ..RuntimeConfig::default()
        };
        let config = WebhookConfig::from_runtime(&runtime);
        assert_eq!(config.response_interval, Duration::from_millis(50));
        assert!(config.skip_start_event);
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn event_terminality() {
        assert!(!WebhookEventType::Start.is_terminal());
        assert!(!WebhookEventType::Output.is_terminal());
        assert!(!WebhookEventType::Logs.is_terminal());
        assert!(WebhookEventType::Completed.is_terminal());
    }

    #[tokio::test]
    async fn send_terminal_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender(format!("{}/webhook", server.uri()), test_config());
        sender
            .send_terminal(&serde_json::json!({"id": "p1", "status": "succeeded"}))
            .await;
    }

    #[tokio::test]
    async fn send_terminal_attaches_auth_and_user_agent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .and(header("authorization", "Bearer sesame"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = WebhookConfig {
            auth_token: Some("sesame".to_string()),
            ..test_config()
        };
        let sender = sender(format!("{}/webhook", server.uri()), config);
        sender
            .send_terminal(&serde_json::json!({"status": "succeeded"}))
            .await;
    }

    #[tokio::test]
    async fn send_terminal_retries_on_503_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender(format!("{}/webhook", server.uri()), test_config());
        sender
            .send_terminal(&serde_json::json!({"status": "succeeded"}))
            .await;
    }

    #[tokio::test]
    async fn send_terminal_honors_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender(format!("{}/webhook", server.uri()), test_config());
        sender
            .send_terminal(&serde_json::json!({"status": "succeeded"}))
            .await;
    }

    #[tokio::test]
    async fn send_terminal_no_retry_on_400() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender(format!("{}/webhook", server.uri()), test_config());
        sender
            .send_terminal(&serde_json::json!({"status": "failed"}))
            .await;
    }

    #[tokio::test]
    async fn send_terminal_respects_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let sender = WebhookSender::new(
            format!("{}/webhook", server.uri()),
            [WebhookEventType::Start].into_iter().collect(),
            test_config(),
        )
        .unwrap();
        sender
            .send_terminal(&serde_json::json!({"status": "succeeded"}))
            .await;
    }

    #[tokio::test]
    async fn send_non_terminal_fires_and_forgets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender(format!("{}/webhook", server.uri()), test_config());
        sender.send(
            WebhookEventType::Output,
            &serde_json::json!({"status": "processing"}),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn send_non_terminal_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = WebhookConfig {
            response_interval: Duration::from_secs(10),
            ..test_config()
        };
        let sender = sender(format!("{}/webhook", server.uri()), config);

        sender.send(WebhookEventType::Output, &serde_json::json!({"output": "1"}));
        // Second send lands inside the throttle window and is dropped.
        sender.send(WebhookEventType::Output, &serde_json::json!({"output": "2"}));

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn start_event_suppressed_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = WebhookConfig {
            skip_start_event: true,
            ..test_config()
        };
        let sender = sender(format!("{}/webhook", server.uri()), config);
        sender.send(WebhookEventType::Start, &serde_json::json!({"status": "processing"}));

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn terminal_bypasses_throttle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let config = WebhookConfig {
            response_interval: Duration::from_secs(10),
            ..test_config()
        };
        let sender = sender(format!("{}/webhook", server.uri()), config);

        // Non-terminal consumes the throttle window...
        sender.send(WebhookEventType::Output, &serde_json::json!({"output": "1"}));
        // ...and the terminal send still goes out immediately.
        sender
            .send_terminal(&serde_json::json!({"status": "succeeded"}))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn send_terminal_sync_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = sender(format!("{}/webhook", server.uri()), test_config());
        let handle = tokio::task::spawn_blocking(move || {
            sender.send_terminal_sync(&serde_json::json!({"id": "p1", "status": "succeeded"}));
        });
        handle.await.unwrap();
    }
}
