//! Streaming driver: runs `POST /build` and folds the SSE response into a
//! [`BuildState`] published on a watch channel.
//!
//! Each network chunk is decoded and applied in one `send_modify`, so
//! subscribers never see half of a chunk's events. Cancelling drops the
//! in-flight read; anything decoded after the cancel is discarded because the
//! state has already left `Building`.

use super::{BuildPhase, BuildState};
use crate::protocol::SseDecoder;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for a running gateway.
#[derive(Clone)]
pub struct BuildClient {
    http: reqwest::Client,
    base_url: String,
}

impl BuildClient {
    pub fn new(base_url: &str) -> Result<Self> {
        // No overall timeout: a build stream stays open for minutes.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Start a build and return a handle to its live state.
    pub fn start_build(&self, prompt: &str, sandbox_id: Option<&str>) -> BuildSession {
        let mut initial = BuildState::new();
        initial.begin();
        let (sender, receiver) = watch::channel(initial);
        let state = Arc::new(sender);
        let cancel = CancellationToken::new();

        let mut body = json!({ "prompt": prompt });
        if let Some(id) = sandbox_id {
            body["sandboxId"] = Value::String(id.to_string());
        }

        let request = self.http.post(format!("{}/build", self.base_url)).json(&body);
        let task = tokio::spawn(drive(request, Arc::clone(&state), cancel.clone()));

        BuildSession {
            state,
            receiver,
            cancel,
            task,
        }
    }

    /// Ask the gateway to stop a sandbox.
    pub async fn stop_sandbox(&self, sandbox_id: &str) -> Result<()> {
        self.http
            .post(format!("{}/stop", self.base_url))
            .json(&json!({ "sandboxId": sandbox_id }))
            .send()
            .await
            .context("stop request failed")?
            .error_for_status()
            .context("gateway rejected stop request")?;
        Ok(())
    }
}

/// A build in flight.
pub struct BuildSession {
    state: Arc<watch::Sender<BuildState>>,
    receiver: watch::Receiver<BuildState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BuildSession {
    /// Abort the request. A build that already ended keeps its outcome.
    pub fn cancel(&self) {
        self.state.send_if_modified(BuildState::cancel);
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> watch::Receiver<BuildState> {
        self.receiver.clone()
    }

    pub fn snapshot(&self) -> BuildState {
        self.receiver.borrow().clone()
    }

    /// Wait for the driver to finish and return the final state.
    pub async fn finished(self) -> BuildState {
        if let Err(e) = self.task.await {
            tracing::warn!("Build stream task ended abnormally: {e}");
            self.state.send_if_modified(|s| s.fail_locally("build stream task failed"));
        }
        self.receiver.borrow().clone()
    }
}

async fn drive(
    request: reqwest::RequestBuilder,
    state: Arc<watch::Sender<BuildState>>,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!("Build stream cancelled");
            state.send_if_modified(BuildState::cancel);
            return;
        }
        outcome = read_stream(request, &state) => outcome,
    };

    if let Err(e) = outcome {
        let message = format!("{e:#}");
        tracing::warn!("Build stream failed: {message}");
        state.send_if_modified(|s| s.fail_locally(&message));
    }
}

async fn read_stream(
    request: reqwest::RequestBuilder,
    state: &watch::Sender<BuildState>,
) -> Result<()> {
    let response = request.send().await.context("build request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body: Option<Value> = response.json().await.ok();
        let message = body
            .as_ref()
            .and_then(|b| b.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("build request failed with status {status}"));
        anyhow::bail!(message);
    }

    let mut decoder = SseDecoder::new();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("build stream interrupted")?;
        let events = decoder.push(&chunk);
        if events.is_empty() {
            continue;
        }
        state.send_modify(|s| s.apply_all(&events));
        if state.borrow().phase != BuildPhase::Building {
            return Ok(());
        }
    }

    anyhow::bail!("build stream ended before the build finished")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StepStatus;
    use crate::protocol::BuildEvent;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(events: &[BuildEvent]) -> String {
        events.iter().map(BuildEvent::encode).collect()
    }

    fn stream_response(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    async fn finish(session: BuildSession) -> BuildState {
        tokio::time::timeout(Duration::from_secs(5), session.finished())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn completed_stream_reaches_completed() {
        let server = MockServer::start().await;
        let body = sse(&[
            BuildEvent::SandboxInitStart {
                sandbox_id: Some("sb-9".into()),
            },
            BuildEvent::SandboxInitComplete {
                sandbox_id: "sb-9".into(),
                is_existing: true,
            },
            BuildEvent::ServerStart {},
            BuildEvent::BuildComplete {
                sandbox_id: "sb-9".into(),
                preview_url: "https://sb-9.example.app".into(),
            },
        ]);
        Mock::given(method("POST"))
            .and(path("/build"))
            .and(body_json(json!({"prompt": "weather", "sandboxId": "sb-9"})))
            .respond_with(stream_response(body))
            .expect(1)
            .mount(&server)
            .await;

        let client = BuildClient::new(&server.uri()).unwrap();
        let state = finish(client.start_build("weather", Some("sb-9"))).await;
        assert_eq!(state.phase, BuildPhase::Completed);
        assert_eq!(state.preview_url.as_deref(), Some("https://sb-9.example.app"));
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Done));
    }

    #[tokio::test]
    async fn error_event_fails_and_ignores_trailing_bytes() {
        let server = MockServer::start().await;
        let mut body = sse(&[
            BuildEvent::SandboxInitStart { sandbox_id: None },
            BuildEvent::DepsInstallStart {},
            BuildEvent::BuildError {
                error: "npm install failed: permission denied".into(),
                sandbox_id: Some("sb-3".into()),
            },
        ]);
        body.push_str("event: build:complete\ndata: {\"sandboxId\":\"sb-3\",\"previewUrl\":\"x\"}\n\nevent: garbage\ndata: {");
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(stream_response(body))
            .mount(&server)
            .await;

        let client = BuildClient::new(&server.uri()).unwrap();
        let state = finish(client.start_build("p", None)).await;
        assert_eq!(state.phase, BuildPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("npm install failed: permission denied"));
        assert_eq!(state.steps[1].status, StepStatus::Error);
        assert!(state.preview_url.is_none());
    }

    #[tokio::test]
    async fn error_response_uses_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_json(json!({"error": "ANTHROPIC_API_KEY not configured"})),
            )
            .mount(&server)
            .await;

        let client = BuildClient::new(&server.uri()).unwrap();
        let state = finish(client.start_build("p", None)).await;
        assert_eq!(state.phase, BuildPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("ANTHROPIC_API_KEY not configured"));
    }

    #[tokio::test]
    async fn truncated_stream_fails_locally() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(stream_response(sse(&[BuildEvent::SandboxInitStart {
                sandbox_id: None,
            }])))
            .mount(&server)
            .await;

        let client = BuildClient::new(&server.uri()).unwrap();
        let state = finish(client.start_build("p", None)).await;
        assert_eq!(state.phase, BuildPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("build stream ended before the build finished"));
        assert_eq!(state.steps[0].status, StepStatus::Error);
    }

    #[tokio::test]
    async fn cancel_aborts_read_without_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/build"))
            .respond_with(
                stream_response(sse(&[BuildEvent::BuildComplete {
                    sandbox_id: "sb".into(),
                    preview_url: "https://late".into(),
                }]))
                .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let client = BuildClient::new(&server.uri()).unwrap();
        let session = client.start_build("p", None);
        let mut updates = session.subscribe();
        session.cancel();
        assert_eq!(updates.borrow_and_update().phase, BuildPhase::Cancelled);

        let state = finish(session).await;
        assert_eq!(state.phase, BuildPhase::Cancelled);
        assert!(state.error.is_none());
        assert!(state.preview_url.is_none());
        assert!(state.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn stop_posts_sandbox_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stop"))
            .and(body_json(json!({"sandboxId": "sb-7"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = BuildClient::new(&server.uri()).unwrap();
        client.stop_sandbox("sb-7").await.unwrap();
    }
}
