//! Build orchestration.
//!
//! [`BuildOrchestrator::run_build`] drives one build as a single sequential
//! task against a sandbox:
//!
//! 1. init sandbox (reconnect or provision + seed)
//! 2. `npm install` in the project
//! 3. install the coding CLI globally (sudo)
//! 4. launch the CLI detached with the composed task prompt
//! 5. relay each JSON line of its stdout as `agent:message`
//! 6. start the dev server, wait for it to serve, resolve the preview URL
//!
//! Every step is bracketed by protocol events. The first failure emits one
//! `build:error`, stops the sandbox (best effort) and ends the stream. The
//! event channel is closed when `run_build` returns, on every path.
//!
//! Client disconnects are not observed: the build keeps going and further
//! events are discarded.

pub mod lines;
pub mod prompt;

use crate::config::schema::AGENT_API_KEY_ENV;
use crate::config::AgentConfig;
use crate::error::BuildError;
use crate::protocol::{BuildEvent, ProgressStatus};
use crate::sandbox::lifecycle::SandboxManager;
use crate::sandbox::{CommandSpec, DetachedCommand, LogStream, SandboxHandle};
use lines::JsonLineBuffer;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events buffered per build before the orchestrator waits for the client.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// `sandbox:init_progress` step name for the CLI install.
const CLI_INSTALL_STEP: &str = "install_cli";

/// Agent stderr kept for the failure message. Older output is discarded.
const STDERR_TAIL_BYTES: usize = 16 * 1024;

/// A request to build a widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub prompt: String,
    /// Reuse this sandbox instead of provisioning a new one.
    pub sandbox_id: Option<String>,
}

/// Sending side of a build's event stream.
struct EventSink {
    tx: mpsc::Sender<BuildEvent>,
}

impl EventSink {
    async fn send(&self, event: BuildEvent) {
        let kind = event.kind();
        if self.tx.send(event).await.is_err() {
            tracing::debug!("Client gone; dropping {kind}");
        }
    }
}

pub struct BuildOrchestrator {
    manager: Arc<SandboxManager>,
    agent: AgentConfig,
}

impl BuildOrchestrator {
    pub fn new(manager: Arc<SandboxManager>, agent: AgentConfig) -> Self {
        Self { manager, agent }
    }

    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// Spawn a build and return its event stream.
    pub fn start(self: &Arc<Self>, request: BuildRequest) -> mpsc::Receiver<BuildEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run_build(request, tx).await });
        rx
    }

    /// Run one build to completion, writing events to `events`. The channel
    /// closes when this returns.
    #[tracing::instrument(
        name = "build",
        skip_all,
        fields(build_id = %uuid::Uuid::new_v4(), sandbox_id = tracing::field::Empty)
    )]
    pub async fn run_build(&self, request: BuildRequest, events: mpsc::Sender<BuildEvent>) {
        let sink = EventSink { tx: events };
        let mut sandbox_id: Option<String> = None;
        tracing::info!("Build started");

        match self.execute(&request, &sink, &mut sandbox_id).await {
            Ok(()) => tracing::info!("Build complete"),
            Err(err) => {
                tracing::warn!("Build failed: {err}");
                if sandbox_id.is_none() {
                    sandbox_id = err.sandbox_id().map(str::to_string);
                }
                sink.send(BuildEvent::BuildError {
                    error: err.to_string(),
                    sandbox_id: sandbox_id.clone(),
                })
                .await;

                if let Some(id) = sandbox_id.as_deref().filter(|_| err.stops_sandbox()) {
                    self.manager.stop(id).await;
                }
            }
        }
    }

    async fn execute(
        &self,
        request: &BuildRequest,
        sink: &EventSink,
        sandbox_id: &mut Option<String>,
    ) -> Result<(), BuildError> {
        let api_key = self
            .agent
            .credential()
            .ok_or_else(|| BuildError::Configuration(format!("{AGENT_API_KEY_ENV} not configured")))?
            .to_string();

        sink.send(BuildEvent::SandboxInitStart {
            sandbox_id: request.sandbox_id.clone(),
        })
        .await;
        let session = self.manager.init(request.sandbox_id.as_deref()).await?;
        let handle = Arc::clone(&session.handle);
        let id = session.id().to_string();
        tracing::Span::current().record("sandbox_id", id.as_str());
        *sandbox_id = Some(id.clone());
        sink.send(BuildEvent::SandboxInitComplete {
            sandbox_id: id.clone(),
            is_existing: session.is_existing,
        })
        .await;

        sink.send(BuildEvent::DepsInstallStart {}).await;
        self.install_dependencies(handle.as_ref()).await?;
        sink.send(BuildEvent::DepsInstallComplete {}).await;

        sink.send(BuildEvent::SandboxInitProgress {
            step: CLI_INSTALL_STEP.to_string(),
            status: ProgressStatus::Start,
        })
        .await;
        self.install_cli(handle.as_ref()).await?;
        sink.send(BuildEvent::SandboxInitProgress {
            step: CLI_INSTALL_STEP.to_string(),
            status: ProgressStatus::Complete,
        })
        .await;

        let agent_prompt = prompt::compose_agent_prompt(&request.prompt);
        sink.send(BuildEvent::AgentStart {
            prompt: agent_prompt.clone(),
        })
        .await;
        self.run_agent(handle.as_ref(), &agent_prompt, &api_key, sink)
            .await?;
        sink.send(BuildEvent::AgentComplete { output: None }).await;

        sink.send(BuildEvent::ServerStart {}).await;
        let preview_url = self.start_preview(handle.as_ref()).await?;
        tracing::info!("Preview ready at {preview_url}");
        sink.send(BuildEvent::BuildComplete {
            sandbox_id: id,
            preview_url,
        })
        .await;

        Ok(())
    }

    async fn install_dependencies(&self, handle: &dyn SandboxHandle) -> Result<(), BuildError> {
        let spec = CommandSpec::new("npm")
            .args(["install"])
            .cwd(&self.agent.project_dir);
        let output = handle.run_command(&spec).await?;
        if !output.success() {
            return Err(BuildError::command_failed("npm install", &output.stderr));
        }
        Ok(())
    }

    async fn install_cli(&self, handle: &dyn SandboxHandle) -> Result<(), BuildError> {
        let spec = CommandSpec::new("npm")
            .args(["install", "-g", self.agent.cli_package.as_str()])
            .sudo();
        let output = handle.run_command(&spec).await?;
        if !output.success() {
            return Err(BuildError::command_failed("agent CLI install", &output.stderr));
        }
        Ok(())
    }

    async fn run_agent(
        &self,
        handle: &dyn SandboxHandle,
        agent_prompt: &str,
        api_key: &str,
        sink: &EventSink,
    ) -> Result<(), BuildError> {
        let spec = CommandSpec::new(&self.agent.cli_command)
            .args(prompt::cli_args(agent_prompt))
            .cwd(&self.agent.project_dir)
            .env(AGENT_API_KEY_ENV, api_key);
        let mut command = handle.run_detached(&spec).await?;

        let mut lines = JsonLineBuffer::new();
        let mut stderr = String::new();
        let mut relayed = 0usize;

        while let Some(record) = command.next_log().await {
            match record.stream {
                LogStream::Stdout => {
                    for message in lines.push(&record.data) {
                        sink.send(BuildEvent::AgentMessage(message)).await;
                        relayed += 1;
                    }
                }
                LogStream::Stderr => {
                    tracing::debug!("agent stderr: {}", record.data.trim_end());
                    push_tail(&mut stderr, &record.data, STDERR_TAIL_BYTES);
                }
            }
        }
        if let Some(message) = lines.finish() {
            sink.send(BuildEvent::AgentMessage(message)).await;
            relayed += 1;
        }

        let output = command.wait().await?;
        tracing::debug!("Agent exited with {} after {relayed} messages", output.exit_code);
        if !output.success() {
            let captured = if output.stderr.trim().is_empty() {
                stderr
            } else {
                output.stderr
            };
            return Err(BuildError::CommandFailed {
                context: "agent CLI".to_string(),
                detail: format!("exit {}: {}", output.exit_code, captured.trim()),
            });
        }
        Ok(())
    }

    async fn start_preview(&self, handle: &dyn SandboxHandle) -> Result<String, BuildError> {
        let port = self.agent.preview_port;
        let spec = CommandSpec::new("npx")
            .args(["vite", "--host", "0.0.0.0", "--port"])
            .args([port.to_string()])
            .cwd(&self.agent.project_dir)
            .env("NO_COLOR", "1");
        let mut server = handle.run_detached(&spec).await?;

        match tokio::time::timeout(
            self.agent.server_ready_timeout(),
            wait_for_marker(&mut server, &self.agent.server_ready_marker),
        )
        .await
        {
            Ok(true) => tracing::debug!("Dev server is serving on port {port}"),
            Ok(false) => tracing::warn!("Dev server output closed before it reported ready"),
            Err(_) => tracing::warn!(
                "Dev server not ready after {}s; resolving preview anyway",
                self.agent.server_ready_timeout_secs
            ),
        }
        // Dropping `server` only stops log delivery; the process keeps running.
        drop(server);

        Ok(handle.domain(port).await?)
    }
}

/// Read logs until `marker` shows up on a line. False if output closes first.
async fn wait_for_marker(command: &mut DetachedCommand, marker: &str) -> bool {
    let mut line = String::new();
    while let Some(record) = command.next_log().await {
        line.push_str(&record.data);
        if line.contains(marker) {
            return true;
        }
        if let Some(pos) = line.rfind('\n') {
            line.drain(..=pos);
        }
    }
    false
}

/// Append `data`, then drop whole characters from the front until `buf`
/// fits in `limit` bytes.
fn push_tail(buf: &mut String, data: &str, limit: usize) {
    buf.push_str(data);
    if buf.len() <= limit {
        return;
    }
    let mut cut = buf.len() - limit;
    while !buf.is_char_boundary(cut) {
        cut += 1;
    }
    buf.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::EventKind;
    use crate::sandbox::lifecycle::LifecycleOptions;
    use crate::sandbox::registry::InMemorySandboxStore;
    use crate::sandbox::testing::{Call, ScriptedRuntime, ScriptedSandbox};
    use crate::sandbox::LogRecord;
    use serde_json::json;

    const ASSISTANT_LINE: &str =
        "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Writing App.tsx\"}]}}\n";

    fn agent_config() -> AgentConfig {
        AgentConfig {
            api_key: "sk-test".into(),
            server_ready_timeout_secs: 1,
            ..AgentConfig::default()
        }
    }

    fn orchestrator(runtime: Arc<ScriptedRuntime>, agent: AgentConfig) -> Arc<BuildOrchestrator> {
        let manager = SandboxManager::new(
            runtime,
            Arc::new(InMemorySandboxStore::new()),
            LifecycleOptions::from(&Config::default()),
        );
        Arc::new(BuildOrchestrator::new(Arc::new(manager), agent))
    }

    fn script_happy_path(sandbox: &ScriptedSandbox) {
        sandbox.on_detached(
            "claude",
            vec![
                LogRecord::stdout("{\"type\":\"system\",\"subtype\":\"init\"}\n{\"type\":\"assis"),
                LogRecord::stdout(&ASSISTANT_LINE[14..]),
                LogRecord::stderr("debug noise\n"),
                LogRecord::stdout("{\"type\":\"result\",\"subtype\":\"success\"}"),
            ],
            0,
            "",
        );
        sandbox.on_detached(
            "npx vite",
            vec![LogRecord::stdout("  VITE v6.3.5  ready in 412 ms\n\n  ➜  Local:   http://localhost:5173/\n")],
            0,
            "",
        );
    }

    async fn collect(mut rx: mpsc::Receiver<BuildEvent>) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn request(sandbox_id: Option<&str>) -> BuildRequest {
        BuildRequest {
            prompt: "Track daily Twitter sentiment on $TSLA".into(),
            sandbox_id: sandbox_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn successful_build_emits_full_sequence() {
        let sandbox = ScriptedSandbox::new("sb-a");
        script_happy_path(&sandbox);
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());

        let events = collect(orch.start(request(None))).await;
        let kinds: Vec<EventKind> = events.iter().map(BuildEvent::kind).collect();
        assert_eq!(
            kinds,
            [
                EventKind::SandboxInitStart,
                EventKind::SandboxInitComplete,
                EventKind::DepsInstallStart,
                EventKind::DepsInstallComplete,
                EventKind::SandboxInitProgress,
                EventKind::SandboxInitProgress,
                EventKind::AgentStart,
                EventKind::AgentMessage,
                EventKind::AgentMessage,
                EventKind::AgentMessage,
                EventKind::AgentComplete,
                EventKind::ServerStart,
                EventKind::BuildComplete,
            ]
        );
        assert_eq!(
            events[1],
            BuildEvent::SandboxInitComplete {
                sandbox_id: "sb-a".into(),
                is_existing: false
            }
        );
        assert_eq!(events[8], BuildEvent::AgentMessage(serde_json::from_str(ASSISTANT_LINE).unwrap()));
        assert_eq!(events[9], BuildEvent::AgentMessage(json!({"type": "result", "subtype": "success"})));
        assert_eq!(
            events.last(),
            Some(&BuildEvent::BuildComplete {
                sandbox_id: "sb-a".into(),
                preview_url: "https://sb-a-5173.sandbox.test".into(),
            })
        );
        assert!(!sandbox.stopped());
    }

    #[tokio::test]
    async fn agent_runs_detached_with_credential_and_prompt() {
        let sandbox = ScriptedSandbox::new("sb-a");
        script_happy_path(&sandbox);
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());
        collect(orch.start(request(None))).await;

        let calls = sandbox.calls();
        assert!(calls.contains(&Call::Run("npm install".into())));
        assert!(calls.contains(&Call::Run("npm install -g @anthropic-ai/claude-code".into())));

        let agent = calls
            .iter()
            .find_map(|call| match call {
                Call::Detached(spec) if spec.cmd == "claude" => Some(spec.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(agent.env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(agent.cwd.as_deref(), Some("/vercel/sandbox/app"));
        assert!(agent.args[1].contains("Track daily Twitter sentiment on $TSLA"));
    }

    #[tokio::test]
    async fn failed_dependency_install_reports_and_stops() {
        let sandbox = ScriptedSandbox::new("sb-b");
        sandbox.on_run("npm install", 1, "permission denied");
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());

        let events = collect(orch.start(request(None))).await;
        let errors: Vec<&BuildEvent> = events
            .iter()
            .filter(|e| e.kind() == EventKind::BuildError)
            .collect();
        assert_eq!(
            errors,
            [&BuildEvent::BuildError {
                error: "npm install failed: permission denied".into(),
                sandbox_id: Some("sb-b".into()),
            }]
        );
        assert_eq!(events.last().unwrap().kind(), EventKind::BuildError);
        assert!(!events.iter().any(|e| e.kind() == EventKind::DepsInstallComplete));
        assert!(sandbox.stopped());
        assert!(orch.manager().store().get("sb-b").is_none());
    }

    #[tokio::test]
    async fn seed_failure_reports_sandbox_id() {
        let sandbox = ScriptedSandbox::new("sb-s");
        sandbox.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());

        let events = collect(orch.start(request(None))).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            BuildEvent::BuildError {
                error: "failed to seed sandbox workspace: upload rejected".into(),
                sandbox_id: Some("sb-s".into()),
            }
        );
        let stops = sandbox.calls().iter().filter(|c| **c == Call::Stop).count();
        assert_eq!(stops, 1);
    }

    #[tokio::test]
    async fn existing_sandbox_skips_seeding() {
        let sandbox = ScriptedSandbox::new("sb-c");
        script_happy_path(&sandbox);
        let runtime = ScriptedRuntime::new(sandbox.clone());
        runtime.know("sb-c");
        let orch = orchestrator(runtime, agent_config());

        let events = collect(orch.start(request(Some("sb-c")))).await;
        assert_eq!(
            events[0],
            BuildEvent::SandboxInitStart {
                sandbox_id: Some("sb-c".into())
            }
        );
        assert_eq!(
            events[1],
            BuildEvent::SandboxInitComplete {
                sandbox_id: "sb-c".into(),
                is_existing: true
            }
        );
        assert_eq!(events[2], BuildEvent::DepsInstallStart {});
        assert!(!sandbox.calls().iter().any(|c| matches!(c, Call::WriteFiles(_))));
        assert_eq!(events.last().unwrap().kind(), EventKind::BuildComplete);
    }

    #[tokio::test]
    async fn malformed_agent_output_is_skipped() {
        let sandbox = ScriptedSandbox::new("sb-e");
        sandbox.on_detached(
            "claude",
            vec![LogRecord::stdout("{not json\n{\"type\":\"assistant\"}\n")],
            0,
            "",
        );
        let orch = orchestrator(ScriptedRuntime::new(sandbox), agent_config());

        let events = collect(orch.start(request(None))).await;
        let messages: Vec<&BuildEvent> = events
            .iter()
            .filter(|e| e.kind() == EventKind::AgentMessage)
            .collect();
        assert_eq!(messages, [&BuildEvent::AgentMessage(json!({"type": "assistant"}))]);
        assert_eq!(events.last().unwrap().kind(), EventKind::BuildComplete);
    }

    #[tokio::test]
    async fn agent_failure_carries_exit_code_and_stderr() {
        let sandbox = ScriptedSandbox::new("sb-f");
        sandbox.on_detached("claude", vec![LogRecord::stderr("invalid api key\n")], 2, "");
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());

        let events = collect(orch.start(request(None))).await;
        assert_eq!(
            events.last(),
            Some(&BuildEvent::BuildError {
                error: "agent CLI failed: exit 2: invalid api key".into(),
                sandbox_id: Some("sb-f".into()),
            })
        );
        assert!(!events.iter().any(|e| e.kind() == EventKind::AgentComplete));
        assert!(sandbox.stopped());
    }

    #[test]
    fn stderr_tail_keeps_newest_bytes() {
        let mut buf = String::new();
        push_tail(&mut buf, "abcdef", 4);
        assert_eq!(buf, "cdef");
        push_tail(&mut buf, "gh", 4);
        assert_eq!(buf, "efgh");

        // Never splits a multi-byte character.
        let mut buf = String::new();
        push_tail(&mut buf, "aé€", 4);
        assert_eq!(buf, "€");
    }

    #[tokio::test]
    async fn noisy_agent_stderr_is_bounded() {
        let sandbox = ScriptedSandbox::new("sb-n");
        let mut records: Vec<LogRecord> = (0..64)
            .map(|_| LogRecord::stderr("x".repeat(1024)))
            .collect();
        records.push(LogRecord::stderr("fatal: quota exceeded"));
        sandbox.on_detached("claude", records, 1, "");
        let orch = orchestrator(ScriptedRuntime::new(sandbox), agent_config());

        let events = collect(orch.start(request(None))).await;
        let Some(BuildEvent::BuildError { error, .. }) = events.last() else {
            panic!("expected build:error, got {events:?}");
        };
        assert!(error.ends_with("fatal: quota exceeded"));
        assert!(error.len() <= STDERR_TAIL_BYTES + 64);
    }

    #[tokio::test]
    async fn unknown_sandbox_fails_without_stop() {
        let sandbox = ScriptedSandbox::new("sb");
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());

        let events = collect(orch.start(request(Some("expired")))).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            BuildEvent::BuildError {
                error: "sandbox expired not found (it may have expired)".into(),
                sandbox_id: None,
            }
        );
        assert!(!sandbox.stopped());
    }

    #[tokio::test]
    async fn missing_credential_fails_before_provisioning() {
        let sandbox = ScriptedSandbox::new("sb");
        let runtime = ScriptedRuntime::new(sandbox);
        let orch = orchestrator(runtime.clone(), AgentConfig::default());

        let events = collect(orch.start(request(None))).await;
        assert_eq!(
            events,
            [BuildEvent::BuildError {
                error: "ANTHROPIC_API_KEY not configured".into(),
                sandbox_id: None,
            }]
        );
        assert_eq!(runtime.creates.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preview_resolves_even_without_ready_marker() {
        let sandbox = ScriptedSandbox::new("sb-g");
        sandbox.on_detached("npx vite", vec![LogRecord::stdout("starting...\n")], 0, "");
        let orch = orchestrator(ScriptedRuntime::new(sandbox.clone()), agent_config());

        let events = collect(orch.start(request(None))).await;
        let server_start = events.iter().position(|e| e.kind() == EventKind::ServerStart);
        let complete = events.iter().position(|e| e.kind() == EventKind::BuildComplete);
        assert!(server_start.is_some() && server_start < complete);
        assert!(sandbox.calls().contains(&Call::Domain(5173)));
    }

    #[tokio::test]
    async fn ready_marker_may_span_chunks() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(LogRecord::stdout("noise\n  ➜  Loc")).await.unwrap();
        tx.send(LogRecord::stdout("al:   http://localhost:5173/\n")).await.unwrap();
        drop(tx);
        let mut cmd = DetachedCommand::new("c", rx, Box::pin(async { Ok(crate::sandbox::CommandOutput::default()) }));
        assert!(wait_for_marker(&mut cmd, "Local:").await);
    }
}
