//! Remote sandbox provider: HTTP client for the hosted sandbox REST API.
//!
//! One [`RemoteSandboxRuntime`] is shared by all builds. Each handle it
//! returns addresses a single sandbox through the shared [`reqwest::Client`].
//! Detached commands get a background task that reads the NDJSON log stream
//! and forwards records over a bounded channel.

use super::{
    CommandOutput, CommandSpec, CreateOptions, DetachedCommand, LogRecord, SandboxError,
    SandboxFile, SandboxHandle, SandboxRuntime,
};
use crate::config::SandboxConfig;
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Buffered log records per detached command before the pump waits.
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Remote statuses that mean the sandbox can no longer be used.
const DEAD_STATUSES: &[&str] = &["stopped", "stopping", "expired", "failed"];

struct SandboxApi {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl SandboxApi {
    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url.trim_end_matches('/'))
    }

    fn sandbox_url(&self, sandbox_id: &str, rest: &str) -> String {
        let id = urlencoding::encode(sandbox_id);
        if rest.is_empty() {
            self.url(&format!("sandboxes/{id}"))
        } else {
            self.url(&format!("sandboxes/{id}/{rest}"))
        }
    }

    /// Send a request with the standard timeout and decode a JSON body.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, SandboxError> {
        self.send_with(request.timeout(self.request_timeout)).await
    }

    /// Like [`Self::send`] but without a timeout, for calls that last as long
    /// as a remote process.
    async fn send_with(&self, request: reqwest::RequestBuilder) -> Result<Value, SandboxError> {
        let resp = request.bearer_auth(&self.api_key).send().await?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());

        if !status.is_success() {
            return Err(SandboxError::Api {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| SandboxError::Api {
            status: status.as_u16(),
            body: format!("invalid JSON ({e}): {body}"),
        })
    }

    async fn wait(&self, sandbox_id: &str, cmd_id: &str) -> anyhow::Result<CommandOutput> {
        let url = self.sandbox_url(
            sandbox_id,
            &format!("commands/{}/wait", urlencoding::encode(cmd_id)),
        );
        let parsed = self.send_with(self.http.get(&url)).await?;
        command_output(&parsed)
    }

    async fn pump_logs(
        &self,
        sandbox_id: &str,
        cmd_id: &str,
        tx: &mpsc::Sender<LogRecord>,
    ) -> anyhow::Result<()> {
        let url = self.sandbox_url(
            sandbox_id,
            &format!("commands/{}/logs", urlencoding::encode(cmd_id)),
        );
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("log stream request failed")?;
        let status = resp.status();
        anyhow::ensure!(status.is_success(), "log stream returned {status}");

        let mut stream = resp.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk.context("log stream interrupted")?);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if let Some(record) = parse_log_line(&line) {
                    if tx.send(record).await.is_err() {
                        // Receiver dropped; nobody is listening any more.
                        return Ok(());
                    }
                }
            }
        }
        if let Some(record) = parse_log_line(&pending) {
            let _ = tx.send(record).await;
        }
        Ok(())
    }
}

fn parse_log_line(line: &[u8]) -> Option<LogRecord> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!("Skipping unreadable log record: {e}");
            None
        }
    }
}

fn command_output(parsed: &Value) -> anyhow::Result<CommandOutput> {
    let exit_code = parsed["exitCode"]
        .as_i64()
        .or_else(|| parsed["exit_code"].as_i64())
        .ok_or_else(|| anyhow::anyhow!("sandbox API returned no exitCode. Response: {parsed}"))?;
    Ok(CommandOutput {
        stdout: parsed["stdout"].as_str().unwrap_or("").to_string(),
        stderr: parsed["stderr"].as_str().unwrap_or("").to_string(),
        exit_code,
    })
}

fn command_body(spec: &CommandSpec, detached: bool) -> Value {
    json!({
        "cmd": spec.cmd,
        "args": spec.args,
        "cwd": spec.cwd,
        "env": spec.env,
        "sudo": spec.sudo,
        "detached": detached,
    })
}

fn normalize_url(raw: &str) -> String {
    let raw = raw.trim().trim_matches('"');
    if raw.starts_with("http") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

/// HTTP-backed [`SandboxRuntime`].
pub struct RemoteSandboxRuntime {
    api: Arc<SandboxApi>,
}

impl RemoteSandboxRuntime {
    pub fn new(config: &SandboxConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !config.api_key.trim().is_empty(),
            "SANDBOX_API_KEY is not set"
        );
        // No client-wide timeout: log streams and waits last as long as the
        // remote process. Ordinary calls get `request_timeout` per request.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build reqwest client")?;

        Ok(Self {
            api: Arc::new(SandboxApi {
                base_url: config.api_url.clone(),
                api_key: config.api_key.clone(),
                http,
                request_timeout: Duration::from_secs(config.request_timeout_secs),
            }),
        })
    }

    fn handle(&self, id: String) -> Arc<dyn SandboxHandle> {
        Arc::new(RemoteSandbox {
            id,
            api: Arc::clone(&self.api),
        })
    }
}

#[async_trait]
impl SandboxRuntime for RemoteSandboxRuntime {
    async fn create(&self, options: &CreateOptions) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let body = json!({
            "runtime": options.runtime,
            "timeout": u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
            "ports": options.ports,
        });
        let parsed = self
            .api
            .send(self.api.http.post(self.api.url("sandboxes")).json(&body))
            .await
            .map_err(|e| match e {
                SandboxError::Api { status, body } => {
                    SandboxError::Provision(format!("sandbox API returned {status}: {body}"))
                }
                other => other,
            })?;

        let sandbox_id = parsed["sandboxId"]
            .as_str()
            .or_else(|| parsed["id"].as_str())
            .unwrap_or("")
            .to_string();
        if sandbox_id.is_empty() {
            return Err(SandboxError::Provision(format!(
                "sandbox API returned no sandboxId. Response: {parsed}"
            )));
        }
        Ok(self.handle(sandbox_id))
    }

    async fn get(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let url = self.api.sandbox_url(sandbox_id, "");
        let parsed = match self.api.send(self.api.http.get(&url)).await {
            Ok(parsed) => parsed,
            Err(SandboxError::Api { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() || status == StatusCode::GONE.as_u16() =>
            {
                return Err(SandboxError::NotFound(sandbox_id.to_string()));
            }
            Err(e) => return Err(e),
        };

        let status = parsed["status"].as_str().unwrap_or("running");
        if DEAD_STATUSES.contains(&status) {
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }
        Ok(self.handle(sandbox_id.to_string()))
    }
}

/// A sandbox addressed through the REST API.
pub struct RemoteSandbox {
    id: String,
    api: Arc<SandboxApi>,
}

#[async_trait]
impl SandboxHandle for RemoteSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        let url = self.api.sandbox_url(&self.id, "commands");
        // Attached commands such as `npm install` outlive the request timeout.
        let parsed = self
            .api
            .send_with(self.api.http.post(&url).json(&command_body(spec, false)))
            .await
            .with_context(|| format!("Failed to run `{}`", spec.display()))?;
        command_output(&parsed)
    }

    async fn run_detached(&self, spec: &CommandSpec) -> anyhow::Result<DetachedCommand> {
        let url = self.api.sandbox_url(&self.id, "commands");
        let parsed = self
            .api
            .send(self.api.http.post(&url).json(&command_body(spec, true)))
            .await
            .with_context(|| format!("Failed to start `{}`", spec.display()))?;

        let cmd_id = parsed["cmdId"]
            .as_str()
            .or_else(|| parsed["id"].as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("sandbox API returned no cmdId. Response: {parsed}"))?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        {
            let api = Arc::clone(&self.api);
            let sandbox_id = self.id.clone();
            let cmd_id = cmd_id.clone();
            tokio::spawn(async move {
                if let Err(e) = api.pump_logs(&sandbox_id, &cmd_id, &tx).await {
                    tracing::warn!("Log stream for command {cmd_id} ended early: {e:#}");
                }
            });
        }

        let api = Arc::clone(&self.api);
        let sandbox_id = self.id.clone();
        let wait_id = cmd_id.clone();
        Ok(DetachedCommand::new(
            cmd_id,
            rx,
            Box::pin(async move { api.wait(&sandbox_id, &wait_id).await }),
        ))
    }

    async fn write_files(&self, files: &[SandboxFile]) -> anyhow::Result<()> {
        let url = self.api.sandbox_url(&self.id, "files");
        let encoded: Vec<Value> = files
            .iter()
            .map(|file| {
                json!({
                    "path": file.path,
                    "content": base64::engine::general_purpose::STANDARD.encode(&file.content),
                })
            })
            .collect();

        self.api
            .send(self.api.http.post(&url).json(&json!({ "files": encoded })))
            .await
            .with_context(|| format!("Failed to upload {} files", files.len()))?;
        Ok(())
    }

    async fn domain(&self, port: u16) -> anyhow::Result<String> {
        let url = self.api.sandbox_url(&self.id, &format!("domains/{port}"));
        let parsed = self
            .api
            .send(self.api.http.get(&url))
            .await
            .with_context(|| format!("Failed to resolve domain for port {port}"))?;

        let raw = parsed["url"]
            .as_str()
            .or_else(|| parsed["domain"].as_str())
            .or_else(|| parsed.as_str())
            .ok_or_else(|| anyhow::anyhow!("sandbox API returned no URL for port {port}"))?;
        Ok(normalize_url(raw))
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let url = self.api.sandbox_url(&self.id, "stop");
        match self.api.send(self.api.http.post(&url)).await {
            Ok(_) => Ok(()),
            Err(SandboxError::Api { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() || status == StatusCode::GONE.as_u16() =>
            {
                tracing::debug!("Sandbox {} was already gone", self.id);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to stop sandbox {}", self.id)),
        }
    }
}
