//! Scripted in-process sandbox runtime for tests.
//!
//! Commands are matched by prefix against `cmd arg1 arg2`; unmatched commands
//! succeed with empty output. Every call is recorded so tests can assert on
//! the exact sequence the pipeline issued.

use super::{
    CommandOutput, CommandSpec, CreateOptions, DetachedCommand, LogRecord, SandboxError,
    SandboxFile, SandboxHandle, SandboxRuntime,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Run(String),
    Detached(CommandSpec),
    WriteFiles(Vec<String>),
    Domain(u16),
    Stop,
}

struct DetachedScript {
    prefix: String,
    logs: Vec<LogRecord>,
    exit: CommandOutput,
}

pub(crate) struct ScriptedSandbox {
    id: String,
    results: Mutex<Vec<(String, CommandOutput)>>,
    detached: Mutex<Vec<DetachedScript>>,
    calls: Mutex<Vec<Call>>,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) fail_stop: AtomicBool,
}

impl ScriptedSandbox {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            results: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
        })
    }

    /// Script the result of attached commands starting with `prefix`.
    pub(crate) fn on_run(&self, prefix: &str, exit_code: i64, stderr: &str) {
        self.results.lock().push((
            prefix.to_string(),
            CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        ));
    }

    /// Script the logs and exit of detached commands starting with `prefix`.
    pub(crate) fn on_detached(&self, prefix: &str, logs: Vec<LogRecord>, exit_code: i64, stderr: &str) {
        self.detached.lock().push(DetachedScript {
            prefix: prefix.to_string(),
            logs,
            exit: CommandOutput {
                stdout: String::new(),
                stderr: stderr.to_string(),
                exit_code,
            },
        });
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.calls().contains(&Call::Stop)
    }
}

#[async_trait]
impl SandboxHandle for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(&self, spec: &CommandSpec) -> anyhow::Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().push(Call::Run(line.clone()));
        Ok(self
            .results
            .lock()
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }

    async fn run_detached(&self, spec: &CommandSpec) -> anyhow::Result<DetachedCommand> {
        self.calls.lock().push(Call::Detached(spec.clone()));
        let line = spec.display();
        let (logs, exit) = self
            .detached
            .lock()
            .iter()
            .find(|script| line.starts_with(script.prefix.as_str()))
            .map(|script| (script.logs.clone(), script.exit.clone()))
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(logs.len().max(1));
        tokio::spawn(async move {
            for record in logs {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        Ok(DetachedCommand::new(
            format!("cmd-{}", spec.cmd),
            rx,
            Box::pin(async move { Ok(exit) }),
        ))
    }

    async fn write_files(&self, files: &[SandboxFile]) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push(Call::WriteFiles(files.iter().map(|f| f.path.clone()).collect()));
        anyhow::ensure!(!self.fail_writes.load(Ordering::SeqCst), "upload rejected");
        Ok(())
    }

    async fn domain(&self, port: u16) -> anyhow::Result<String> {
        self.calls.lock().push(Call::Domain(port));
        Ok(format!("https://{}-{port}.sandbox.test", self.id))
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.calls.lock().push(Call::Stop);
        anyhow::ensure!(!self.fail_stop.load(Ordering::SeqCst), "stop rejected");
        Ok(())
    }
}

/// Runtime that always provisions the same scripted sandbox and reconnects
/// only to ids it knows.
pub(crate) struct ScriptedRuntime {
    pub(crate) sandbox: Arc<ScriptedSandbox>,
    known: Mutex<Vec<String>>,
    pub(crate) creates: AtomicUsize,
    pub(crate) fail_create: AtomicBool,
}

impl ScriptedRuntime {
    pub(crate) fn new(sandbox: Arc<ScriptedSandbox>) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            known: Mutex::new(Vec::new()),
            creates: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
        })
    }

    /// Make `get(id)` resolve to the scripted sandbox.
    pub(crate) fn know(&self, id: &str) {
        self.known.lock().push(id.to_string());
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn create(&self, _options: &CreateOptions) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Provision("no capacity".into()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.know(&self.sandbox.id);
        Ok(self.sandbox.clone())
    }

    async fn get(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        if self.known.lock().iter().any(|id| id == sandbox_id) {
            Ok(self.sandbox.clone())
        } else {
            Err(SandboxError::NotFound(sandbox_id.to_string()))
        }
    }
}
