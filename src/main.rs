use agent_builder::client::stream::BuildClient;
use agent_builder::client::{BuildPhase, BuildState, StepStatus};
use agent_builder::config::Config;
use agent_builder::gateway;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji};
use std::io::Write;
use tracing_subscriber::EnvFilter;

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>] ");

#[derive(Parser)]
#[command(name = "agent-builder", version, about = "Build dashboard widgets from a prompt in a cloud sandbox")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Build a widget through a running gateway and show progress
    Build {
        #[arg(short, long)]
        prompt: String,
        /// Reuse an existing sandbox
        #[arg(long)]
        sandbox_id: Option<String>,
        /// Gateway base URL (defaults to the configured host and port)
        #[arg(long)]
        server: Option<String>,
    },
    /// Stop a sandbox
    Stop {
        sandbox_id: String,
        #[arg(long)]
        server: Option<String>,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the JSON schema of the config file
    Schema,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "agent_builder=debug,tower_http=debug"
    } else {
        "agent_builder=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn gateway_url(config: &Config, server: Option<String>) -> String {
    server.unwrap_or_else(|| format!("http://{}:{}", config.gateway.host, config.gateway.port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut config = Config::load()?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            gateway::run_gateway(config).await
        }
        Commands::Build {
            prompt,
            sandbox_id,
            server,
        } => {
            let client = BuildClient::new(&gateway_url(&config, server))?;
            run_build(&client, &prompt, sandbox_id.as_deref()).await
        }
        Commands::Stop { sandbox_id, server } => {
            let client = BuildClient::new(&gateway_url(&config, server))?;
            client.stop_sandbox(&sandbox_id).await?;
            println!("{CHECK}Stopped sandbox {sandbox_id}");
            Ok(())
        }
        Commands::Config {
            command: ConfigCommands::Schema,
        } => {
            println!("{}", Config::json_schema()?);
            Ok(())
        }
    }
}

async fn run_build(client: &BuildClient, prompt: &str, sandbox_id: Option<&str>) -> Result<()> {
    let session = client.start_build(prompt, sandbox_id);
    let mut updates = session.subscribe();
    let mut renderer = ProgressRenderer::default();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                renderer.render(&state);
                if state.phase.is_terminal() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                session.cancel();
            }
        }
    }

    let state = session.finished().await;
    renderer.render(&state);
    match state.phase {
        BuildPhase::Completed => {
            println!();
            if let Some(url) = &state.preview_url {
                println!("Preview: {}", style(url).cyan().underlined());
            }
            if let Some(id) = &state.sandbox_id {
                println!("Sandbox: {id}");
            }
            Ok(())
        }
        BuildPhase::Cancelled => {
            println!("\n{}", style("Build cancelled").yellow());
            Ok(())
        }
        _ => anyhow::bail!(state.error.unwrap_or_else(|| "build failed".to_string())),
    }
}

/// Prints step transitions and transcript text as they arrive.
#[derive(Default)]
struct ProgressRenderer {
    printed: Vec<Option<StepStatus>>,
    transcript_len: usize,
}

impl ProgressRenderer {
    fn render(&mut self, state: &BuildState) {
        if self.printed.len() != state.steps.len() {
            self.printed = vec![None; state.steps.len()];
        }

        if state.transcript.len() > self.transcript_len {
            print!("{}", style(&state.transcript[self.transcript_len..]).dim());
            self.transcript_len = state.transcript.len();
        }

        for (step, printed) in state.steps.iter().zip(self.printed.iter_mut()) {
            if step.status == StepStatus::Pending || *printed == Some(step.status) {
                continue;
            }
            *printed = Some(step.status);
            match step.status {
                StepStatus::Active => println!("{RUNNING}{}", style(&step.message).bold()),
                StepStatus::Done => println!("{CHECK}{}", step.message),
                StepStatus::Error => println!("{CROSS}{}", style(&step.message).red()),
                StepStatus::Pending => {}
            }
        }
        let _ = std::io::stdout().flush();
    }
}
