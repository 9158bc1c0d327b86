use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use orchard_domain::config::Config;
use orchard_domain::event::EventKind;
use orchard_kernel::{DefaultAgent, Kernel, NoSkills};

#[derive(Parser)]
#[command(name = "orchardd", about = "Workspace-scoped agent orchestration kernel")]
struct Cli {
    /// Path to orchard.toml (defaults to ./orchard.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create one task, drive it to a terminal state, print the outcome.
    Run {
        /// Task title.
        #[arg(long)]
        title: String,
        /// Optional task intent (the first user message).
        #[arg(long)]
        intent: Option<String>,
        /// Agent id to run the task with.
        #[arg(long, default_value = "main")]
        agent: String,
    },
    /// Validate the configuration file.
    ConfigValidate,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("orchard.toml"));

    match cli.command {
        Command::Run {
            title,
            intent,
            agent,
        } => {
            init_tracing();
            let config = Config::load(&config_path)?;
            for warning in config.validate() {
                tracing::warn!("{warning}");
            }
            run_task(config, title, intent, agent).await
        }
        Command::ConfigValidate => {
            let config = Config::load(&config_path)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}: ok", config_path.display());
            } else {
                for warning in &warnings {
                    println!("warning: {warning}");
                }
            }
            Ok(())
        }
        Command::Version => {
            println!("orchardd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Completes every request by echoing the latest user message.
struct LoopbackLlm;

#[async_trait::async_trait]
impl orchard_domain::llm::LlmClient for LoopbackLlm {
    async fn complete(
        &self,
        req: orchard_domain::llm::ChatRequest,
    ) -> orchard_domain::Result<orchard_domain::llm::ChatResponse> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == orchard_domain::message::Role::User)
            .map(|m| m.text().to_owned())
            .unwrap_or_default();
        Ok(orchard_domain::llm::ChatResponse {
            content: last_user,
            reasoning: None,
            tool_calls: Vec::new(),
            usage: None,
        })
    }

    async fn stream(
        &self,
        req: orchard_domain::llm::ChatRequest,
    ) -> orchard_domain::Result<
        orchard_domain::stream::BoxStream<
            'static,
            orchard_domain::Result<orchard_domain::stream::StreamEvent>,
        >,
    > {
        let resp = self.complete(req).await?;
        Ok(Box::pin(futures_util::stream::iter(vec![
            Ok(orchard_domain::stream::StreamEvent::Token { text: resp.content }),
            Ok(orchard_domain::stream::StreamEvent::Done {
                usage: None,
                finish_reason: Some("stop".into()),
            }),
        ])))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ORCHARD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_task(
    config: Config,
    title: String,
    intent: Option<String>,
    agent_id: String,
) -> anyhow::Result<()> {
    let kernel = Kernel::open(config).context("opening workspace")?;

    // The LLM transport is a port; this binary ships with a loopback client
    // so the kernel can be driven end to end without a provider. Real
    // deployments embed the kernel and register their own `LlmClient`.
    let llm = Arc::new(LoopbackLlm);
    kernel
        .manager
        .register_agent(
            Arc::new(DefaultAgent::new(agent_id.clone())),
            llm,
            Arc::new(NoSkills),
        )
        .context("registering agent")?;

    let mut events = kernel.subscribe_events();
    kernel.start();

    let task_id = kernel.service.create_task(orchard_kernel::CreateTaskParams {
        title,
        intent,
        priority: Default::default(),
        agent_id,
        parent_task_id: None,
        author_actor_id: "cli".into(),
    })?;
    println!("task {task_id}");

    while let Some(event) = events.recv().await {
        if event.stream_id != task_id {
            continue;
        }
        match event.kind {
            EventKind::TaskCompleted => {
                let task = kernel.projection.get_task(&task_id);
                println!("done: {}", task.and_then(|t| t.summary).unwrap_or_default());
                break;
            }
            EventKind::TaskFailed => {
                let task = kernel.projection.get_task(&task_id);
                println!(
                    "failed: {}",
                    task.and_then(|t| t.failure_reason).unwrap_or_default()
                );
                break;
            }
            EventKind::TaskCanceled => {
                println!("canceled");
                break;
            }
            _ => {}
        }
    }

    kernel.shutdown();
    Ok(())
}
