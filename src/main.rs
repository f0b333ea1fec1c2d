//! Mother CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use mother::agent::RunnerDeps;
use mother::config::{Config, SandboxMode};
use mother::error::Error;
use mother::guard::{CommandGuard, PathGuard};
use mother::llm::anthropic::AnthropicBackend;
use mother::orchestrator::Orchestrator;
use mother::sandbox::Executor;
use mother::scheduler::EventScheduler;
use mother::store::ChannelStore;
use mother::transport::{ChatTransport, CliTransport, DiscordTransport, InboundReceiver};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mother", version)]
#[command(about = "A Discord-connected autonomous agent host")]
struct Cli {
    /// Sandbox: "host", or the name of a running container that mounts the
    /// workspace at /workspace
    #[arg(long, default_value = "host")]
    sandbox: String,

    /// Drive the orchestrator from stdin/stdout instead of Discord
    #[arg(long)]
    cli: bool,

    /// Workspace directory
    working_directory: PathBuf,
}

fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mother=debug")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to build runtime: {error}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Sandbox(message)) => {
            eprintln!("sandbox error: {message}");
            ExitCode::from(2)
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> mother::Result<()> {
    let workspace = cli
        .working_directory
        .canonicalize()
        .map_err(|error| {
            Error::Config(format!(
                "working directory {}: {error}",
                cli.working_directory.display()
            ))
        })?;
    std::env::set_current_dir(&workspace)
        .with_context(|| format!("failed to enter {}", workspace.display()))?;

    let config = Config::load(workspace.clone(), SandboxMode::parse(&cli.sandbox), cli.cli)?;

    mother::workspace::bootstrap(&workspace).await?;

    let executor = match &config.sandbox {
        SandboxMode::Host => Arc::new(Executor::host(workspace.clone())),
        SandboxMode::Container(name) => {
            Arc::new(Executor::container(name, workspace.clone()).await?)
        }
    };
    tracing::info!(
        workspace = %workspace.display(),
        sandbox = ?config.sandbox,
        model = %config.model_id,
        "mother starting"
    );

    let path_guard = Arc::new(PathGuard::new(
        executor.workspace_path(),
        &config.allowed_paths,
    ));
    let command_guard = Arc::new(CommandGuard::new(&config.command_overrides));
    let store = ChannelStore::new(workspace.clone(), reqwest::Client::new());
    let backend = Arc::new(AnthropicBackend::new(
        config.llm_url.clone(),
        config.api_key.clone(),
        config.model_id.clone(),
    ));

    // transport selection: Discord gateway or the stdin/stdout loop
    let (transport, inbound, discord): (
        Arc<dyn ChatTransport>,
        InboundReceiver,
        Option<Arc<DiscordTransport>>,
    ) = if config.cli {
        let cli_transport = Arc::new(CliTransport::new());
        let inbound = cli_transport.start();
        (cli_transport, inbound, None)
    } else {
        let token = config
            .bot_token
            .clone()
            .ok_or_else(|| Error::Config("BOT_TOKEN is required".into()))?;
        let discord = Arc::new(DiscordTransport::new(token, config.guild_id));
        let inbound = discord.start().await?;
        (discord.clone(), inbound, Some(discord))
    };

    let deps = RunnerDeps {
        store,
        executor,
        path_guard,
        command_guard,
        backend,
        transport,
        models: Arc::new(config.models.clone()),
        model_id: config.model_id.clone(),
        delegate_bin: config.delegate_bin.clone(),
    };
    let orchestrator = Orchestrator::new(deps);

    let scheduler = EventScheduler::new(&workspace, orchestrator.event_sink());
    tokio::spawn(async move {
        if let Err(error) = scheduler.run().await {
            tracing::error!(%error, "event scheduler failed");
        }
    });

    let mut inbound = inbound;
    loop {
        tokio::select! {
            event = inbound.recv() => {
                let Some(event) = event else {
                    tracing::info!("inbound stream closed, shutting down");
                    break;
                };
                if let Some(discord) = &discord {
                    let bot_id = discord.bot_user_id().await.map(|id| id.to_string());
                    orchestrator.set_bot_user_id(bot_id).await;
                }
                orchestrator.handle_inbound(event).await;
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    tracing::warn!(%error, "ctrl-c handler failed");
                }
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    Ok(())
}
