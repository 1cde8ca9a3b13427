use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use v2note_gateway::Config;
use v2note_gateway::api::{ApiServer, AppState};
use v2note_gateway::asr::DashScopeRecognizer;
use v2note_gateway::background::BackgroundTasks;
use v2note_gateway::db::{self, SqliteStore};
use v2note_gateway::llm::OpenAiCompatClient;
use v2note_gateway::pipeline::PipelineDeps;
use v2note_gateway::prompt::load_agent_prompt;
use v2note_gateway::session::SessionStore;
use v2note_gateway::skills::SkillLoader;
use v2note_gateway::storage::FsAudioStore;
use v2note_gateway::tools::{ToolRegistry, load_tools_config};

/// v2note gateway - real-time dialogue gateway for voice journaling
#[derive(Parser)]
#[command(name = "v2note-gateway", version, about)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "V2NOTE_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,v2note_gateway=info",
        1 => "info,v2note_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    tracing::info!(
        port = config.server.port,
        data_dir = %config.server.data_dir.display(),
        model = %config.llm.model,
        "starting v2note gateway"
    );

    let pool = db::init(config.database_path())?;
    let store = Arc::new(SqliteStore::new(pool));
    let llm = Arc::new(OpenAiCompatClient::from_config(&config.llm));

    let tools = Arc::new(ToolRegistry::new());
    if let Some(path) = &config.server.tools_config_path {
        match load_tools_config(path) {
            Ok(servers) => {
                let connected = tools.register_all(servers).await;
                tracing::info!(connected, path = %path.display(), "tool servers registered");
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to load tool config"),
        }
    }

    let sessions = SessionStore::new(config.session.clone());
    let sweeper = sessions.spawn_sweeper();

    let deps = PipelineDeps {
        store,
        llm,
        tools: Arc::clone(&tools),
        skills: SkillLoader::new(&config.server.skills_dir),
        sessions,
        background: BackgroundTasks::new(),
        agent_prompt: load_agent_prompt(config.server.agent_prompt_path.as_deref()).into(),
    };
    let state = AppState::new(
        deps,
        Arc::new(DashScopeRecognizer::new(&config.asr)),
        Arc::new(FsAudioStore::new(config.server.data_dir.join("audio"))),
    );

    let server = ApiServer::new(Arc::new(state), config.server.port);
    server.run(shutdown_signal()).await?;

    tracing::info!("shutting down");
    sweeper.abort();
    tools.unregister_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
