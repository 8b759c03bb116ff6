use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

use research_agent::{
    config::Config,
    fetch::HttpFetcher,
    gateway::ToolGateway,
    llm::LLM,
    routes::create_router,
    search::SerpApiClient,
    session::{ResearchEvent, SessionManager},
    utils::init_logger,
    AppState,
};

#[derive(Parser)]
#[command(name = "research-agent", version)]
#[command(about = "Plans web searches, gathers evidence, and writes a cited report")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Research a single question and print the report
    Ask {
        question: String,

        /// Maximum research rounds (overrides RESEARCH_MAX_ROUNDS)
        #[arg(long)]
        max_rounds: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    let _log_guard = init_logger(config.log_dir.as_deref());

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Ask { question, max_rounds } => {
            if let Some(max_rounds) = max_rounds {
                config.research.max_rounds = max_rounds;
                config.research.validate()?;
            }
            ask(config, &question).await
        }
    }
}

fn build_sessions(config: &Config) -> anyhow::Result<SessionManager> {
    if !config.llm.has_api_key() {
        warn!(provider = %config.llm.provider, "No LLM API key configured, model calls will fail");
    }
    if config.search.serpapi_key.is_empty() {
        warn!("SERPAPI_API_KEY is not set, searches will fail");
    }

    let llm = LLM::from_config(&config.llm).context("invalid LLM configuration")?;
    let gateway = ToolGateway::new(
        Arc::new(llm),
        Arc::new(SerpApiClient::from_config(&config.search)),
        Arc::new(HttpFetcher::new()),
        &config.gateway,
    );

    Ok(SessionManager::new(
        Arc::new(gateway),
        config.research.clone(),
        config.sessions.clone(),
    ))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Configuration loaded: {:?}", config.server);

    let sessions = build_sessions(&config)?;
    let reaper = sessions.spawn_reaper();

    let state = AppState {
        config: config.clone(),
        sessions: sessions.clone(),
    };
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HOST/PORT")?;
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    reaper.abort();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(sessions: SessionManager) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested, cancelling running sessions");
        sessions.cancel_all().await;
    }
}

async fn ask(config: Config, question: &str) -> anyhow::Result<()> {
    let sessions = build_sessions(&config)?;
    let session_id = sessions.start(question).await?;
    let mut events = Box::pin(sessions.stream(session_id).await?);

    let interrupt = sessions.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupt.cancel(session_id).await;
        }
    });

    while let Some(event) = events.next().await {
        match event {
            ResearchEvent::RoundStarted { round, queries } => {
                eprintln!("Round {}: searching {}", round, queries.join(" | "));
            }
            ResearchEvent::RoundComplete {
                round,
                evidence_count,
                total_evidence,
                failed_queries,
            } => {
                eprintln!(
                    "Round {} complete: {} new evidence items ({} total), {} failed queries",
                    round,
                    evidence_count,
                    total_evidence,
                    failed_queries.len()
                );
            }
            ResearchEvent::ReportReady { report } => {
                if report.flags.budget_exhausted {
                    eprintln!("Note: research budget exhausted before the evidence was judged sufficient");
                }
                if report.flags.unverified_sufficiency {
                    eprintln!("Note: evidence sufficiency could not be verified");
                }
                println!("{}", report.markdown);
                if !report.sources.is_empty() {
                    println!("Sources:");
                    for source in &report.sources {
                        println!("- [{}] {} ({})", source.id, source.title, source.url);
                    }
                }
                return Ok(());
            }
            ResearchEvent::SessionFailed { error_kind, message } => bail!("{}: {}", error_kind, message),
            ResearchEvent::SessionCancelled => bail!("research cancelled"),
        }
    }

    bail!("session {} ended without a result", session_id)
}
