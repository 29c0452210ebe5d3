//! `finagent` binary: HTTP server plus the sandbox worker subcommand.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use finagent_backend::{build_router, AppState, RuntimePaths};

#[derive(Parser)]
#[command(name = "finagent", about = "Strategy execution and experiment backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API server.
    Serve {
        #[arg(long, default_value = "127.0.0.1", env = "FIN_AGENT_HOST")]
        host: String,
        #[arg(long, default_value_t = 8787, env = "FIN_AGENT_PORT")]
        port: u16,
    },
    /// Internal: execute strategy code inside the resource-limited sandbox.
    /// Spawned by the sandbox runner; not intended for direct use.
    SandboxWorker,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::SandboxWorker) => {
            // No tracing init: the worker's stdout/stderr are part of the
            // sandbox contract.
            finagent_backend::code_strategy::run_sandbox_worker()
        }
        Some(Command::Serve { host, port }) => serve(host, port),
        None => serve("127.0.0.1".to_string(), 8787),
    }
}

fn serve(host: String, port: u16) -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let paths = RuntimePaths::from_env();
        let app = AppState::open(paths.clone())?;
        let router = build_router(app);

        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, root = %paths.root().display(), "finagent backend listening");
        axum::serve(listener, router).await?;
        Ok::<_, anyhow::Error>(())
    })
}
