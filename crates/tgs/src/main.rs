use std::{path::Path, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tgs_core::{
    backend::{
        memory::MemoryBackend,
        throttled::{ThrottleConfig, ThrottledBackend},
        ChatBackend,
    },
    config::{load_dotenv_if_present, ServiceArgs, ServiceConfig, DEFAULT_WORKER_PORT},
};
use tgs_http::{
    server,
    worker::{self, WorkerState},
};
use tgs_telegram::{listener::LinkListener, TelegramBackend};

/// Upload gateway that stores files in a Telegram channel.
#[derive(Debug, Parser)]
#[command(name = "tgs", version)]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,

    /// Keep uploads in memory instead of Telegram (lost on exit)
    #[arg(long, env = "TGS_MEMORY_BACKEND", default_value_t = false)]
    memory_backend: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_if_present(Path::new(".env"));
    let cli = Cli::parse();
    tgs_core::logging::init("tgs")?;

    let cfg = ServiceConfig::from_args(cli.service, DEFAULT_WORKER_PORT);
    cfg.validate()?;
    tracing::info!(config = %cfg.redacted(), "starting worker");

    let cancel = CancellationToken::new();

    let backend: Option<Arc<dyn ChatBackend>> = if cli.memory_backend {
        tracing::warn!("using in-memory backend, uploads are lost on exit");
        Some(Arc::new(MemoryBackend::new()))
    } else if cfg.is_configured() {
        let telegram = TelegramBackend::new(&cfg)?;
        let listener = LinkListener::new(telegram.bot(), &cfg)?;
        tokio::spawn(listener.run(cancel.child_token()));
        Some(Arc::new(ThrottledBackend::new(
            Arc::new(telegram),
            ThrottleConfig::default(),
        )))
    } else {
        tracing::warn!("TOKEN or TARGET not set, uploads answer tgstate_not_configured");
        None
    };

    let app = worker::router(WorkerState::new(&cfg, backend), cfg.password().is_some());

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        on_signal.cancel();
    });

    let served = server::serve(cfg.port, app, cancel.clone()).await;
    cancel.cancel();
    served?;

    tracing::info!("worker stopped");
    Ok(())
}
