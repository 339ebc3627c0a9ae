use std::path::Path;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use tgs_core::config::{
    load_dotenv_if_present, load_persisted_config, ServiceArgs, ServiceConfig,
    SupervisorSettings, DEFAULT_SUPERVISED_WORKER_PORT,
};
use tgs_http::{
    management::{self, ManagementState},
    proxy::WorkerProxy,
    server,
};
use tgs_supervisor::ProcessSupervisor;

/// Keeps the `tgs` worker running and exposes its management API.
#[derive(Debug, Parser)]
#[command(name = "tgs-supervisor", version)]
struct Cli {
    #[command(flatten)]
    service: ServiceArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_if_present(Path::new(".env"));
    let cli = Cli::parse();
    tgs_core::logging::init("tgs-supervisor")?;

    let settings = SupervisorSettings::from_env();
    let mut cfg = ServiceConfig::from_args(cli.service, DEFAULT_SUPERVISED_WORKER_PORT);
    if let Some(path) = &settings.config_file {
        match load_persisted_config(path) {
            Ok(Some(saved)) => {
                tracing::info!(path = %path.display(), "using persisted config");
                cfg = saved;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config file"),
        }
    }

    if cfg.port == settings.management_port {
        anyhow::bail!(
            "worker port {} collides with the management port; set PORT or TGS_MANAGEMENT_PORT",
            cfg.port
        );
    }
    tracing::info!(
        config = %cfg.redacted(),
        worker_bin = %settings.worker_bin.display(),
        "starting supervisor"
    );

    let supervisor = ProcessSupervisor::new(settings.clone(), cfg.clone());
    let startable = cfg.is_configured() && cfg.validate().is_ok();
    if settings.auto_start && startable {
        match supervisor.start().await {
            Ok(outcome) => tracing::info!(pid = outcome.pid(), "worker auto-started"),
            Err(e) => tracing::error!(error = %e, "auto-start failed"),
        }
    } else {
        tracing::info!(
            auto_start = settings.auto_start,
            configured = startable,
            "worker not auto-started"
        );
    }

    let app = management::router(ManagementState::new(supervisor.clone(), WorkerProxy::new()?));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        on_signal.cancel();
    });

    let served = server::serve(settings.management_port, app, cancel.clone()).await;
    cancel.cancel();

    if let Err(e) = supervisor.shutdown().await {
        tracing::error!(error = %e, "failed to stop worker during shutdown");
    }
    served?;

    tracing::info!("supervisor stopped");
    Ok(())
}
