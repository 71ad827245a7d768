use keel_agent::{HttpProbe, OsLauncher, ServiceSpec, Supervisor, signals, status_file};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let spec = ServiceSpec::load()?;
    // Handlers go in before the child exists so an early stop is never lost.
    let control = signals::listen()?;
    let probe = HttpProbe::from_spec(&spec)?;

    let status_path = spec.status_file.clone();
    let command = spec.command.clone();
    let health_url = spec.health_url.clone();
    let supervisor = Supervisor::new(spec, OsLauncher, probe, control);
    tracing::info!(
        run_id = %supervisor.run_id(),
        %command,
        %health_url,
        "keel-agent starting"
    );
    let writer = status_path.map(|path| status_file::spawn_writer(path, supervisor.status()));

    let outcome = supervisor.run().await;
    if let Some(writer) = writer {
        // The writer flushes the final status once the supervisor is gone.
        if let Err(e) = writer.await {
            tracing::warn!(error = %e, "status writer failed");
        }
    }

    tracing::info!(
        exit_code = outcome.exit_code,
        reason = ?outcome.reason,
        restart_count = outcome.restart_count,
        "keel-agent exiting"
    );
    std::process::exit(outcome.exit_code);
}
