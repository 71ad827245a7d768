//! One-shot health probe, meant for container `HEALTHCHECK` instructions.
//! Uses the same configuration sources as `keel-agent` and exits 0 when healthy.

use keel_agent::{HealthProbe, HttpProbe, ServiceSpec};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let spec = ServiceSpec::load_health()?;
    let probe = HttpProbe::from_spec(&spec)?;
    match probe.check().await {
        Ok(()) => {
            println!("healthy: {}", probe.url());
            Ok(())
        }
        Err(e) => {
            eprintln!("unhealthy: {e}");
            std::process::exit(1);
        }
    }
}
