use anyhow::Context;
use keel_build::{BuildError, CommandRunner, Constraints, report, runner::env_flag};
use tracing_subscriber::EnvFilter;

async fn build(text: &str, constraints: Constraints, plan_only: bool) -> Result<(), BuildError> {
    let requirements = keel_build::parse_requirements(text)?;
    let plan = keel_build::resolve(&requirements, constraints)?;

    if plan_only {
        let json = serde_json::to_string_pretty(&plan)
            .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"));
        println!("{json}");
        return Ok(());
    }

    tracing::info!(
        requirements = requirements.len(),
        steps = plan.steps.len(),
        binary_only = constraints.binary_only,
        memory_limited = constraints.memory_limited,
        offline_cache_allowed = constraints.offline_cache_allowed,
        "resolved build plan"
    );

    let mut runner = CommandRunner::from_env();
    let report = keel_build::execute(&plan, &mut runner).await?;
    tracing::info!(steps_run = report.records.len(), "build complete");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "requirements.txt".to_string());
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("read requirements file {path}"))?;

    let constraints = Constraints::from_env();
    if let Err(e) = build(&text, constraints, env_flag("KEEL_PLAN_ONLY")).await {
        tracing::error!(error = %e, "build failed");
        eprintln!("{}", report::encode(&e));
        std::process::exit(report::exit_code(&e));
    }

    Ok(())
}
