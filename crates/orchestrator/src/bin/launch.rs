//! Launcher binary entry point
//!
//! Runs a training or evaluation job, or one of its workers when re-executed
//! with the hidden `worker` subcommand.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "orchestrator=info,worker_pool=info,dataset_cache=info,launch_core=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = orchestrator::run_cli(std::env::args_os()).await;
    std::process::exit(code);
}
