pub mod clock;
pub mod config;
pub mod deleter;
pub mod error;
pub mod mirror;
pub mod orchestrator;
pub mod output;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod types;


use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    clock::Clock,
    config::Configuration,
    error::PruneError,
    orchestrator::{PruneOrchestrator, RunReport, RunSettings, deadline_guard},
    registry::RegistryClient,
};

/// Connects to every configured registry and runs one prune pass.
///
/// `cancel` stops the run from starting new repository work. A configured
/// deadline cancels a child of it, never the caller's token.
pub async fn run(config: &Configuration, cancel: CancellationToken) -> Result<RunReport, PruneError> {
    let primaries = registry::connect(&config.primary).await?;

    let mirrors: Vec<Arc<dyn RegistryClient>> = match &config.mirror {
        Some(mirror) => registry::connect(mirror).await?,
        None => vec![],
    };

    info!(
        primaries = primaries.len(),
        mirrors = mirrors.len(),
        "Connected to registries"
    );

    let orchestrator = PruneOrchestrator::new(primaries, mirrors, RunSettings::from(config), Clock::new());

    let run_token = cancel.child_token();
    let deadline = config
        .deadline
        .map(|deadline| deadline_guard(&run_token, deadline));

    let report = orchestrator.run(run_token.clone()).await;

    if let Some(deadline) = deadline {
        deadline.abort();
    }

    report
}
