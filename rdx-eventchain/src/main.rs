use anyhow::{Context, Result};
use clap::Parser;
use eventchain::prelude::*;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Runs the reference event-chain simulation.
#[derive(Debug, Parser)]
#[command(name = "chaindev", version, about)]
struct Options {
    /// TOML configuration file. The built-in graph is used when omitted.
    config: Option<PathBuf>,

    /// Compute candidate times on worker tasks.
    #[arg(long)]
    coordinated: bool,

    /// Computations in flight at once with --coordinated.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Write a snapshot of the finished run to this file.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize structured logging, honouring RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load the configuration, or fall back to the built-in graph.
    let options = Options::parse();
    let config = match &options.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    // 3. Wire the mediator over the reference ledger.
    let context = EngineContext::new(config);
    let mediator = reference_mediator(context)?;
    spawn_event_listener(&mediator);

    // 4. Stop cleanly between two commits on Ctrl+C.
    let stop = mediator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping after the current commit");
            stop.stop();
        }
    });

    // 5. Run.
    let (summary, mediator) = if options.coordinated {
        let mut coordinator = Coordinator::new(mediator, options.workers);
        let summary = coordinator.run().await?;
        (summary, coordinator.into_inner())
    } else {
        tokio::task::spawn_blocking(move || {
            let mut mediator = mediator;
            mediator.run().map(|summary| (summary, mediator))
        })
        .await
        .context("mediator task panicked")??
    };

    let ledger = mediator.state();
    info!(
        reason = ?summary.reason,
        commits = summary.commits,
        final_time = %summary.final_time,
        lifts = ledger.lifts,
        samples = ledger.samples,
        chains = ledger.chains_ended,
        "run finished"
    );
    for (tag, commits) in mediator.stats().per_tag {
        info!(tag = %tag, commits, "per-tag commits");
    }

    if let Some(path) = options.snapshot {
        mediator.snapshot().save(&path)?;
    }
    Ok(())
}

/// Logs the mediator's notifications as they arrive.
fn spawn_event_listener<S: StateHandler, H: EventHandler<S>>(mediator: &Mediator<S, H>) {
    let mut events = mediator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event @ (MediatorEvent::Committed { .. } | MediatorEvent::Trashed { .. })) => {
                    debug!("[EVENT] => {:?}", event)
                }
                Ok(event @ MediatorEvent::Failed { .. }) => warn!("[EVENT] => {:?}", event),
                Ok(event) => info!("[EVENT] => {:?}", event),
                Err(RecvError::Lagged(missed)) => debug!(missed, "event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_line_definition_is_consistent() {
        Options::command().debug_assert();
    }

    #[test]
    fn defaults_to_a_sequential_run_of_the_built_in_graph() {
        let options = Options::try_parse_from(["chaindev"]).unwrap();
        assert!(options.config.is_none());
        assert!(!options.coordinated);
        assert_eq!(options.workers, 4);
        assert!(options.snapshot.is_none());
    }

    #[test]
    fn reads_config_and_flags() {
        let options = Options::try_parse_from([
            "chaindev",
            "run.toml",
            "--coordinated",
            "--workers",
            "8",
            "--snapshot",
            "out.json",
        ])
        .unwrap();
        assert_eq!(options.config, Some(PathBuf::from("run.toml")));
        assert!(options.coordinated);
        assert_eq!(options.workers, 8);
        assert_eq!(options.snapshot, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(Options::try_parse_from(["chaindev", "--workers", "many"]).is_err());
        assert!(Options::try_parse_from(["chaindev", "--fast"]).is_err());
    }
}
