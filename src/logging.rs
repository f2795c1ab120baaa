use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize the tracing subscriber for the daemon.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("swarmsync=debug")
        } else {
            EnvFilter::new("swarmsync=info")
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    info!("swarmsync logging initialized");
    Ok(())
}

/// Initialize logging, falling back to stderr output if the subscriber
/// cannot be installed (e.g. a second init in tests).
pub fn init_logging_safe() {
    if let Err(e) = init_logging() {
        eprintln!("Warning: failed to set up logging: {}. Continuing without subscriber.", e);
    }
}

/// Log a discovery event (beacon, liveness transition).
pub fn log_discovery_event(event: &str, details: &str) {
    info!(target: "swarm::discovery", "{}: {}", event, details);
}

/// Log a transfer milestone for one relative path.
pub fn log_transfer_event(operation: &str, path: &str, details: &str) {
    info!(target: "swarm::transfer", "{} {}: {}", operation, path, details);
}

/// Log an error with its originating context.
pub fn log_error_with_context(context: &str, error: &dyn std::error::Error) {
    error!(target: "swarm::error", "{}: {}", context, error);
}
